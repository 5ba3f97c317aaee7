use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use chat_relay_migration::{Migrator, MigratorTrait};
use sea_orm::sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sea_orm::{DatabaseConnection, SqlxSqliteConnector};
use tracing::debug;

/// 创建 SQLite 连接选项
fn create_sqlite_options(path: &Path) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(30))
        .optimize_on_close(true, None)
        .pragma("temp_store", "MEMORY")
}

async fn database_connection(path: &Path) -> Result<DatabaseConnection> {
    let pool = SqlitePoolOptions::new()
        .max_connections(16)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .connect_with(create_sqlite_options(path))
        .await?;
    debug!("SQLite 连接池已创建: {}", path.display());
    Ok(SqlxSqliteConnector::from_sqlx_sqlite_pool(pool))
}

async fn migrate_database(path: &Path) -> Result<()> {
    if !path.exists() {
        debug!("数据库文件不存在，将创建新的数据库");
    } else {
        debug!("检测到现有数据库文件，将在必要时应用迁移");
    }

    // 迁移使用单连接池，避免多连接导致的迁移顺序问题
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(create_sqlite_options(path))
        .await?;
    let connection = SqlxSqliteConnector::from_sqlx_sqlite_pool(pool.clone());
    Migrator::up(&connection, None).await?;

    // 显式关闭连接池，释放数据库锁
    pool.close().await;
    debug!("迁移完成，已关闭迁移连接池");
    Ok(())
}

/// 进行数据库迁移并获取数据库连接
pub async fn setup_database(dir: &Path) -> Result<DatabaseConnection> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join("data.sqlite");
    migrate_database(&path).await?;
    database_connection(&path).await
}

/// 测试用的内存数据库，已应用全部迁移
#[cfg(test)]
pub async fn setup_memory_database() -> Result<DatabaseConnection> {
    use std::str::FromStr;

    // 内存库随连接销毁，必须固定为单连接且不回收
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    let connection = SqlxSqliteConnector::from_sqlx_sqlite_pool(pool);
    Migrator::up(&connection, None).await?;
    Ok(connection)
}
