mod api;
mod completion;
mod config;
mod database;
mod naming;
mod relay;
mod store;
mod utils;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::{Command, ConfigManager, UserCommand, ARGS, CONFIG_DIR};
use crate::naming::NamingQueue;
use crate::relay::render::Renderer;
use crate::relay::RelayShared;

#[tokio::main]
async fn main() -> Result<()> {
    utils::init_logger(&ARGS.log_level)?;

    let db = database::setup_database(&CONFIG_DIR)
        .await
        .with_context(|| format!("初始化数据库失败: {}", CONFIG_DIR.display()))?;

    if let Some(Command::User(UserCommand::Add { username, admin })) = &ARGS.command {
        let user = store::create_user(&db, username, *admin).await?;
        info!("已创建用户 {}，管理员: {}", user.username, user.is_admin);
        println!("{}", user.token);
        return Ok(());
    }

    info!("chat-relay v{} 启动中，配置目录: {}", env!("CARGO_PKG_VERSION"), CONFIG_DIR.display());

    let mut cfg = ConfigManager::new(db.clone()).load_or_init().await?;
    if let Some(bind_address) = &ARGS.bind_address {
        cfg.bind_address = bind_address.clone();
    }
    for problem in cfg.check() {
        warn!("配置检查: {}", problem);
    }
    let bind_address = cfg.bind_address.clone();
    config::reload(cfg);

    let (naming, jobs) = NamingQueue::channel();
    tokio::spawn(naming::run_naming_worker(db.clone(), jobs));

    let shared = RelayShared {
        db,
        naming,
        renderer: Arc::new(Renderer::new()?),
    };
    let app = api::router(shared);

    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("绑定地址 {} 失败", bind_address))?;
    info!("开始监听 http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("服务已退出");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("监听退出信号失败: {}", e);
        std::future::pending::<()>().await;
    }
    info!("收到退出信号，正在关闭服务");
}
