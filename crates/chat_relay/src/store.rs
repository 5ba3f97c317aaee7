//! 会话与消息的持久化操作

use anyhow::{anyhow, Result};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use tracing::debug;

use chat_relay_entity::conversation::DEFAULT_CONVERSATION_NAME;
use chat_relay_entity::message::Role;
use chat_relay_entity::{conversation, message, user};

/// 创建用户并生成随机 token，管理员才能读写全局配置
pub async fn create_user(db: &DatabaseConnection, username: &str, is_admin: bool) -> Result<user::Model> {
    let username = username.trim();
    if username.is_empty() {
        return Err(anyhow!("用户名不能为空"));
    }
    let token = uuid::Uuid::new_v4().simple().to_string();
    let model = user::ActiveModel {
        username: Set(username.to_string()),
        token: Set(token),
        is_admin: Set(is_admin),
        created_at: Set(Utc::now()),
        ..Default::default()
    }
    .insert(db)
    .await?;
    Ok(model)
}

pub async fn find_user_by_token(db: &DatabaseConnection, token: &str) -> Result<Option<user::Model>> {
    Ok(user::Entity::find()
        .filter(user::Column::Token.eq(token))
        .one(db)
        .await?)
}

pub async fn create_conversation(db: &DatabaseConnection, user_id: i32) -> Result<conversation::Model> {
    let now = Utc::now();
    let model = conversation::ActiveModel {
        user_id: Set(user_id),
        name: Set(DEFAULT_CONVERSATION_NAME.to_string()),
        created_at: Set(now),
        updated_at: Set(now),
        ..Default::default()
    }
    .insert(db)
    .await?;
    debug!("用户 {} 创建会话 {}", user_id, model.id);
    Ok(model)
}

/// 查找属于指定用户的会话，不属于该用户时视为不存在
pub async fn find_owned_conversation(
    db: &DatabaseConnection,
    user_id: i32,
    conversation_id: i32,
) -> Result<Option<conversation::Model>> {
    Ok(conversation::Entity::find_by_id(conversation_id)
        .filter(conversation::Column::UserId.eq(user_id))
        .one(db)
        .await?)
}

/// 用户的全部会话，最近更新的在前
pub async fn list_conversations(db: &DatabaseConnection, user_id: i32) -> Result<Vec<conversation::Model>> {
    Ok(conversation::Entity::find()
        .filter(conversation::Column::UserId.eq(user_id))
        .order_by_desc(conversation::Column::UpdatedAt)
        .order_by_desc(conversation::Column::Id)
        .all(db)
        .await?)
}

/// 会话的全部消息，按 (created_at, id) 排序
pub async fn load_messages<C: ConnectionTrait>(db: &C, conversation_id: i32) -> Result<Vec<message::Model>> {
    Ok(message::Entity::find()
        .filter(message::Column::ConversationId.eq(conversation_id))
        .order_by_asc(message::Column::CreatedAt)
        .order_by_asc(message::Column::Id)
        .all(db)
        .await?)
}

/// 保存一条消息并刷新会话的 updated_at
pub async fn save_message(
    db: &DatabaseConnection,
    conversation_id: i32,
    role: Role,
    content: &str,
) -> Result<message::Model> {
    let now = Utc::now();
    let txn = db.begin().await?;
    let model = message::ActiveModel {
        conversation_id: Set(conversation_id),
        role: Set(role),
        content: Set(content.to_string()),
        created_at: Set(now),
        ..Default::default()
    }
    .insert(&txn)
    .await?;
    conversation::ActiveModel {
        id: Set(conversation_id),
        updated_at: Set(now),
        ..Default::default()
    }
    .update(&txn)
    .await?;
    txn.commit().await?;
    Ok(model)
}

pub async fn set_conversation_name(db: &DatabaseConnection, conversation_id: i32, name: &str) -> Result<()> {
    let updated = conversation::ActiveModel {
        id: Set(conversation_id),
        name: Set(name.to_string()),
        ..Default::default()
    }
    .update(db)
    .await;
    match updated {
        Ok(_) => Ok(()),
        Err(sea_orm::DbErr::RecordNotUpdated) => Err(anyhow!("会话 {} 不存在", conversation_id)),
        Err(e) => Err(e.into()),
    }
}
