use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;

use crate::config::Config;
use chat_relay_entity::{conversation, message};

#[derive(Serialize, ToSchema)]
pub struct ConversationInfo {
    pub id: i32,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<conversation::Model> for ConversationInfo {
    fn from(model: conversation::Model) -> Self {
        Self {
            id: model.id,
            name: model.name,
            created_at: model.created_at,
            updated_at: model.updated_at,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct MessageInfo {
    pub id: i32,
    /// human 或 assistant
    pub role: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl From<message::Model> for MessageInfo {
    fn from(model: message::Model) -> Self {
        Self {
            id: model.id,
            role: model.role.to_string(),
            content: model.content,
            created_at: model.created_at,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct ChatsResponse {
    pub chats: Vec<ConversationInfo>,
}

#[derive(Serialize, ToSchema)]
pub struct ChatResponse {
    pub chat: ConversationInfo,
    pub messages: Vec<MessageInfo>,
}

#[derive(Serialize, ToSchema)]
pub struct ConfigResponse {
    pub config: Config,
}

#[derive(Serialize, ToSchema)]
pub struct UpdateConfigResponse {
    pub key: String,
    pub config: Config,
}
