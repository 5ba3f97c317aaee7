use std::sync::Arc;

use axum::extract::{Extension, Json, Path};
use sea_orm::DatabaseConnection;
use tracing::{info, warn};
use utoipa::OpenApi;

use crate::api::auth::{AdminUser, CurrentUser, OpenAPIAuth};
use crate::api::error::InnerApiError;
use crate::api::request::UpdateConfigItemRequest;
use crate::api::response::{ChatResponse, ChatsResponse, ConfigResponse, ConversationInfo, UpdateConfigResponse};
use crate::api::wrapper::{ApiError, ApiResponse};
use crate::config::{self, ConfigManager};
use crate::store;

#[derive(OpenApi)]
#[openapi(
    paths(list_chats, get_chat, get_config, update_config),
    modifiers(&OpenAPIAuth),
    security(
        ("Token" = []),
    )
)]
pub struct ApiDoc;

/// 列出当前用户的全部会话，最近更新的在前
#[utoipa::path(
    get,
    path = "/api/chats",
    responses(
        (status = 200, body = ApiResponse<ChatsResponse>),
    )
)]
pub async fn list_chats(
    CurrentUser(user): CurrentUser,
    Extension(db): Extension<Arc<DatabaseConnection>>,
) -> Result<ApiResponse<ChatsResponse>, ApiError> {
    let chats = store::list_conversations(db.as_ref(), user.id)
        .await?
        .into_iter()
        .map(ConversationInfo::from)
        .collect();
    Ok(ApiResponse::ok(ChatsResponse { chats }))
}

/// 获取单个会话及其全部消息
#[utoipa::path(
    get,
    path = "/api/chats/{id}",
    responses(
        (status = 200, body = ApiResponse<ChatResponse>),
    )
)]
pub async fn get_chat(
    Path(id): Path<i32>,
    CurrentUser(user): CurrentUser,
    Extension(db): Extension<Arc<DatabaseConnection>>,
) -> Result<ApiResponse<ChatResponse>, ApiError> {
    let Some(conversation) = store::find_owned_conversation(db.as_ref(), user.id, id).await? else {
        return Err(InnerApiError::NotFound(id).into());
    };
    let messages = store::load_messages(db.as_ref(), id)
        .await?
        .into_iter()
        .map(Into::into)
        .collect();
    Ok(ApiResponse::ok(ChatResponse {
        chat: conversation.into(),
        messages,
    }))
}

/// 获取当前配置，api_key 会被遮盖，仅限管理员
#[utoipa::path(
    get,
    path = "/api/config",
    responses(
        (status = 200, body = ApiResponse<ConfigResponse>),
        (status = 403, description = "非管理员"),
    )
)]
pub async fn get_config(AdminUser(_user): AdminUser) -> Result<ApiResponse<ConfigResponse>, ApiError> {
    Ok(ApiResponse::ok(ConfigResponse {
        config: config::current().masked(),
    }))
}

/// 更新一个顶层配置项，立即生效，仅限管理员
///
/// llm 中省略或仍为遮盖值的 api_key 会保留原有密钥
#[utoipa::path(
    put,
    path = "/api/config",
    request_body = UpdateConfigItemRequest,
    responses(
        (status = 200, body = ApiResponse<UpdateConfigResponse>),
        (status = 403, description = "非管理员"),
    )
)]
pub async fn update_config(
    AdminUser(user): AdminUser,
    Extension(db): Extension<Arc<DatabaseConnection>>,
    Json(request): Json<UpdateConfigItemRequest>,
) -> Result<ApiResponse<UpdateConfigResponse>, ApiError> {
    let manager = ConfigManager::new(db.as_ref().clone());
    let updated = match manager
        .update_config_item(&config::current(), &request.key, request.value)
        .await
    {
        Ok(updated) => updated,
        Err(e) => {
            warn!("更新配置项 {} 失败: {:#}", request.key, e);
            return Err(InnerApiError::BadRequest(format!("{:#}", e)).into());
        }
    };
    for problem in updated.check() {
        warn!("配置检查: {}", problem);
    }
    let masked = updated.masked();
    config::reload(updated);
    info!("用户 {} 更新了配置项 {}", user.username, request.key);
    Ok(ApiResponse::ok(UpdateConfigResponse {
        key: request.key,
        config: masked,
    }))
}
