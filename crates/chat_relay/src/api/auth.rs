use std::sync::Arc;

use anyhow::anyhow;
use axum::extract::{FromRequestParts, Query};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::{HeaderMap, Uri};
use sea_orm::DatabaseConnection;
use serde::Deserialize;
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::Modify;

use crate::api::error::InnerApiError;
use crate::api::wrapper::ApiError;
use crate::store;
use chat_relay_entity::user;

/// 通过 token 认证的当前用户
pub struct CurrentUser(pub user::Model);

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// 浏览器无法为 WebSocket 握手设置请求头，允许通过 ?token= 传递
fn query_token(uri: &Uri) -> Option<String> {
    let Query(query) = Query::<TokenQuery>::try_from_uri(uri).ok()?;
    query.token.filter(|token| !token.is_empty())
}

impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(token) = bearer_token(&parts.headers).or_else(|| query_token(&parts.uri)) else {
            return Err(InnerApiError::Unauthorized.into());
        };
        let db = parts
            .extensions
            .get::<Arc<DatabaseConnection>>()
            .cloned()
            .ok_or_else(|| anyhow!("数据库连接未注入"))?;
        match store::find_user_by_token(&db, &token).await? {
            Some(user) => Ok(CurrentUser(user)),
            None => Err(InnerApiError::Unauthorized.into()),
        }
    }
}

/// 管理员用户，全局配置只对管理员开放
pub struct AdminUser(pub user::Model);

impl<S> FromRequestParts<S> for AdminUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let CurrentUser(user) = CurrentUser::from_request_parts(parts, state).await?;
        if !user.is_admin {
            return Err(InnerApiError::Forbidden.into());
        }
        Ok(AdminUser(user))
    }
}

pub(super) struct OpenAPIAuth;

impl Modify for OpenAPIAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(schema) = openapi.components.as_mut() {
            schema.add_security_scheme(
                "Token",
                SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
            );
        }
    }
}
