pub mod auth;
pub mod error;
pub mod handler;
pub mod request;
pub mod response;
pub mod wrapper;
pub mod ws;

use std::sync::Arc;

use axum::routing::get;
use axum::{Extension, Router};
use tower_http::cors::{Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::relay::RelayShared;

pub fn router(shared: RelayShared) -> Router {
    let db = Arc::new(shared.db.clone());
    Router::new()
        .route("/ws/aichat/", get(ws::new_chat_socket))
        .route("/ws/aichat/{chat_id}/", get(ws::chat_socket))
        .route("/api/chats", get(handler::list_chats))
        .route("/api/chats/{id}", get(handler::get_chat))
        .route("/api/config", get(handler::get_config).put(handler::update_config))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", handler::ApiDoc::openapi()))
        .layer(Extension(db))
        .layer(Extension(shared))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::database::setup_memory_database;
    use crate::naming::NamingQueue;
    use crate::relay::render::Renderer;
    use crate::store;
    use chat_relay_entity::message::Role;

    async fn app() -> (Router, sea_orm::DatabaseConnection) {
        let db = setup_memory_database().await.unwrap();
        let (naming, _jobs) = NamingQueue::channel();
        let shared = RelayShared {
            db: db.clone(),
            naming,
            renderer: Arc::new(Renderer::new().unwrap()),
        };
        (router(shared), db)
    }

    async fn call(app: &Router, uri: &str, token: Option<&str>) -> (StatusCode, Value) {
        send(app, Method::GET, uri, token, None).await
    }

    async fn send(
        app: &Router,
        method: Method,
        uri: &str,
        token: Option<&str>,
        json: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let body = match json {
            Some(json) => {
                request = request.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn test_requests_without_valid_token_are_rejected() {
        let (app, _db) = app().await;
        assert_eq!(call(&app, "/api/chats", None).await.0, StatusCode::UNAUTHORIZED);
        assert_eq!(call(&app, "/api/chats", Some("bogus")).await.0, StatusCode::UNAUTHORIZED);
        assert_eq!(call(&app, "/ws/aichat/", None).await.0, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_chats_are_scoped_to_owner() {
        let (app, db) = app().await;
        let alice = store::create_user(&db, "alice", false).await.unwrap();
        let bob = store::create_user(&db, "bob", false).await.unwrap();
        let conversation = store::create_conversation(&db, alice.id).await.unwrap();
        store::save_message(&db, conversation.id, Role::Human, "hello").await.unwrap();
        store::save_message(&db, conversation.id, Role::Assistant, "hi there").await.unwrap();

        let (status, body) = call(&app, "/api/chats", Some(&alice.token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status_code"], 200);
        assert_eq!(body["data"]["chats"][0]["name"], "Unnamed Chat");

        let uri = format!("/api/chats/{}", conversation.id);
        let (status, body) = call(&app, &uri, Some(&alice.token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["messages"][0]["role"], "human");
        assert_eq!(body["data"]["messages"][1]["content"], "hi there");

        assert_eq!(call(&app, &uri, Some(&bob.token)).await.0, StatusCode::NOT_FOUND);
        let (_, body) = call(&app, "/api/chats", Some(&bob.token)).await;
        assert_eq!(body["data"]["chats"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_socket_for_foreign_conversation_is_refused() {
        let (app, db) = app().await;
        let alice = store::create_user(&db, "alice", false).await.unwrap();
        let bob = store::create_user(&db, "bob", false).await.unwrap();
        let conversation = store::create_conversation(&db, alice.id).await.unwrap();

        let uri = format!("/ws/aichat/{}/?token={}", conversation.id, bob.token);
        assert_eq!(call(&app, &uri, None).await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_config_is_admin_only() {
        let (app, db) = app().await;
        let bob = store::create_user(&db, "bob", false).await.unwrap();
        let root = store::create_user(&db, "root", true).await.unwrap();

        assert_eq!(call(&app, "/api/config", Some(&bob.token)).await.0, StatusCode::FORBIDDEN);
        let update = serde_json::json!({
            "key": "llm",
            "value": {"base_url": "http://attacker.invalid/v1", "model": "gpt-4o"},
        });
        let (status, _) = send(&app, Method::PUT, "/api/config", Some(&bob.token), Some(update)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_ne!(crate::config::current().llm.base_url, "http://attacker.invalid/v1");

        let (status, body) = call(&app, "/api/config", Some(&root.token)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["data"]["config"]["llm"]["model"].is_string());

        // 写回当前监听地址，不改变其它测试依赖的全局配置
        let bind_address = crate::config::current().bind_address.clone();
        let update = serde_json::json!({"key": "bind_address", "value": bind_address});
        let (status, body) = send(&app, Method::PUT, "/api/config", Some(&root.token), Some(update)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["key"], "bind_address");
    }
}
