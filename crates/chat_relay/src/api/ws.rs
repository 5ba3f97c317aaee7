//! 浏览器与中继之间的 WebSocket 连接
//!
//! 每个连接拆成三部分：读任务把文本帧放入队列，写任务把片段发给浏览器，
//! 当前任务按顺序逐条处理消息。任一方向断开都会取消正在进行的补全请求。

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, Path};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::api::auth::CurrentUser;
use crate::api::error::InnerApiError;
use crate::api::wrapper::ApiError;
use crate::completion::{ChatCompletion, CompletionProvider};
use crate::config;
use crate::relay::{ChatRelay, RelayShared};
use crate::store;
use chat_relay_entity::{conversation, user};

/// 新会话，第一条消息到达时才创建
pub async fn new_chat_socket(
    CurrentUser(user): CurrentUser,
    Extension(shared): Extension<RelayShared>,
    ws: WebSocketUpgrade,
) -> Response {
    accept(ws, shared, user, None)
}

/// 已有会话，握手前确认会话属于当前用户
pub async fn chat_socket(
    Path(chat_id): Path<i32>,
    CurrentUser(user): CurrentUser,
    Extension(shared): Extension<RelayShared>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    let Some(conversation) = store::find_owned_conversation(&shared.db, user.id, chat_id).await? else {
        return Err(InnerApiError::NotFound(chat_id).into());
    };
    // 会话校验先于协议升级校验
    match ws {
        Ok(ws) => Ok(accept(ws, shared, user, Some(conversation))),
        Err(rejection) => Ok(rejection.into_response()),
    }
}

fn accept(
    ws: WebSocketUpgrade,
    shared: RelayShared,
    user: user::Model,
    conversation: Option<conversation::Model>,
) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, shared, user, conversation))
}

async fn serve_socket(
    socket: WebSocket,
    shared: RelayShared,
    user: user::Model,
    conversation: Option<conversation::Model>,
) {
    let provider = match CompletionProvider::from_config(&config::current().llm) {
        Ok(provider) => provider,
        Err(e) => {
            error!("创建补全客户端失败，关闭连接: {}", e);
            return;
        }
    };
    relay_socket(socket, shared, provider, user, conversation).await;
}

async fn relay_socket<P>(
    socket: WebSocket,
    shared: RelayShared,
    provider: P,
    user: user::Model,
    conversation: Option<conversation::Model>,
) where
    P: ChatCompletion + Send + Sync + 'static,
{
    let cancel = CancellationToken::new();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<String>();

    let mut relay = match ChatRelay::open(shared, provider, user.id, conversation, outbound_tx, cancel.clone()).await {
        Ok(relay) => relay,
        Err(e) => {
            error!("加载会话失败，关闭连接: {:#}", e);
            return;
        }
    };
    info!("用户 {} 已连接，会话: {:?}", user.username, relay.conversation_id());

    let (mut sink, mut stream) = socket.split();

    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        writer_cancel.cancel();
        let _ = sink.close().await;
    });

    let reader_cancel = cancel.clone();
    let reader = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    if inbound_tx.send(text.to_string()).is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
        reader_cancel.cancel();
    });

    loop {
        let raw = tokio::select! {
            _ = cancel.cancelled() => break,
            raw = inbound_rx.recv() => match raw {
                Some(raw) => raw,
                None => break,
            },
        };
        if let Err(e) = relay.handle_text(&raw).await {
            error!("处理会话 {:?} 的消息失败: {:#}", relay.conversation_id(), e);
        }
    }

    debug!("用户 {} 的连接正在关闭", user.username);
    let conversation_id = relay.conversation_id();
    // 释放发送端后写任务会自行退出
    drop(relay);
    reader.abort();
    let _ = writer.await;
    info!("用户 {} 已断开，会话: {:?}", user.username, conversation_id);
}
