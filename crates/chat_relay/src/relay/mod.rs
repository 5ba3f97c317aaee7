//! 一个 WebSocket 连接对应一个 [`ChatRelay`]
//!
//! 每条用户消息构成一轮对话：保存消息，把完整上下文交给补全服务，
//! 将产生的 token 逐个以 htmx 片段推送给浏览器，最后保存回复。

pub mod render;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::StreamExt;
use sea_orm::DatabaseConnection;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::completion::{ChatCompletion, ChatMessage, CompletionError};
use crate::config::{self, Language};
use crate::naming::{NamingJob, NamingQueue};
use crate::store;
use chat_relay_entity::conversation;
use chat_relay_entity::message::Role;
use render::{contents_div_id, token_fragment, Renderer};

/// 所有连接共用的资源
#[derive(Clone)]
pub struct RelayShared {
    pub db: DatabaseConnection,
    pub naming: NamingQueue,
    pub renderer: Arc<Renderer>,
}

/// 浏览器发来的消息
#[derive(Deserialize)]
struct Envelope {
    message: String,
}

/// 一轮回复没有正常完成的原因
#[derive(Error, Debug)]
enum TurnFailure {
    #[error(transparent)]
    Completion(#[from] CompletionError),
    #[error("超过 {0:?} 未收到新的数据")]
    Timeout(Duration),
    #[error("补全服务没有返回任何内容")]
    Empty,
    #[error("连接已关闭")]
    Cancelled,
    #[error("保存回复失败: {0:#}")]
    Persist(anyhow::Error),
}

pub struct ChatRelay<P> {
    db: DatabaseConnection,
    naming: NamingQueue,
    renderer: Arc<Renderer>,
    provider: P,
    user_id: i32,
    conversation: Option<conversation::Model>,
    context: Vec<ChatMessage>,
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
    language: Language,
    chunk_timeout: Duration,
}

impl<P: ChatCompletion> ChatRelay<P> {
    /// 建立连接时调用，已有会话会加载全部历史消息
    ///
    /// `conversation` 必须已经确认属于 `user_id`。
    pub async fn open(
        shared: RelayShared,
        provider: P,
        user_id: i32,
        conversation: Option<conversation::Model>,
        outbound: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let context = match &conversation {
            Some(conversation) => store::load_messages(&shared.db, conversation.id)
                .await?
                .iter()
                .map(ChatMessage::from)
                .collect(),
            None => Vec::new(),
        };
        let config = config::current();
        Ok(Self {
            db: shared.db,
            naming: shared.naming,
            renderer: shared.renderer,
            provider,
            user_id,
            conversation,
            context,
            outbound,
            cancel,
            language: config.language,
            chunk_timeout: Duration::from_secs(config.llm.timeout_seconds.max(1)),
        })
    }

    #[cfg(test)]
    pub fn with_chunk_timeout(mut self, chunk_timeout: Duration) -> Self {
        self.chunk_timeout = chunk_timeout;
        self
    }

    pub fn conversation_id(&self) -> Option<i32> {
        self.conversation.as_ref().map(|c| c.id)
    }

    /// 处理一条文本帧，完成整轮对话后返回
    ///
    /// 补全服务的错误不会向上返回，只会向浏览器推送一条错误提示。
    pub async fn handle_text(&mut self, raw: &str) -> Result<()> {
        let text = match serde_json::from_str::<Envelope>(raw) {
            Ok(envelope) => envelope.message,
            Err(e) => {
                warn!("忽略无法解析的消息: {}", e);
                return Ok(());
            }
        };
        if text.trim().is_empty() {
            return Ok(());
        }

        let conversation_id = match self.conversation_id() {
            Some(id) => id,
            None => self.start_conversation(&text).await?,
        };

        let human = store::save_message(&self.db, conversation_id, Role::Human, &text).await?;
        self.context.push(ChatMessage::from(&human));
        self.send(self.renderer.user_message(&text)?)?;

        let div_id = contents_div_id(human.id);
        self.send(self.renderer.system_message(&div_id)?)?;

        let outcome = match self.stream_reply(&div_id).await {
            Ok(reply) => self.save_reply(conversation_id, reply).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(reply) => {
                self.send(self.renderer.final_system_message(&div_id, &reply)?)?;
            }
            Err(TurnFailure::Cancelled) => {
                debug!("会话 {} 的连接已关闭，放弃本轮回复", conversation_id);
            }
            Err(e) => {
                error!("会话 {} 生成回复失败: {}", conversation_id, e);
                let message = self.language.reply_error_message();
                self.send(self.renderer.final_system_message(&div_id, message)?)?;
            }
        }
        Ok(())
    }

    async fn save_reply(&mut self, conversation_id: i32, reply: String) -> Result<String, TurnFailure> {
        let assistant = store::save_message(&self.db, conversation_id, Role::Assistant, &reply)
            .await
            .map_err(TurnFailure::Persist)?;
        self.context.push(ChatMessage::from(&assistant));
        Ok(reply)
    }

    async fn start_conversation(&mut self, first_message: &str) -> Result<i32> {
        let conversation = store::create_conversation(&self.db, self.user_id).await?;
        let id = conversation.id;
        self.conversation = Some(conversation);
        self.naming.submit(NamingJob {
            conversation_id: id,
            message: first_message.to_string(),
        });
        self.send(json!({ "pushURL": format!("/chat/{}/", id) }).to_string())?;
        Ok(id)
    }

    async fn stream_reply(&self, div_id: &str) -> Result<String, TurnFailure> {
        let mut stream = self.provider.stream_chat(&self.context);
        let mut reply = String::new();
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Err(TurnFailure::Cancelled),
                next = tokio::time::timeout(self.chunk_timeout, stream.next()) => next,
            };
            let token = match next {
                Err(_) => return Err(TurnFailure::Timeout(self.chunk_timeout)),
                Ok(None) => break,
                Ok(Some(token)) => token?,
            };
            if token.is_empty() {
                continue;
            }
            self.send(token_fragment(div_id, &token))
                .map_err(|_| TurnFailure::Cancelled)?;
            reply.push_str(&token);
        }
        if reply.is_empty() {
            return Err(TurnFailure::Empty);
        }
        Ok(reply)
    }

    fn send(&self, frame: String) -> Result<()> {
        self.outbound.send(frame).map_err(|_| anyhow!("客户端已断开"))
    }
}
