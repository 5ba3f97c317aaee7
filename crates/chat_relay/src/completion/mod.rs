//! 补全服务客户端
//!
//! 每种服务一个实现，通过 [`CompletionProvider`] 静态分发。

mod ollama;
mod openai;

pub use ollama::Ollama;
pub use openai::OpenAiCompatible;

use std::pin::Pin;
use std::time::Duration;

use enum_dispatch::enum_dispatch;
use futures::future::BoxFuture;
use futures::Stream;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{LlmConfig, ProviderKind};
use chat_relay_entity::message;

#[derive(Error, Debug)]
pub enum CompletionError {
    #[error("api key missing")]
    MissingApiKey,
    #[error("request failed, status code: {0}, body: {1}")]
    RequestFailed(reqwest::StatusCode, String),
    #[error("provider returned an error: {0}")]
    Provider(String),
    #[error("provider returned an empty response")]
    EmptyResponse,
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Decode(#[from] serde_json::Error),
}

/// 发送给补全服务的一条上下文消息
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

impl From<&message::Model> for ChatMessage {
    fn from(model: &message::Model) -> Self {
        Self {
            role: model.role.chat_role().to_string(),
            content: model.content.clone(),
        }
    }
}

/// 逐个 token 产出的流式响应
pub type TokenStream<'a> = Pin<Box<dyn Stream<Item = Result<String, CompletionError>> + Send + 'a>>;

#[enum_dispatch]
pub trait ChatCompletion {
    /// 以流式模式请求补全
    fn stream_chat<'a>(&'a self, messages: &'a [ChatMessage]) -> TokenStream<'a>;

    /// 一次性请求补全，返回完整文本
    fn complete<'a>(&'a self, messages: &'a [ChatMessage]) -> BoxFuture<'a, Result<String, CompletionError>>;
}

#[enum_dispatch(ChatCompletion)]
pub enum CompletionProvider {
    OpenAiCompatible,
    Ollama,
}

impl CompletionProvider {
    pub fn from_config(cfg: &LlmConfig) -> Result<Self, CompletionError> {
        let client = Client::builder().connect_timeout(Duration::from_secs(10)).build()?;
        Ok(match cfg.provider {
            ProviderKind::OpenAi => OpenAiCompatible::new(client, cfg).into(),
            ProviderKind::Ollama => Ollama::new(client, cfg).into(),
        })
    }
}

/// 把任意切分的字节块还原成完整的行，不完整的尾行留到下一块
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(Self::decode(&line[..line.len() - 1]));
        }
        lines
    }

    /// 流结束时取出没有换行结尾的最后一行
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        Some(Self::decode(&line))
    }

    fn decode(line: &[u8]) -> String {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        String::from_utf8_lossy(line).into_owned()
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, CompletionError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(CompletionError::RequestFailed(status, body))
}


#[cfg(test)]
mod tests {
    use super::*;
    use chat_relay_entity::message::Role;

    #[test]
    fn test_line_buffer_carries_partial_lines() {
        let mut buffer = LineBuffer::default();
        assert_eq!(buffer.push(b"data: {\"a\""), Vec::<String>::new());
        assert_eq!(buffer.push(b":1}\r\ndata: [DO"), vec!["data: {\"a\":1}".to_string()]);
        assert_eq!(buffer.push(b"NE]\n\n"), vec!["data: [DONE]".to_string(), String::new()]);
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn test_line_buffer_keeps_split_utf8_intact() {
        let text = "你好\n".as_bytes();
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(&text[..2]).is_empty());
        assert_eq!(buffer.push(&text[2..]), vec!["你好".to_string()]);
    }

    #[test]
    fn test_line_buffer_finish_returns_trailing_line() {
        let mut buffer = LineBuffer::default();
        assert!(buffer.push(b"{\"done\":true}").is_empty());
        assert_eq!(buffer.finish().as_deref(), Some("{\"done\":true}"));
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn test_chat_message_from_stored_message() {
        let model = message::Model {
            id: 1,
            conversation_id: 1,
            role: Role::Human,
            content: "hi".to_string(),
            created_at: chrono::Utc::now(),
        };
        assert_eq!(ChatMessage::from(&model), ChatMessage::user("hi"));
    }

    #[test]
    fn test_provider_selected_from_config() {
        let mut cfg = LlmConfig::default();
        assert!(matches!(
            CompletionProvider::from_config(&cfg).unwrap(),
            CompletionProvider::OpenAiCompatible(_)
        ));
        cfg.provider = ProviderKind::Ollama;
        assert!(matches!(
            CompletionProvider::from_config(&cfg).unwrap(),
            CompletionProvider::Ollama(_)
        ));
    }
}
