use std::time::Duration;

use async_stream::try_stream;
use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{ensure_success, ChatCompletion, ChatMessage, CompletionError, LineBuffer, TokenStream};
use crate::config::LlmConfig;

/// 本地 Ollama 服务，流式响应为逐行 JSON
pub struct Ollama {
    client: Client,
    base_url: String,
    model: String,
    temperature: Option<f32>,
    timeout: Duration,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<Options>,
}

#[derive(Serialize)]
struct Options {
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

/// 解析一行 NDJSON，返回 (token, 是否结束)
fn parse_line(line: &str) -> Result<Option<(String, bool)>, CompletionError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let chunk: ChatChunk = serde_json::from_str(line)?;
    if let Some(error) = chunk.error {
        return Err(CompletionError::Provider(error));
    }
    let token = chunk.message.map(|m| m.content).unwrap_or_default();
    Ok(Some((token, chunk.done)))
}

impl Ollama {
    pub fn new(client: Client, cfg: &LlmConfig) -> Self {
        Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            timeout: Duration::from_secs(cfg.timeout_seconds.max(10)),
        }
    }

    fn request(&self, messages: &[ChatMessage], stream: bool) -> reqwest::RequestBuilder {
        let body = ChatRequest {
            model: &self.model,
            messages,
            stream,
            options: self.temperature.map(|temperature| Options { temperature }),
        };
        self.client.post(format!("{}/api/chat", self.base_url)).json(&body)
    }

    fn ndjson_tokens<'a>(
        &'a self,
        messages: &'a [ChatMessage],
    ) -> impl Stream<Item = Result<String, CompletionError>> + Send + 'a {
        try_stream! {
            let response = ensure_success(self.request(messages, true).send().await?).await?;
            let mut body = response.bytes_stream();
            let mut buffer = LineBuffer::default();
            let mut finished = false;
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                for line in buffer.push(&chunk) {
                    if let Some((token, done)) = parse_line(&line)? {
                        if !token.is_empty() {
                            yield token;
                        }
                        if done {
                            finished = true;
                            break;
                        }
                    }
                }
                if finished {
                    break;
                }
            }
            if !finished {
                if let Some(line) = buffer.finish() {
                    if let Some((token, _)) = parse_line(&line)? {
                        if !token.is_empty() {
                            yield token;
                        }
                    }
                }
            }
        }
    }
}

impl ChatCompletion for Ollama {
    fn stream_chat<'a>(&'a self, messages: &'a [ChatMessage]) -> TokenStream<'a> {
        Box::pin(self.ndjson_tokens(messages))
    }

    fn complete<'a>(&'a self, messages: &'a [ChatMessage]) -> BoxFuture<'a, Result<String, CompletionError>> {
        async move {
            let response = self.request(messages, false).timeout(self.timeout).send().await?;
            let body = ensure_success(response).await?.text().await?;
            match parse_line(&body)? {
                Some((content, _)) if !content.is_empty() => Ok(content),
                _ => Err(CompletionError::EmptyResponse),
            }
        }
        .boxed()
    }
}
