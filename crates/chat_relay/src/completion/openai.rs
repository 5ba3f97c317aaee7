use std::time::Duration;

use async_stream::try_stream;
use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ensure_success, ChatCompletion, ChatMessage, CompletionError, LineBuffer, TokenStream};
use crate::config::LlmConfig;

/// OpenAI 兼容的 chat/completions 接口（OpenAI / DeepSeek / 其它兼容服务都可）
pub struct OpenAiCompatible {
    client: Client,
    base_url: String,
    api_key: Option<String>,
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
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Deserialize, Default)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// 一行 SSE 数据的解析结果
#[derive(Debug, PartialEq, Eq)]
enum SseLine {
    Token(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> Result<SseLine, CompletionError> {
    let Some(data) = line.strip_prefix("data:") else {
        // 空行、注释和 event: 行都不携带内容
        return Ok(SseLine::Skip);
    };
    let data = data.trim();
    if data.is_empty() {
        return Ok(SseLine::Skip);
    }
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    let chunk: StreamChunk = serde_json::from_str(data)?;
    if let Some(error) = chunk.error {
        return Err(CompletionError::Provider(error.message));
    }
    let token = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .unwrap_or_default();
    if token.is_empty() {
        Ok(SseLine::Skip)
    } else {
        Ok(SseLine::Token(token))
    }
}

impl OpenAiCompatible {
    pub fn new(client: Client, cfg: &LlmConfig) -> Self {
        Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            timeout: Duration::from_secs(cfg.timeout_seconds.max(10)),
        }
    }

    fn request(&self, messages: &[ChatMessage], stream: bool) -> Result<reqwest::RequestBuilder, CompletionError> {
        let api_key = self
            .api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or(CompletionError::MissingApiKey)?;
        let body = ChatRequest {
            model: &self.model,
            messages,
            stream,
            temperature: self.temperature,
        };
        Ok(self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .json(&body))
    }

    fn sse_tokens<'a>(
        &'a self,
        messages: &'a [ChatMessage],
    ) -> impl Stream<Item = Result<String, CompletionError>> + Send + 'a {
        try_stream! {
            let response = ensure_success(self.request(messages, true)?.send().await?).await?;
            debug!("补全服务开始返回流式响应: model={}", self.model);
            let mut body = response.bytes_stream();
            let mut buffer = LineBuffer::default();
            let mut finished = false;
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                for line in buffer.push(&chunk) {
                    match parse_sse_line(&line)? {
                        SseLine::Token(token) => {
                            yield token;
                        }
                        SseLine::Done => {
                            finished = true;
                            break;
                        }
                        SseLine::Skip => {}
                    }
                }
                if finished {
                    break;
                }
            }
            if !finished {
                if let Some(line) = buffer.finish() {
                    if let SseLine::Token(token) = parse_sse_line(&line)? {
                        yield token;
                    }
                }
            }
        }
    }
}

impl ChatCompletion for OpenAiCompatible {
    fn stream_chat<'a>(&'a self, messages: &'a [ChatMessage]) -> TokenStream<'a> {
        Box::pin(self.sse_tokens(messages))
    }

    fn complete<'a>(&'a self, messages: &'a [ChatMessage]) -> BoxFuture<'a, Result<String, CompletionError>> {
        async move {
            let response = self.request(messages, false)?.timeout(self.timeout).send().await?;
            let response: ChatResponse = ensure_success(response).await?.json().await?;
            response
                .choices
                .into_iter()
                .next()
                .and_then(|choice| choice.message.content)
                .filter(|content| !content.is_empty())
                .ok_or(CompletionError::EmptyResponse)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::test_server;
    use assert_matches::assert_matches;
    use axum::http::StatusCode;
    use futures::TryStreamExt;

    fn config(base_url: String) -> LlmConfig {
        LlmConfig {
            base_url,
            api_key: Some("sk-test".to_string()),
            ..LlmConfig::default()
        }
    }

    #[test]
    fn test_parse_sse_line() {
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"content":"Hel"}}]}"#).unwrap(),
            SseLine::Token("Hel".to_string())
        );
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap(),
            SseLine::Skip
        );
        assert_eq!(parse_sse_line("data: [DONE]").unwrap(), SseLine::Done);
        assert_eq!(parse_sse_line(": keep-alive").unwrap(), SseLine::Skip);
        assert_eq!(parse_sse_line("").unwrap(), SseLine::Skip);
        assert_matches!(
            parse_sse_line(r#"data: {"error":{"message":"quota exceeded"}}"#),
            Err(CompletionError::Provider(msg)) if msg == "quota exceeded"
        );
        assert_matches!(parse_sse_line("data: {oops"), Err(CompletionError::Decode(_)));
    }

    #[tokio::test]
    async fn test_stream_chat_yields_tokens_until_done() {
        let body = "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\"\\nworld\"}}]}\n\n\
                    data: [DONE]\n\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n";
        let base_url = test_server::serve("/chat/completions", StatusCode::OK, body).await;
        let client = OpenAiCompatible::new(Client::new(), &config(base_url));

        let messages = vec![ChatMessage::user("hi")];
        let tokens: Vec<String> = client.stream_chat(&messages).try_collect().await.unwrap();
        assert_eq!(tokens, vec!["Hello".to_string(), "\nworld".to_string()]);
    }

    #[tokio::test]
    async fn test_stream_chat_surfaces_http_errors() {
        let base_url = test_server::serve("/chat/completions", StatusCode::UNAUTHORIZED, "bad key").await;
        let client = OpenAiCompatible::new(Client::new(), &config(base_url));

        let messages = vec![ChatMessage::user("hi")];
        let result: Result<Vec<String>, _> = client.stream_chat(&messages).try_collect().await;
        assert_matches!(result, Err(CompletionError::RequestFailed(status, body)) => {
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(body, "bad key");
        });
    }

    #[tokio::test]
    async fn test_missing_api_key_fails_before_sending() {
        let cfg = LlmConfig {
            api_key: None,
            ..LlmConfig::default()
        };
        let client = OpenAiCompatible::new(Client::new(), &cfg);
        let messages = vec![ChatMessage::user("hi")];
        assert_matches!(client.complete(&messages).await, Err(CompletionError::MissingApiKey));
    }

    #[tokio::test]
    async fn test_complete_returns_message_content() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":"A short summary"}}]}"#;
        let base_url = test_server::serve("/chat/completions", StatusCode::OK, body).await;
        let client = OpenAiCompatible::new(Client::new(), &config(base_url));

        let messages = vec![ChatMessage::user("hi")];
        assert_eq!(client.complete(&messages).await.unwrap(), "A short summary");
    }

    #[tokio::test]
    async fn test_complete_rejects_empty_choices() {
        let base_url = test_server::serve("/chat/completions", StatusCode::OK, r#"{"choices":[]}"#).await;
        let client = OpenAiCompatible::new(Client::new(), &config(base_url));

        let messages = vec![ChatMessage::user("hi")];
        assert_matches!(client.complete(&messages).await, Err(CompletionError::EmptyResponse));
    }
}
