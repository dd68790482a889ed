//! OpenAI-compatible chat-completions client.
//!
//! Speaks the `/chat/completions` wire format directly over the shared
//! [`reqwest`] client, so any OpenAI-compatible endpoint (hosted or local)
//! works by pointing `LLM_BASE_URL` at it.
//!
//! The synchronous path consults the response cache before invoking the
//! model and stores the response only on a clean finish. The streaming path
//! never touches the cache during generation; the orchestrator caches the
//! concatenated text after end-of-stream.

use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};

use crate::wealthcoach::cache::CacheClient;
use crate::wealthcoach::client_wrapper::{
    Completion, CompletionOpts, LlmClient, LlmError, Message, MessageChunk, MessageChunkStream,
    Role, TokenUsage,
};
use crate::wealthcoach::clients::common::{retry_idempotent, SseDecoder};

pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    cache: Option<Arc<dyn CacheClient>>,
    response_ttl: Duration,
}

impl OpenAiClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            cache: None,
            response_ttl: Duration::from_secs(7200),
        }
    }

    /// Attach a response cache for the synchronous path.
    pub fn with_response_cache(mut self, cache: Arc<dyn CacheClient>, ttl: Duration) -> Self {
        self.cache = Some(cache);
        self.response_ttl = ttl;
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn wire_messages(messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .map(|msg| {
                let role = match msg.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                json!({ "role": role, "content": msg.content.as_ref() })
            })
            .collect()
    }

    fn classify_status(status: reqwest::StatusCode, body: &str) -> LlmError {
        if status.as_u16() == 400 && body.contains("context_length") {
            // The provider reports the concrete counts; ours are estimates.
            return LlmError::ContextTooLong {
                estimated: 0,
                budget: 0,
            };
        }
        LlmError::Unavailable(format!("HTTP {}: {}", status, body))
    }

    fn parse_usage(value: &Value) -> Option<TokenUsage> {
        let usage = value.get("usage")?;
        let input = usage.get("prompt_tokens")?.as_u64()? as usize;
        let output = usage.get("completion_tokens")?.as_u64()? as usize;
        Some(TokenUsage {
            input_tokens: input,
            output_tokens: output,
            total_tokens: input + output,
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(
        &self,
        messages: &[Message],
        opts: &CompletionOpts,
    ) -> Result<Completion, LlmError> {
        if let (Some(cache), Some(key)) = (self.cache.as_ref(), opts.cache_key.as_ref()) {
            if let Some(bytes) = cache.get(key).await {
                if let Ok(content) = String::from_utf8(bytes) {
                    log::debug!("response cache hit for {}", key);
                    return Ok(Completion {
                        content,
                        usage: None,
                        cached: true,
                    });
                }
            }
        }

        let body = json!({
            "model": self.model,
            "messages": Self::wire_messages(messages),
        });

        let response = self
            .http
            .post(self.endpoint("chat/completions"))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Unavailable(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| LlmError::Unavailable(e.to_string()))?;
        if !status.is_success() {
            return Err(Self::classify_status(status, &text));
        }

        let parsed: Value = serde_json::from_str(&text)
            .map_err(|e| LlmError::Protocol(format!("invalid completion body: {}", e)))?;
        let content = parsed
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| LlmError::Protocol("no choices in completion response".to_string()))?
            .to_string();
        let usage = Self::parse_usage(&parsed);

        if let (Some(cache), Some(key)) = (self.cache.as_ref(), opts.cache_key.as_ref()) {
            cache.set(key, content.as_bytes(), self.response_ttl).await;
        }

        Ok(Completion {
            content,
            usage,
            cached: false,
        })
    }

    async fn complete_stream(&self, messages: &[Message]) -> Result<MessageChunkStream, LlmError> {
        let body = json!({
            "model": self.model,
            "messages": Self::wire_messages(messages),
            "stream": true,
        });

        let response = self
            .http
            .post(self.endpoint("chat/completions"))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &text));
        }

        let mut bytes = response.bytes_stream();
        let chunk_stream = stream! {
            let mut decoder = SseDecoder::new();
            let mut finished = false;
            'outer: while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(LlmError::Unavailable(format!(
                            "transport error mid-stream: {}", e
                        )));
                        return;
                    }
                };
                for payload in decoder.feed(&chunk) {
                    if payload == "[DONE]" {
                        finished = true;
                        break 'outer;
                    }
                    let value: Value = match serde_json::from_str(&payload) {
                        Ok(value) => value,
                        Err(e) => {
                            yield Err(LlmError::Protocol(format!(
                                "invalid stream event: {}", e
                            )));
                            return;
                        }
                    };
                    let delta = value
                        .get("choices")
                        .and_then(|c| c.get(0))
                        .and_then(|c| c.get("delta"))
                        .and_then(|d| d.get("content"))
                        .and_then(|c| c.as_str())
                        .unwrap_or("")
                        .to_string();
                    let finish_reason = value
                        .get("choices")
                        .and_then(|c| c.get(0))
                        .and_then(|c| c.get("finish_reason"))
                        .and_then(|f| f.as_str())
                        .map(|s| s.to_string());
                    if finish_reason.is_some() {
                        finished = true;
                    }
                    if !delta.is_empty() || finish_reason.is_some() {
                        yield Ok(MessageChunk {
                            content: delta,
                            finish_reason,
                        });
                    }
                }
            }
            if !finished {
                yield Err(LlmError::Unavailable(
                    "stream ended without a terminal event".to_string(),
                ));
            }
        };

        Ok(Box::pin(chunk_stream))
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn ping(&self) -> Result<(), LlmError> {
        let url = self.endpoint("models");
        let http = self.http.clone();
        let api_key = self.api_key.clone();
        retry_idempotent(2, Duration::from_millis(200), move || {
            let http = http.clone();
            let url = url.clone();
            let api_key = api_key.clone();
            async move {
                let response = http
                    .get(&url)
                    .header("Authorization", format!("Bearer {}", api_key))
                    .timeout(Duration::from_secs(2))
                    .send()
                    .await
                    .map_err(|e| LlmError::Unavailable(e.to_string()))?;
                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(LlmError::Unavailable(format!(
                        "HTTP {} from models probe",
                        response.status()
                    )))
                }
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_keeps_order_and_roles() {
        let messages = vec![
            Message::new(Role::System, "persona"),
            Message::new(Role::User, "q1"),
            Message::new(Role::Assistant, "a1"),
            Message::new(Role::User, "q2"),
        ];
        let wire = OpenAiClient::wire_messages(&messages);
        assert_eq!(wire.len(), 4);
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[3]["role"], "user");
        assert_eq!(wire[3]["content"], "q2");
    }

    #[test]
    fn usage_parsing() {
        let body = json!({
            "usage": { "prompt_tokens": 10, "completion_tokens": 5 }
        });
        let usage = OpenAiClient::parse_usage(&body).unwrap();
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.output_tokens, 5);
        assert_eq!(usage.total_tokens, 15);

        assert!(OpenAiClient::parse_usage(&json!({})).is_none());
    }

    #[test]
    fn context_overflow_is_not_retriable() {
        let err = OpenAiClient::classify_status(
            reqwest::StatusCode::BAD_REQUEST,
            "{\"error\":{\"code\":\"context_length_exceeded\"}}",
        );
        assert!(matches!(err, LlmError::ContextTooLong { .. }));
    }
}
