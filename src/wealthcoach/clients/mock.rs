//! Scripted LLM client for tests and offline development.
//!
//! Yields a fixed delta sequence per call, optionally failing mid-stream or
//! pausing between deltas so cancellation behavior can be exercised. Call
//! counts are observable so tests can assert that cached turns never reach
//! the model.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;

use crate::wealthcoach::client_wrapper::{
    Completion, CompletionOpts, LlmClient, LlmError, Message, MessageChunk, MessageChunkStream,
};

pub struct ScriptedLlmClient {
    deltas: Vec<String>,
    delay_between_deltas: Option<Duration>,
    fail_after: Option<usize>,
    unavailable: bool,
    calls: AtomicUsize,
}

impl ScriptedLlmClient {
    /// Client that replies with the given deltas and a clean finish.
    pub fn new(deltas: Vec<&str>) -> Self {
        Self {
            deltas: deltas.into_iter().map(|d| d.to_string()).collect(),
            delay_between_deltas: None,
            fail_after: None,
            unavailable: false,
            calls: AtomicUsize::new(0),
        }
    }

    /// Sleep between deltas; lets tests cancel mid-stream deterministically.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_between_deltas = Some(delay);
        self
    }

    /// Emit a transport error after `n` deltas instead of finishing.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Every call fails up front, as if the endpoint were down.
    pub fn unavailable() -> Self {
        Self {
            deltas: Vec::new(),
            delay_between_deltas: None,
            fail_after: None,
            unavailable: true,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of completions the "model" actually served.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn full_text(&self) -> String {
        self.deltas.concat()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(
        &self,
        _messages: &[Message],
        _opts: &CompletionOpts,
    ) -> Result<Completion, LlmError> {
        if self.unavailable {
            return Err(LlmError::Unavailable("scripted outage".to_string()));
        }
        if self.fail_after.is_some() {
            return Err(LlmError::Unavailable("scripted mid-call failure".to_string()));
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Completion {
            content: self.full_text(),
            usage: None,
            cached: false,
        })
    }

    async fn complete_stream(
        &self,
        _messages: &[Message],
    ) -> Result<MessageChunkStream, LlmError> {
        if self.unavailable {
            return Err(LlmError::Unavailable("scripted outage".to_string()));
        }
        self.calls.fetch_add(1, Ordering::SeqCst);

        let deltas = self.deltas.clone();
        let delay = self.delay_between_deltas;
        let fail_after = self.fail_after;

        let chunk_stream = stream! {
            for (i, delta) in deltas.into_iter().enumerate() {
                if let Some(n) = fail_after {
                    if i >= n {
                        yield Err(LlmError::Unavailable(
                            "scripted mid-stream failure".to_string(),
                        ));
                        return;
                    }
                }
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(MessageChunk {
                    content: delta,
                    finish_reason: None,
                });
            }
            if fail_after.is_some() {
                yield Err(LlmError::Unavailable(
                    "scripted mid-stream failure".to_string(),
                ));
                return;
            }
            yield Ok(MessageChunk {
                content: String::new(),
                finish_reason: Some("stop".to_string()),
            });
        };
        Ok(Box::pin(chunk_stream))
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn streams_deltas_then_finishes() {
        let client = ScriptedLlmClient::new(vec!["A ", "401k ", "is great."]);
        let mut stream = client.complete_stream(&[]).await.unwrap();

        let mut text = String::new();
        let mut finished = false;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.unwrap();
            text.push_str(&chunk.content);
            if chunk.finish_reason.is_some() {
                finished = true;
            }
        }
        assert_eq!(text, "A 401k is great.");
        assert!(finished);
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn mid_stream_failure_surfaces_error() {
        let client = ScriptedLlmClient::new(vec!["partial ", "never"]).failing_after(1);
        let mut stream = client.complete_stream(&[]).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.content, "partial ");
        assert!(stream.next().await.unwrap().is_err());
    }
}
