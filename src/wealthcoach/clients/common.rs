//! Shared utilities for upstream HTTP clients.
//!
//! Provides the tuned shared [`reqwest`] client, the server-sent-event line
//! decoder used by streaming completions, and a small jittered retry helper
//! for idempotent probes.

use std::time::Duration;

use lazy_static::lazy_static;
use rand::Rng;

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    ///
    /// A single client keeps TLS sessions and DNS lookups warm, which cuts
    /// tail latency when many concurrent chat turns hit the same upstream.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
pub fn shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Incremental decoder for `text/event-stream` payloads.
///
/// Network chunks split events at arbitrary byte boundaries, including
/// inside multi-byte sequences; the decoder buffers raw bytes and only
/// yields the payload of complete `data:` lines.
#[derive(Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a network chunk, returning the `data:` payloads of every line
    /// completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(payload) = line.strip_prefix("data:") {
                let payload = payload.trim_start();
                if !payload.is_empty() {
                    events.push(payload.to_string());
                }
            }
        }
        events
    }
}

/// Retry an idempotent async operation up to `max_retries` extra attempts
/// with jittered linear backoff. Only used for GET-style probes; chat
/// completions are never replayed automatically.
pub async fn retry_idempotent<T, E, F, Fut>(
    max_retries: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_retries => {
                attempt += 1;
                let jitter_ms = rand::thread_rng().gen_range(0..=base_delay.as_millis() as u64);
                let delay = base_delay * attempt + Duration::from_millis(jitter_ms);
                log::warn!(
                    "idempotent request failed (attempt {}/{}), retrying in {:?}: {}",
                    attempt,
                    max_retries,
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
