//! Per-user request rate limiting over the cache client's atomic counters.
//!
//! Counters live in the cache under `rl:{user_id}:{window}` with a TTL equal
//! to the window length, so horizontal replicas share one budget without a
//! second locking layer. A cache outage fails open: availability of chat is
//! worth more than strict enforcement for the outage window.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::wealthcoach::cache::{keys, CacheClient};
use crate::wealthcoach::error::CoreError;

const WINDOW_SECS: i64 = 60;

pub struct RateLimiter {
    cache: Arc<dyn CacheClient>,
    limit_per_minute: u64,
}

impl RateLimiter {
    pub fn new(cache: Arc<dyn CacheClient>, limit_per_minute: u64) -> Self {
        Self {
            cache,
            limit_per_minute,
        }
    }

    /// Admit or reject one chat turn for `user_id`.
    ///
    /// Increments the current window's counter before comparing, so a
    /// rejected turn still consumed one increment but never a generation.
    pub async fn check(&self, user_id: &str) -> Result<(), CoreError> {
        let now = Utc::now().timestamp();
        let window = now / WINDOW_SECS;
        let key = keys::rate_limit_key(user_id, window);

        let count = match self.cache.incr(&key).await {
            Some(count) => count,
            None => {
                log::warn!("rate limiter cache unreachable, admitting {}", user_id);
                return Ok(());
            }
        };

        if count == 1 {
            self.cache
                .expire(&key, Duration::from_secs(WINDOW_SECS as u64))
                .await;
        }

        if count as u64 > self.limit_per_minute {
            let retry_after_secs = (WINDOW_SECS - (now % WINDOW_SECS)).max(1) as u64;
            return Err(CoreError::RateLimited { retry_after_secs });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wealthcoach::cache::MemoryCache;

    #[tokio::test]
    async fn admits_up_to_limit_then_rejects() {
        let limiter = RateLimiter::new(Arc::new(MemoryCache::new()), 3);
        for _ in 0..3 {
            limiter.check("u1").await.unwrap();
        }
        let err = limiter.check("u1").await.unwrap_err();
        match err {
            CoreError::RateLimited { retry_after_secs } => {
                assert!(retry_after_secs >= 1 && retry_after_secs <= 60);
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn users_have_independent_budgets() {
        let limiter = RateLimiter::new(Arc::new(MemoryCache::new()), 1);
        limiter.check("u1").await.unwrap();
        limiter.check("u2").await.unwrap();
        assert!(limiter.check("u1").await.is_err());
    }
}
