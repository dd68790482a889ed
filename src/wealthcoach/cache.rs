//! Advisory key/value cache used for response caching, profile/history
//! snapshots, and rate-limit counters.
//!
//! The cache is never load-bearing: every operation is bounded by a timeout,
//! reads degrade to misses, and writes are best-effort. Callers encode their
//! own values (the store only sees opaque byte strings).
//!
//! Two implementations are provided: [`RedisCache`] for deployments with a
//! shared Redis/Valkey instance, and [`MemoryCache`], a per-process TTL map
//! used in tests and cacheless deployments.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::time::timeout;

/// Abstract key/value cache with TTL semantics.
///
/// `get` and `incr` return `None` on miss, timeout, or backend failure;
/// `set`, `expire`, and `delete` are fire-and-forget. `incr` is atomic on
/// backends that support it; `set` is last-writer-wins.
#[async_trait]
pub trait CacheClient: Send + Sync {
    async fn get(&self, key: &str) -> Option<Vec<u8>>;
    async fn set(&self, key: &str, value: &[u8], ttl: Duration);
    async fn incr(&self, key: &str) -> Option<i64>;
    async fn expire(&self, key: &str, ttl: Duration);
    async fn delete(&self, key: &str);

    /// Reachability probe for the detailed health report.
    async fn ping(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Key grammar
// ---------------------------------------------------------------------------

/// Stable cache key construction.
///
/// The grammar is `<namespace>:<param>…` with `:` as the separator. Hash
/// params are lowercase hex; identifier params are used verbatim. Changing
/// any of these formats is a breaking deployment.
pub mod keys {
    use sha2::{Digest, Sha256};

    fn sha256_hex(input: &[u8]) -> String {
        let digest = Sha256::digest(input);
        let mut out = String::with_capacity(64);
        for byte in digest.iter() {
            out.push_str(&format!("{:02x}", byte));
        }
        out
    }

    /// Canonical form of a prompt for cache keying: lowercased, whitespace
    /// collapsed to single spaces, leading/trailing punctuation stripped.
    pub fn normalize_prompt(prompt: &str) -> String {
        let lowered = prompt.to_lowercase();
        let collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
        collapsed
            .trim_matches(|c: char| c.is_ascii_punctuation())
            .trim()
            .to_string()
    }

    /// Fingerprint of the semantic context of a turn: the concatenated
    /// `(role, content)` of the last up-to-10 messages plus the retrieved
    /// source ids, in order.
    pub fn context_fingerprint(history: &[(String, String)], source_ids: &[String]) -> String {
        let mut hasher = Sha256::new();
        let start = history.len().saturating_sub(10);
        for (role, content) in &history[start..] {
            hasher.update(role.as_bytes());
            hasher.update(b"\x1f");
            hasher.update(content.as_bytes());
            hasher.update(b"\x1e");
        }
        for id in source_ids {
            hasher.update(id.as_bytes());
            hasher.update(b"\x1e");
        }
        let digest = hasher.finalize();
        let mut out = String::with_capacity(64);
        for byte in digest.iter() {
            out.push_str(&format!("{:02x}", byte));
        }
        out
    }

    /// `resp:{sha256(normalized_prompt + ctx_fingerprint)}`
    pub fn response_key(prompt: &str, ctx_fingerprint: &str) -> String {
        let normalized = normalize_prompt(prompt);
        format!(
            "resp:{}",
            sha256_hex(format!("{}{}", normalized, ctx_fingerprint).as_bytes())
        )
    }

    /// `emb:{sha256(text)}`
    pub fn embedding_key(text: &str) -> String {
        format!("emb:{}", sha256_hex(text.as_bytes()))
    }

    /// `profile:{user_id}`
    pub fn profile_key(user_id: &str) -> String {
        format!("profile:{}", user_id)
    }

    /// `history:{session_id}`
    pub fn history_key(session_id: &str) -> String {
        format!("history:{}", session_id)
    }

    /// `rl:{user_id}:{window}`
    pub fn rate_limit_key(user_id: &str, window: i64) -> String {
        format!("rl:{}:{}", user_id, window)
    }
}

// ---------------------------------------------------------------------------
// Redis implementation
// ---------------------------------------------------------------------------

/// Cache backed by a Redis/Valkey instance over a multiplexed connection.
pub struct RedisCache {
    conn: redis::aio::MultiplexedConnection,
    op_timeout: Duration,
}

impl RedisCache {
    /// Connect to `url` over a single multiplexed connection.
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        Ok(Self { conn, op_timeout })
    }
}

#[async_trait]
impl CacheClient for RedisCache {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut conn = self.conn.clone();
        match timeout(self.op_timeout, conn.get::<_, Option<Vec<u8>>>(key)).await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                log::warn!("cache get {} failed, treating as miss: {}", key, e);
                None
            }
            Err(_) => {
                log::warn!("cache get {} timed out, treating as miss", key);
                None
            }
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) {
        let mut conn = self.conn.clone();
        let secs = ttl.as_secs().max(1);
        match timeout(
            self.op_timeout,
            conn.set_ex::<_, _, ()>(key, value, secs),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("cache set {} failed (best-effort): {}", key, e),
            Err(_) => log::warn!("cache set {} timed out (best-effort)", key),
        }
    }

    async fn incr(&self, key: &str) -> Option<i64> {
        let mut conn = self.conn.clone();
        match timeout(self.op_timeout, conn.incr::<_, _, i64>(key, 1i64)).await {
            Ok(Ok(n)) => Some(n),
            Ok(Err(e)) => {
                log::warn!("cache incr {} failed: {}", key, e);
                None
            }
            Err(_) => {
                log::warn!("cache incr {} timed out", key);
                None
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) {
        let mut conn = self.conn.clone();
        match timeout(
            self.op_timeout,
            conn.expire::<_, i64>(key, ttl.as_secs().max(1) as i64),
        )
        .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => log::warn!("cache expire {} failed: {}", key, e),
            Err(_) => log::warn!("cache expire {} timed out", key),
        }
    }

    async fn delete(&self, key: &str) {
        let mut conn = self.conn.clone();
        match timeout(self.op_timeout, conn.del::<_, ()>(key)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::warn!("cache delete {} failed: {}", key, e),
            Err(_) => log::warn!("cache delete {} timed out", key),
        }
    }

    async fn ping(&self) -> bool {
        let mut conn = self.conn.clone();
        matches!(
            timeout(self.op_timeout, conn.exists::<_, bool>("health:probe")).await,
            Ok(Ok(_))
        )
    }
}

// ---------------------------------------------------------------------------
// In-process implementation
// ---------------------------------------------------------------------------

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// TTL map living inside the process. Used by tests and by deployments
/// without a Redis URL configured.
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn prune(entries: &mut HashMap<String, Entry>) {
        let now = Instant::now();
        entries.retain(|_, e| e.expires_at > now);
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheClient for MemoryCache {
    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let entries = self.entries.lock().ok()?;
        let entry = entries.get(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.value.clone())
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) {
        if let Ok(mut entries) = self.entries.lock() {
            Self::prune(&mut entries);
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_vec(),
                    expires_at: Instant::now() + ttl,
                },
            );
        }
    }

    async fn incr(&self, key: &str) -> Option<i64> {
        let mut entries = self.entries.lock().ok()?;
        let now = Instant::now();
        let next = match entries.get(key) {
            Some(entry) if entry.expires_at > now => {
                let current: i64 = std::str::from_utf8(&entry.value)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                current + 1
            }
            _ => 1,
        };
        let expires_at = match entries.get(key) {
            Some(entry) if entry.expires_at > now => entry.expires_at,
            // Counters start with a generous expiry; `expire` tightens it.
            _ => now + Duration::from_secs(3600),
        };
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string().into_bytes(),
                expires_at,
            },
        );
        Some(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) {
        if let Ok(mut entries) = self.entries.lock() {
            if let Some(entry) = entries.get_mut(key) {
                entry.expires_at = Instant::now() + ttl;
            }
        }
    }

    async fn delete(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }

    async fn ping(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_normalization() {
        assert_eq!(keys::normalize_prompt("  What   is a 401k?? "), "what is a 401k");
        assert_eq!(keys::normalize_prompt("Hello,  WORLD!"), "hello, world");
        assert_eq!(keys::normalize_prompt("..."), "");
    }

    #[test]
    fn response_key_is_stable_and_context_sensitive() {
        let history = vec![("user".to_string(), "hi".to_string())];
        let sources = vec!["retirement.md".to_string()];
        let fp = keys::context_fingerprint(&history, &sources);
        let k1 = keys::response_key("What is a 401k?", &fp);
        let k2 = keys::response_key("what   is a 401k", &fp);
        assert_eq!(k1, k2, "normalization must collapse to the same key");
        assert!(k1.starts_with("resp:"));

        let other_fp = keys::context_fingerprint(&history, &[]);
        assert_ne!(k1, keys::response_key("What is a 401k?", &other_fp));
    }

    #[test]
    fn fingerprint_windows_last_ten_messages() {
        let long: Vec<(String, String)> = (0..15)
            .map(|i| ("user".to_string(), format!("msg {}", i)))
            .collect();
        let tail: Vec<(String, String)> = long[5..].to_vec();
        assert_eq!(
            keys::context_fingerprint(&long, &[]),
            keys::context_fingerprint(&tail, &[])
        );
    }

    #[test]
    fn key_namespaces() {
        assert_eq!(keys::profile_key("u1"), "profile:u1");
        assert_eq!(keys::history_key("s1"), "history:s1");
        assert_eq!(keys::rate_limit_key("u1", 42), "rl:u1:42");
        assert!(keys::embedding_key("text").starts_with("emb:"));
    }

    #[tokio::test]
    async fn memory_cache_round_trip_and_expiry() {
        let cache = MemoryCache::new();
        cache.set("k", b"v", Duration::from_secs(60)).await;
        assert_eq!(cache.get("k").await, Some(b"v".to_vec()));

        cache.set("gone", b"v", Duration::from_millis(1)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.get("gone").await, None);

        cache.delete("k").await;
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn memory_cache_incr_is_sequential() {
        let cache = MemoryCache::new();
        assert_eq!(cache.incr("rl:u:1").await, Some(1));
        assert_eq!(cache.incr("rl:u:1").await, Some(2));
        cache.expire("rl:u:1", Duration::from_millis(1)).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(cache.incr("rl:u:1").await, Some(1));
    }
}
