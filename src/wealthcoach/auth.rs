//! Token verification for authenticated endpoints.
//!
//! Token minting lives in an out-of-scope identity service; the chat core
//! only verifies. [`SharedSecretVerifier`] checks `user_id.expiry.signature`
//! tokens where the signature is a SHA-256 over the shared secret and the
//! claims. Comparison is constant-time so invalid tokens cannot be probed
//! through timing. Every failure surfaces as the same opaque `Auth` error.

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::wealthcoach::error::CoreError;

/// Verifies a client token and resolves it to a user id.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<String, CoreError>;
}

/// Verifier for tokens signed with a process-wide shared secret.
pub struct SharedSecretVerifier {
    secret: String,
}

impl SharedSecretVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn signature(&self, user_id: &str, expiry: i64) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b".");
        hasher.update(user_id.as_bytes());
        hasher.update(b".");
        hasher.update(expiry.to_string().as_bytes());
        let digest = hasher.finalize();
        let mut out = String::with_capacity(64);
        for byte in digest.iter() {
            out.push_str(&format!("{:02x}", byte));
        }
        out
    }

    /// Mint a token for `user_id` valid for `ttl_secs`. The production
    /// issuer lives elsewhere; this exists for tests and local tooling.
    pub fn mint(&self, user_id: &str, ttl_secs: i64) -> String {
        let expiry = Utc::now().timestamp() + ttl_secs;
        format!("{}.{}.{}", user_id, expiry, self.signature(user_id, expiry))
    }
}

#[async_trait]
impl TokenVerifier for SharedSecretVerifier {
    async fn verify(&self, token: &str) -> Result<String, CoreError> {
        let mut parts = token.rsplitn(3, '.');
        let provided_sig = parts.next().ok_or(CoreError::Auth)?;
        let expiry_raw = parts.next().ok_or(CoreError::Auth)?;
        let user_id = parts.next().ok_or(CoreError::Auth)?;
        if user_id.is_empty() {
            return Err(CoreError::Auth);
        }

        let expiry: i64 = expiry_raw.parse().map_err(|_| CoreError::Auth)?;

        // Hash both sides so the comparison length is fixed, then compare in
        // constant time. The expiry check runs last; the result is the same
        // opaque error either way.
        let expected = Sha256::digest(self.signature(user_id, expiry).as_bytes());
        let provided = Sha256::digest(provided_sig.as_bytes());
        let matches: bool = expected.ct_eq(&provided).into();
        if !matches {
            return Err(CoreError::Auth);
        }
        if expiry < Utc::now().timestamp() {
            return Err(CoreError::Auth);
        }
        Ok(user_id.to_string())
    }
}
