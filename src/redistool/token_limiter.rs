//! Per-token, per-minute admission counter.
//!
//! Each `(token, minute of the hour)` pair is one integer key with a 59 second
//! TTL, so a bucket disappears before its minute comes around again. Any store
//! error rejects the request.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use prometheus::IntCounter;
use sha2::{Digest, Sha256};
use tracing::{debug, error};

use super::Backend;

const BUCKET_TTL: Duration = Duration::from_secs(59);

pub struct TokenLimiter {
    backend: Arc<dyn Backend>,
    key_prefix: String,
    limit_per_minute: u64,
    rejected: IntCounter,
}

impl TokenLimiter {
    pub fn new(
        backend: Arc<dyn Backend>,
        key_prefix: &str,
        limit_per_minute: u64,
        rejected: IntCounter,
    ) -> Self {
        Self {
            backend,
            key_prefix: format!("{key_prefix}:agent_limit"),
            limit_per_minute,
            rejected,
        }
    }

    /// Consume one event for `token`. Returns `false` if the request must be
    /// rejected.
    pub async fn allow(&self, token: &str) -> bool {
        let allowed = self.check(token).await;
        if !allowed {
            self.rejected.inc();
        }
        allowed
    }

    async fn check(&self, token: &str) -> bool {
        let key = self.build_key(token, SystemTime::now());
        let count = match self.backend.get_u64(&key).await {
            Ok(count) => count.unwrap_or(0),
            Err(e) => {
                error!(error = %e, captured = true, "Error retrieving minute bucket count");
                return false;
            }
        };
        if count >= self.limit_per_minute {
            debug!(count, limit = self.limit_per_minute, "Rate limit exceeded");
            return false;
        }
        if let Err(e) = self.backend.incr_with_ttl(&key, BUCKET_TTL).await {
            error!(error = %e, captured = true, "Error incrementing token bucket count");
            return false;
        }
        true
    }

    /// Only the first half of the token goes into the key, hashed. The second
    /// half stays secret so the key cannot be used to recover the token.
    fn build_key(&self, token: &str, now: SystemTime) -> Vec<u8> {
        let half = &token.as_bytes()[..token.len() / 2];
        let hash = Sha256::digest(half);
        let secs = now.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());
        let minute = u16::try_from(secs / 60 % 60).unwrap_or_default();

        let mut key = Vec::with_capacity(self.key_prefix.len() + hash.len() + 4);
        key.extend_from_slice(self.key_prefix.as_bytes());
        key.push(b':');
        key.extend_from_slice(&hash);
        key.push(b':');
        key.extend_from_slice(&minute.to_le_bytes());
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryBackend;

    fn limiter(backend: &Arc<MemoryBackend>, limit: u64) -> TokenLimiter {
        let counter = IntCounter::new("rejected", "rejected").unwrap();
        TokenLimiter::new(backend.clone(), "kas", limit, counter)
    }

    #[tokio::test]
    async fn test_allows_up_to_limit() {
        let backend = Arc::new(MemoryBackend::new());
        let l = limiter(&backend, 2);
        assert!(l.allow("some-token-value").await);
        assert!(l.allow("some-token-value").await);
        assert!(!l.allow("some-token-value").await);
        assert_eq!(l.rejected.get(), 1);
        // a different token has its own bucket
        assert!(l.allow("other-token-value").await);
    }

    #[tokio::test]
    async fn test_fails_closed() {
        let backend = Arc::new(MemoryBackend::new());
        let l = limiter(&backend, 100);
        backend.set_failing(true);
        assert!(!l.allow("token").await);
        assert_eq!(l.rejected.get(), 1);
    }

    #[tokio::test]
    async fn test_bucket_has_ttl() {
        let backend = Arc::new(MemoryBackend::new());
        let l = limiter(&backend, 100);
        let now = SystemTime::now();
        assert!(l.allow("token").await);
        let key = l.build_key("token", now);
        assert_eq!(backend.get_u64(&key).await.unwrap(), Some(1));
        assert_eq!(backend.ttl_of(&key), Some(BUCKET_TTL));
    }

    #[test]
    fn test_key_layout() {
        let backend = Arc::new(MemoryBackend::new());
        let l = limiter(&backend, 1);
        let t = UNIX_EPOCH + Duration::from_secs(3 * 60 + 5);
        let key = l.build_key("abcdef", t);
        let prefix = b"kas:agent_limit:";
        assert!(key.starts_with(prefix));
        assert_eq!(&key[prefix.len()..prefix.len() + 32], Sha256::digest(b"abc").as_slice());
        assert_eq!(&key[key.len() - 3..], &[b':', 3, 0]);
        // the second half of the token does not affect the key
        assert_eq!(key, l.build_key("abcxyz", t));
    }
}
