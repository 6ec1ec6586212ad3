//! Backing-store plumbing.
//!
//! [`Backend`] is the narrow set of commands kas needs from the shared store:
//! hashes with a key TTL, and per-minute counters. [`RedisBackend`] speaks to
//! Redis through a reconnecting `ConnectionManager`; `testing::MemoryBackend`
//! implements the same trait in memory.

pub mod expiring_hash;
pub mod token_limiter;

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::debug;

use crate::errors::Error;

pub use expiring_hash::{ExpiringHash, IoFunc};
pub use token_limiter::TokenLimiter;

/// A hash field and its encoded value.
pub type Field = (Vec<u8>, Vec<u8>);

#[async_trait]
pub trait Backend: Send + Sync {
    /// Atomically set `fields` in the hash at `key` and reset the key's TTL.
    async fn hset_with_ttl(&self, key: &[u8], fields: Vec<Field>, ttl: Duration)
        -> Result<(), Error>;

    /// Delete fields from a hash. Returns the number removed.
    async fn hdel(&self, key: &[u8], fields: Vec<Vec<u8>>) -> Result<u64, Error>;

    /// All fields of a hash.
    async fn hscan_all(&self, key: &[u8]) -> Result<Vec<Field>, Error>;

    async fn hlen(&self, key: &[u8]) -> Result<u64, Error>;

    /// Integer value of a plain key. `None` if the key does not exist.
    async fn get_u64(&self, key: &[u8]) -> Result<Option<u64>, Error>;

    /// Atomically increment a counter and set its TTL.
    async fn incr_with_ttl(&self, key: &[u8], ttl: Duration) -> Result<(), Error>;
}

/// `prefix` followed by the little-endian bytes of `id`.
pub fn prefixed_i64_key(prefix: &str, id: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(prefix.len() + 8);
    key.extend_from_slice(prefix.as_bytes());
    key.extend_from_slice(&id.to_le_bytes());
    key
}

const HSCAN_COUNT: usize = 100;

/// Redis implementation of [`Backend`].
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    op_timeout: Duration,
}

impl RedisBackend {
    /// Connect to `url`, giving up after `dial_timeout`.
    pub async fn connect(url: &str, dial_timeout: Duration, op_timeout: Duration) -> Result<Self, Error> {
        let client = redis::Client::open(url)?;
        let conn = tokio::time::timeout(dial_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| timed_out("connect"))??;
        debug!(url, "Redis connection established");
        Ok(Self { conn, op_timeout })
    }

    async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T, Error>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        tokio::time::timeout(self.op_timeout, f)
            .await
            .map_err(|_| timed_out(op))?
            .map_err(Error::from)
    }
}

fn timed_out(op: &'static str) -> Error {
    Error::Redis(redis::RedisError::from((
        redis::ErrorKind::IoError,
        "Redis operation timed out",
        op.to_string(),
    )))
}

#[async_trait]
impl Backend for RedisBackend {
    async fn hset_with_ttl(
        &self,
        key: &[u8],
        fields: Vec<Field>,
        ttl: Duration,
    ) -> Result<(), Error> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut hset = redis::cmd("HSET");
        hset.arg(key);
        for (field, value) in &fields {
            hset.arg(field).arg(value);
        }
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        self.run("HSET", async move {
            redis::pipe()
                .atomic()
                .add_command(hset)
                .ignore()
                .cmd("PEXPIRE")
                .arg(key)
                .arg(ttl_ms)
                .ignore()
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn hdel(&self, key: &[u8], fields: Vec<Vec<u8>>) -> Result<u64, Error> {
        if fields.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        self.run("HDEL", async move {
            let removed: u64 = redis::cmd("HDEL")
                .arg(key)
                .arg(fields)
                .query_async(&mut conn)
                .await?;
            Ok(removed)
        })
        .await
    }

    async fn hscan_all(&self, key: &[u8]) -> Result<Vec<Field>, Error> {
        let mut conn = self.conn.clone();
        self.run("HSCAN", async move {
            let mut out = Vec::new();
            let mut cursor: u64 = 0;
            loop {
                let (next, page): (u64, Vec<Field>) = redis::cmd("HSCAN")
                    .arg(key)
                    .arg(cursor)
                    .arg("COUNT")
                    .arg(HSCAN_COUNT)
                    .query_async(&mut conn)
                    .await?;
                out.extend(page);
                if next == 0 {
                    return Ok(out);
                }
                cursor = next;
            }
        })
        .await
    }

    async fn hlen(&self, key: &[u8]) -> Result<u64, Error> {
        let mut conn = self.conn.clone();
        self.run("HLEN", async move {
            let len: u64 = redis::cmd("HLEN").arg(key).query_async(&mut conn).await?;
            Ok(len)
        })
        .await
    }

    async fn get_u64(&self, key: &[u8]) -> Result<Option<u64>, Error> {
        let mut conn = self.conn.clone();
        self.run("GET", async move {
            let value: Option<u64> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
            Ok(value)
        })
        .await
    }

    async fn incr_with_ttl(&self, key: &[u8], ttl: Duration) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        self.run("INCR", async move {
            redis::pipe()
                .atomic()
                .cmd("INCR")
                .arg(key)
                .ignore()
                .cmd("EXPIRE")
                .arg(key)
                .arg(ttl.as_secs())
                .ignore()
                .query_async(&mut conn)
                .await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_i64_key() {
        let key = prefixed_i64_key("p:", 1);
        assert_eq!(key, b"p:\x01\x00\x00\x00\x00\x00\x00\x00".to_vec());
        let neg = prefixed_i64_key("", -1);
        assert_eq!(neg, vec![0xff; 8]);
    }
}
