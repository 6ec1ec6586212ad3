//! Two-level map `K1 -> (K2 -> bytes)` kept in backing-store hashes.
//!
//! Each `K1` is one hash; each `K2` is a field. Values are stored as
//! [`ExpiringValue`] records so readers can ignore entries whose writer
//! stopped refreshing them. The hash key itself carries a TTL as well, so
//! hashes written by a crashed process eventually disappear.
//!
//! [`ExpiringHash`] is not synchronized. Mutating calls update the local view
//! immediately and return an [`IoFunc`]: the store write, to be awaited after
//! the caller released whatever lock guards the hash.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::future::{self, BoxFuture};
use futures::FutureExt;
use prost::Message;
use tracing::debug;

use super::{Backend, Field};
use crate::errors::Error;

/// Deferred store I/O.
pub type IoFunc = BoxFuture<'static, Result<(), Error>>;

/// Value record as stored in a hash field.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ExpiringValue {
    /// Unix seconds.
    #[prost(int64, tag = "1")]
    pub expires_at: i64,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

/// Only the timestamp, for GC which does not care about payloads.
#[derive(Clone, PartialEq, prost::Message)]
struct ExpiringValueTimestamp {
    #[prost(int64, tag = "1")]
    expires_at: i64,
}

pub fn unix_now() -> i64 {
    unix_seconds(SystemTime::now())
}

fn unix_seconds(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

/// Read side of a hash. Cheap to clone, safe to use without holding the
/// lock that guards the owning [`ExpiringHash`].
pub struct HashStore<K1> {
    backend: Arc<dyn Backend>,
    key_to_redis: Arc<dyn Fn(&K1) -> Vec<u8> + Send + Sync>,
}

impl<K1> Clone for HashStore<K1> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            key_to_redis: self.key_to_redis.clone(),
        }
    }
}

impl<K1> HashStore<K1> {
    /// Iterate live entries of one hash. `cb` gets the raw field and either
    /// the decoded payload or a decode error; returning `true` stops the
    /// scan. Expired entries are deleted afterwards. Returns the number of
    /// deleted fields.
    pub async fn scan<F>(&self, key: &K1, mut cb: F) -> Result<usize, Error>
    where
        F: FnMut(&[u8], Result<Vec<u8>, Error>) -> bool,
    {
        let now = unix_now();
        let redis_key = (self.key_to_redis)(key);
        let fields = self.backend.hscan_all(&redis_key).await?;
        let mut expired = Vec::new();
        for (field, raw) in fields {
            match ExpiringValue::decode(raw.as_slice()) {
                Ok(ev) if ev.expires_at < now => expired.push(field),
                Ok(ev) => {
                    if cb(&field, Ok(ev.value)) {
                        break;
                    }
                }
                Err(e) => {
                    if cb(&field, Err(Error::from(e))) {
                        break;
                    }
                }
            }
        }
        self.delete_fields(&redis_key, expired).await
    }

    pub async fn len(&self, key: &K1) -> Result<u64, Error> {
        self.backend.hlen(&(self.key_to_redis)(key)).await
    }

    async fn gc_hash(&self, redis_key: &[u8]) -> Result<usize, Error> {
        let now = unix_now();
        let fields = self.backend.hscan_all(redis_key).await?;
        let mut expired = Vec::new();
        for (field, raw) in fields {
            let ts = ExpiringValueTimestamp::decode(raw.as_slice())?;
            if ts.expires_at < now {
                expired.push(field);
            }
        }
        self.delete_fields(redis_key, expired).await
    }

    async fn delete_fields(&self, redis_key: &[u8], fields: Vec<Vec<u8>>) -> Result<usize, Error> {
        if fields.is_empty() {
            return Ok(0);
        }
        let n = fields.len();
        self.backend.hdel(redis_key, fields).await?;
        Ok(n)
    }
}

/// Locally tracked two-level map mirrored into the backing store.
pub struct ExpiringHash<K1, K2> {
    store: HashStore<K1>,
    field_to_redis: Arc<dyn Fn(&K2) -> Vec<u8> + Send + Sync>,
    ttl: Duration,
    data: HashMap<K1, HashMap<K2, ExpiringValue>>,
}

impl<K1, K2> ExpiringHash<K1, K2>
where
    K1: Hash + Eq + Clone + Send + Sync + 'static,
    K2: Hash + Eq + Clone + Send + Sync + 'static,
{
    pub fn new(
        backend: Arc<dyn Backend>,
        key_to_redis: impl Fn(&K1) -> Vec<u8> + Send + Sync + 'static,
        field_to_redis: impl Fn(&K2) -> Vec<u8> + Send + Sync + 'static,
        ttl: Duration,
    ) -> Self {
        Self {
            store: HashStore {
                backend,
                key_to_redis: Arc::new(key_to_redis),
            },
            field_to_redis: Arc::new(field_to_redis),
            ttl,
            data: HashMap::new(),
        }
    }

    pub fn store(&self) -> HashStore<K1> {
        self.store.clone()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn expires_at(&self) -> i64 {
        unix_seconds(SystemTime::now() + self.ttl)
    }

    /// Record `value` under `(key, field)` and return the write.
    pub fn set(&mut self, key: K1, field: K2, value: Vec<u8>) -> IoFunc {
        let ev = ExpiringValue {
            expires_at: self.expires_at(),
            value,
        };
        let fields = vec![((self.field_to_redis)(&field), ev.encode_to_vec())];
        self.data
            .entry(key.clone())
            .or_default()
            .insert(field, ev);
        self.write(&key, fields)
    }

    /// Remove `(key, field)` locally and return the delete.
    pub fn unset(&mut self, key: &K1, field: &K2) -> IoFunc {
        self.forget(key, field);
        let store = self.store.clone();
        let redis_key = (store.key_to_redis)(key);
        let redis_field = (self.field_to_redis)(field);
        async move {
            store.backend.hdel(&redis_key, vec![redis_field]).await?;
            Ok(())
        }
        .boxed()
    }

    /// Remove `(key, field)` locally only.
    pub fn forget(&mut self, key: &K1, field: &K2) {
        if let Some(fields) = self.data.get_mut(key) {
            fields.remove(field);
            if fields.is_empty() {
                self.data.remove(key);
            }
        }
    }

    /// Rewrite every entry that expires at or before `deadline`. Entries that
    /// outlive the deadline are left alone.
    pub fn refresh(&mut self, deadline: SystemTime) -> IoFunc {
        let deadline = unix_seconds(deadline);
        let expires_at = self.expires_at();
        let mut writes = Vec::new();
        for (key, fields) in &mut self.data {
            let mut batch: Vec<Field> = Vec::new();
            for (field, ev) in fields.iter_mut() {
                if ev.expires_at > deadline {
                    continue;
                }
                ev.expires_at = expires_at;
                batch.push(((self.field_to_redis)(field), ev.encode_to_vec()));
            }
            if !batch.is_empty() {
                writes.push(((self.store.key_to_redis)(key), batch));
            }
        }
        let backend = self.store.backend.clone();
        let ttl = self.ttl;
        async move {
            let results = future::join_all(
                writes
                    .into_iter()
                    .map(|(redis_key, batch)| {
                        let backend = backend.clone();
                        async move { backend.hset_with_ttl(&redis_key, batch, ttl).await }
                    }),
            )
            .await;
            results.into_iter().collect::<Result<(), Error>>()
        }
        .boxed()
    }

    /// A GC pass over every hash this process has entries in. The returned
    /// future does not touch local state and may run concurrently with
    /// anything else. It resolves to the number of deleted fields.
    pub fn gc(&self) -> BoxFuture<'static, Result<usize, Error>> {
        let store = self.store.clone();
        let keys: Vec<Vec<u8>> = self.data.keys().map(|k| (store.key_to_redis)(k)).collect();
        async move {
            let mut deleted = 0;
            for key in keys {
                deleted += store.gc_hash(&key).await?;
            }
            Ok(deleted)
        }
        .boxed()
    }

    /// Delete every field this process owns, locally and in the store.
    pub fn clear(&mut self) -> IoFunc {
        let deletes: Vec<(Vec<u8>, Vec<Vec<u8>>)> = self
            .data
            .drain()
            .map(|(key, fields)| {
                (
                    (self.store.key_to_redis)(&key),
                    fields.keys().map(|f| (self.field_to_redis)(f)).collect(),
                )
            })
            .collect();
        let backend = self.store.backend.clone();
        async move {
            let mut result = Ok(());
            for (key, fields) in deletes {
                if let Err(e) = backend.hdel(&key, fields).await {
                    debug!(error = %e, "Failed to clear hash");
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
            }
            result
        }
        .boxed()
    }

    /// Number of locally tracked fields under `key`.
    pub fn local_len(&self, key: &K1) -> usize {
        self.data.get(key).map_or(0, HashMap::len)
    }

    fn write(&self, key: &K1, fields: Vec<Field>) -> IoFunc {
        let backend = self.store.backend.clone();
        let redis_key = (self.store.key_to_redis)(key);
        let ttl = self.ttl;
        async move { backend.hset_with_ttl(&redis_key, fields, ttl).await }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redistool::prefixed_i64_key;
    use crate::testing::MemoryBackend;

    fn hash(backend: &Arc<MemoryBackend>) -> ExpiringHash<i64, String> {
        ExpiringHash::new(
            backend.clone(),
            |k: &i64| prefixed_i64_key("t:", *k),
            |f: &String| f.as_bytes().to_vec(),
            Duration::from_secs(60),
        )
    }

    async fn scan_all(h: &ExpiringHash<i64, String>, key: i64) -> Vec<(String, Vec<u8>)> {
        let mut out = Vec::new();
        h.store()
            .scan(&key, |field, value| {
                out.push((String::from_utf8_lossy(field).to_string(), value.unwrap()));
                false
            })
            .await
            .unwrap();
        out
    }

    #[tokio::test]
    async fn test_set_scan_unset() {
        let backend = Arc::new(MemoryBackend::new());
        let mut h = hash(&backend);
        h.set(1, "a".to_string(), b"x".to_vec()).await.unwrap();
        h.set(1, "b".to_string(), b"y".to_vec()).await.unwrap();
        let mut got = scan_all(&h, 1).await;
        got.sort();
        assert_eq!(
            got,
            vec![("a".to_string(), b"x".to_vec()), ("b".to_string(), b"y".to_vec())]
        );
        assert_eq!(h.store().len(&1).await.unwrap(), 2);

        h.unset(&1, &"a".to_string()).await.unwrap();
        assert_eq!(scan_all(&h, 1).await.len(), 1);
        assert_eq!(h.local_len(&1), 1);
        assert!(backend.ttl_of(&prefixed_i64_key("t:", 1)).is_some());
    }

    #[tokio::test]
    async fn test_forget_keeps_store() {
        let backend = Arc::new(MemoryBackend::new());
        let mut h = hash(&backend);
        h.set(1, "a".to_string(), vec![]).await.unwrap();
        h.forget(&1, &"a".to_string());
        assert_eq!(h.local_len(&1), 0);
        assert_eq!(scan_all(&h, 1).await.len(), 1);
        // nothing tracked locally, so clear leaves the entry alone
        h.clear().await.unwrap();
        assert_eq!(scan_all(&h, 1).await.len(), 1);
    }

    #[tokio::test]
    async fn test_scan_deletes_expired() {
        let backend = Arc::new(MemoryBackend::new());
        let h = hash(&backend);
        let key = prefixed_i64_key("t:", 7);
        let stale = ExpiringValue {
            expires_at: unix_now() - 10,
            value: vec![],
        };
        let live = ExpiringValue {
            expires_at: unix_now() + 100,
            value: b"v".to_vec(),
        };
        backend
            .hset_with_ttl(
                &key,
                vec![
                    (b"old".to_vec(), stale.encode_to_vec()),
                    (b"new".to_vec(), live.encode_to_vec()),
                ],
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        let mut seen = Vec::new();
        let deleted = h
            .store()
            .scan(&7, |field, _| {
                seen.push(field.to_vec());
                false
            })
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(seen, vec![b"new".to_vec()]);
        assert_eq!(backend.hlen(&key).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_scan_stops_when_done() {
        let backend = Arc::new(MemoryBackend::new());
        let mut h = hash(&backend);
        for f in ["a", "b", "c"] {
            h.set(1, f.to_string(), vec![]).await.unwrap();
        }
        let mut calls = 0;
        h.store()
            .scan(&1, |_, _| {
                calls += 1;
                true
            })
            .await
            .unwrap();
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_refresh_skips_entries_beyond_deadline() {
        let backend = Arc::new(MemoryBackend::new());
        let mut h = hash(&backend);
        h.set(1, "a".to_string(), vec![]).await.unwrap();
        let writes_before = backend.write_count();

        // entry expires in ~60s; a deadline 30s out must not rewrite it
        h.refresh(SystemTime::now() + Duration::from_secs(30))
            .await
            .unwrap();
        assert_eq!(backend.write_count(), writes_before);

        // a deadline past its expiry does
        h.refresh(SystemTime::now() + Duration::from_secs(120))
            .await
            .unwrap();
        assert_eq!(backend.write_count(), writes_before + 1);
    }

    #[tokio::test]
    async fn test_gc_removes_only_expired() {
        let backend = Arc::new(MemoryBackend::new());
        let mut h = hash(&backend);
        h.set(1, "live".to_string(), vec![]).await.unwrap();
        let key = prefixed_i64_key("t:", 1);
        let stale = ExpiringValue {
            expires_at: unix_now() - 1,
            value: vec![],
        };
        backend
            .hset_with_ttl(
                &key,
                vec![(b"dead".to_vec(), stale.encode_to_vec())],
                Duration::from_secs(60),
            )
            .await
            .unwrap();
        assert_eq!(h.gc().await.unwrap(), 1);
        assert_eq!(backend.hlen(&key).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_clear_deletes_owned_fields() {
        let backend = Arc::new(MemoryBackend::new());
        let mut h = hash(&backend);
        h.set(1, "a".to_string(), vec![]).await.unwrap();
        h.set(2, "b".to_string(), vec![]).await.unwrap();
        h.clear().await.unwrap();
        assert_eq!(h.local_len(&1), 0);
        assert_eq!(h.store().len(&1).await.unwrap(), 0);
        assert_eq!(h.store().len(&2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_io_failure_reported() {
        let backend = Arc::new(MemoryBackend::new());
        let mut h = hash(&backend);
        backend.set_failing(true);
        assert!(h.set(1, "a".to_string(), vec![]).await.is_err());
        // local state is updated regardless and the next refresh reconciles
        assert_eq!(h.local_len(&1), 1);
        backend.set_failing(false);
        h.refresh(SystemTime::now() + Duration::from_secs(120))
            .await
            .unwrap();
        assert_eq!(h.store().len(&1).await.unwrap(), 1);
    }
}
