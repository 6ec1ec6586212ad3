use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::errors::Error;
use crate::redistool::{Backend, Field};

enum Value {
    Hash(HashMap<Vec<u8>, Vec<u8>>),
    Counter(u64),
}

struct Slot {
    value: Value,
    ttl: Option<Duration>,
    expires: Option<Instant>,
}

/// In-memory [`Backend`]. Key TTLs are honoured lazily against tokio's
/// clock, so paused-time tests can expire hashes.
#[derive(Default)]
pub struct MemoryBackend {
    data: Mutex<HashMap<Vec<u8>, Slot>>,
    failing: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// TTL most recently set on `key`.
    pub fn ttl_of(&self, key: &[u8]) -> Option<Duration> {
        let mut data = self.data.lock();
        evict(&mut data, key);
        data.get(key).and_then(|s| s.ttl)
    }

    /// Number of hash writes performed so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Every key currently stored.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        let mut data = self.data.lock();
        let now = Instant::now();
        data.retain(|_, s| s.expires.is_none_or(|e| e > now));
        data.keys().cloned().collect()
    }

    fn check(&self) -> Result<(), Error> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "injected failure",
            ))));
        }
        Ok(())
    }
}

fn evict(data: &mut HashMap<Vec<u8>, Slot>, key: &[u8]) {
    let expired = data
        .get(key)
        .and_then(|s| s.expires)
        .is_some_and(|e| e <= Instant::now());
    if expired {
        data.remove(key);
    }
}

fn set_ttl(slot: &mut Slot, ttl: Duration) {
    slot.ttl = Some(ttl);
    slot.expires = Some(Instant::now() + ttl);
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn hset_with_ttl(
        &self,
        key: &[u8],
        fields: Vec<Field>,
        ttl: Duration,
    ) -> Result<(), Error> {
        self.check()?;
        if fields.is_empty() {
            return Ok(());
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut data = self.data.lock();
        evict(&mut data, key);
        let slot = data.entry(key.to_vec()).or_insert_with(|| Slot {
            value: Value::Hash(HashMap::new()),
            ttl: None,
            expires: None,
        });
        if let Value::Hash(hash) = &mut slot.value {
            hash.extend(fields);
        } else {
            slot.value = Value::Hash(fields.into_iter().collect());
        }
        set_ttl(slot, ttl);
        Ok(())
    }

    async fn hdel(&self, key: &[u8], fields: Vec<Vec<u8>>) -> Result<u64, Error> {
        self.check()?;
        let mut data = self.data.lock();
        evict(&mut data, key);
        let Some(Slot {
            value: Value::Hash(hash),
            ..
        }) = data.get_mut(key)
        else {
            return Ok(0);
        };
        let removed = fields.iter().filter(|f| hash.remove(*f).is_some()).count();
        if hash.is_empty() {
            data.remove(key);
        }
        Ok(removed as u64)
    }

    async fn hscan_all(&self, key: &[u8]) -> Result<Vec<Field>, Error> {
        self.check()?;
        let mut data = self.data.lock();
        evict(&mut data, key);
        match data.get(key) {
            Some(Slot {
                value: Value::Hash(hash),
                ..
            }) => Ok(hash.iter().map(|(f, v)| (f.clone(), v.clone())).collect()),
            _ => Ok(Vec::new()),
        }
    }

    async fn hlen(&self, key: &[u8]) -> Result<u64, Error> {
        self.check()?;
        let mut data = self.data.lock();
        evict(&mut data, key);
        match data.get(key) {
            Some(Slot {
                value: Value::Hash(hash),
                ..
            }) => Ok(hash.len() as u64),
            _ => Ok(0),
        }
    }

    async fn get_u64(&self, key: &[u8]) -> Result<Option<u64>, Error> {
        self.check()?;
        let mut data = self.data.lock();
        evict(&mut data, key);
        match data.get(key) {
            Some(Slot {
                value: Value::Counter(n),
                ..
            }) => Ok(Some(*n)),
            _ => Ok(None),
        }
    }

    async fn incr_with_ttl(&self, key: &[u8], ttl: Duration) -> Result<(), Error> {
        self.check()?;
        let mut data = self.data.lock();
        evict(&mut data, key);
        let slot = data.entry(key.to_vec()).or_insert_with(|| Slot {
            value: Value::Counter(0),
            ttl: None,
            expires: None,
        });
        match &mut slot.value {
            Value::Counter(n) => *n += 1,
            Value::Hash(_) => slot.value = Value::Counter(1),
        }
        set_ttl(slot, ttl);
        Ok(())
    }
}
