//! Directory of kas instances holding tunnels, per agent.
//!
//! Every instance advertises its own private API URL under each agent it has
//! at least one tunnel from: `{prefix}:kas_by_agent_id:<agent id>` is a hash
//! whose fields are URLs. Local tunnels are reference counted so the entry is
//! written once per agent, not once per tunnel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use futures::future::{self, FutureExt};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::Error;
use crate::redistool::expiring_hash::HashStore;
use crate::redistool::{prefixed_i64_key, Backend, ExpiringHash, IoFunc};

/// Entries are refreshed this long before the refresh period elapses.
const REFRESH_OVERLAP: Duration = Duration::from_secs(5);
const CLEAR_TIMEOUT: Duration = Duration::from_secs(10);

/// Write side of the directory.
pub trait Registerer: Send + Sync {
    /// One more tunnel to `agent_id` is held here.
    fn register_tunnel(&self, agent_id: i64) -> IoFunc;
    /// One tunnel to `agent_id` is gone.
    fn unregister_tunnel(&self, agent_id: i64) -> IoFunc;
}

/// Read side of the directory.
#[async_trait]
pub trait Querier: Send + Sync {
    /// Call `cb` with every URL advertised for `agent_id`, in store order.
    /// `cb` returns `true` to stop.
    async fn kas_urls_by_agent_id(
        &self,
        agent_id: i64,
        cb: &mut (dyn FnMut(String) -> bool + Send),
    ) -> Result<(), Error>;
}

struct Inner {
    refs: HashMap<i64, usize>,
    hash: ExpiringHash<i64, String>,
}

pub struct Tracker {
    own_url: String,
    refresh_period: Duration,
    gc_period: Duration,
    store: HashStore<i64>,
    inner: Mutex<Inner>,
}

impl Tracker {
    pub fn new(
        backend: Arc<dyn Backend>,
        key_prefix: &str,
        own_url: String,
        ttl: Duration,
        refresh_period: Duration,
        gc_period: Duration,
    ) -> Self {
        let prefix = format!("{key_prefix}:kas_by_agent_id:");
        let hash = ExpiringHash::new(
            backend,
            move |agent_id: &i64| prefixed_i64_key(&prefix, *agent_id),
            |url: &String| url.as_bytes().to_vec(),
            ttl,
        );
        Self {
            own_url,
            refresh_period,
            gc_period,
            store: hash.store(),
            inner: Mutex::new(Inner {
                refs: HashMap::new(),
                hash,
            }),
        }
    }

    pub fn own_url(&self) -> &str {
        &self.own_url
    }

    /// Keep entries alive and collect garbage until `ctx` is cancelled, then
    /// remove everything this instance advertised.
    pub async fn run(&self, ctx: CancellationToken) {
        let mut refresh = tokio::time::interval(self.refresh_period);
        let mut gc = tokio::time::interval(self.gc_period);
        // both fire immediately otherwise
        refresh.tick().await;
        gc.tick().await;
        loop {
            tokio::select! {
                () = ctx.cancelled() => break,
                _ = refresh.tick() => self.refresh().await,
                _ = gc.tick() => self.gc().await,
            }
        }
        let clear = self.inner.lock().hash.clear();
        match tokio::time::timeout(CLEAR_TIMEOUT, clear).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to remove tunnel records"),
            Err(_) => warn!("Timed out removing tunnel records"),
        }
    }

    async fn refresh(&self) {
        let deadline = SystemTime::now() + self.refresh_period.saturating_sub(REFRESH_OVERLAP);
        let io = self.inner.lock().hash.refresh(deadline);
        if let Err(e) = io.await {
            warn!(error = %e, "Failed to refresh tunnel records");
        }
    }

    async fn gc(&self) {
        let gc = self.inner.lock().hash.gc();
        match gc.await {
            Ok(0) => {}
            Ok(deleted) => info!(deleted, "Deleted expired agent tunnel records"),
            Err(e) => warn!(error = %e, "Failed to GC tunnel records"),
        }
    }
}

impl Registerer for Tracker {
    fn register_tunnel(&self, agent_id: i64) -> IoFunc {
        let mut inner = self.inner.lock();
        let refs = inner.refs.entry(agent_id).or_default();
        *refs += 1;
        if *refs > 1 {
            return future::ok(()).boxed();
        }
        debug!(agent_id, "Advertising tunnel");
        inner.hash.set(agent_id, self.own_url.clone(), Vec::new())
    }

    fn unregister_tunnel(&self, agent_id: i64) -> IoFunc {
        let mut inner = self.inner.lock();
        let Some(refs) = inner.refs.get_mut(&agent_id) else {
            return future::ok(()).boxed();
        };
        *refs -= 1;
        if *refs > 0 {
            return future::ok(()).boxed();
        }
        inner.refs.remove(&agent_id);
        debug!(agent_id, "Withdrawing tunnel");
        inner.hash.unset(&agent_id, &self.own_url)
    }
}

#[async_trait]
impl Querier for Tracker {
    async fn kas_urls_by_agent_id(
        &self,
        agent_id: i64,
        cb: &mut (dyn FnMut(String) -> bool + Send),
    ) -> Result<(), Error> {
        let deleted = self
            .store
            .scan(&agent_id, |field, value| {
                if let Err(e) = value {
                    debug!(agent_id, error = %e, "Skipping undecodable tunnel record");
                    return false;
                }
                match std::str::from_utf8(field) {
                    Ok(url) => cb(url.to_string()),
                    Err(_) => false,
                }
            })
            .await?;
        if deleted > 0 {
            debug!(agent_id, deleted, "Deleted expired tunnel records during scan");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryBackend;

    const OWN_URL: &str = "grpc://10.0.0.1:8155";

    fn tracker(backend: &Arc<MemoryBackend>) -> Tracker {
        Tracker::new(
            backend.clone(),
            "kas",
            OWN_URL.to_string(),
            Duration::from_secs(300),
            Duration::from_secs(240),
            Duration::from_secs(600),
        )
    }

    async fn urls(t: &Tracker, agent_id: i64) -> Vec<String> {
        let mut out = Vec::new();
        t.kas_urls_by_agent_id(agent_id, &mut |url| {
            out.push(url);
            false
        })
        .await
        .unwrap();
        out
    }

    #[tokio::test]
    async fn test_reference_counted_registration() {
        let backend = Arc::new(MemoryBackend::new());
        let t = tracker(&backend);
        t.register_tunnel(42).await.unwrap();
        t.register_tunnel(42).await.unwrap();
        assert_eq!(backend.write_count(), 1);
        assert_eq!(urls(&t, 42).await, vec![OWN_URL.to_string()]);

        t.unregister_tunnel(42).await.unwrap();
        assert_eq!(urls(&t, 42).await, vec![OWN_URL.to_string()]);
        t.unregister_tunnel(42).await.unwrap();
        assert!(urls(&t, 42).await.is_empty());

        // unbalanced unregister is a no-op
        t.unregister_tunnel(42).await.unwrap();
    }

    #[tokio::test]
    async fn test_agents_are_separate() {
        let backend = Arc::new(MemoryBackend::new());
        let t = tracker(&backend);
        t.register_tunnel(1).await.unwrap();
        assert!(urls(&t, 2).await.is_empty());
        assert!(backend
            .keys()
            .contains(&prefixed_i64_key("kas:kas_by_agent_id:", 1)));
    }

    #[tokio::test]
    async fn test_peers_share_the_directory() {
        let backend = Arc::new(MemoryBackend::new());
        let a = tracker(&backend);
        let b = Tracker::new(
            backend.clone(),
            "kas",
            "grpc://10.0.0.2:8155".to_string(),
            Duration::from_secs(300),
            Duration::from_secs(240),
            Duration::from_secs(600),
        );
        a.register_tunnel(42).await.unwrap();
        b.register_tunnel(42).await.unwrap();
        let mut got = urls(&a, 42).await;
        got.sort();
        assert_eq!(got, vec![OWN_URL.to_string(), "grpc://10.0.0.2:8155".to_string()]);

        let mut first = Vec::new();
        a.kas_urls_by_agent_id(42, &mut |url| {
            first.push(url);
            true
        })
        .await
        .unwrap();
        assert_eq!(first.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_refreshes_and_clears_on_shutdown() {
        let backend = Arc::new(MemoryBackend::new());
        // record TTL shorter than the refresh period so every refresh rewrites
        let t = Arc::new(Tracker::new(
            backend.clone(),
            "kas",
            OWN_URL.to_string(),
            Duration::from_secs(10),
            Duration::from_secs(60),
            Duration::from_secs(600),
        ));
        t.register_tunnel(42).await.unwrap();
        let ctx = CancellationToken::new();
        let run = tokio::spawn({
            let t = t.clone();
            let ctx = ctx.clone();
            async move { t.run(ctx).await }
        });
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(backend.write_count(), 2, "entry must be rewritten by refresh");

        ctx.cancel();
        run.await.unwrap();
        assert!(urls(&t, 42).await.is_empty());
    }
}
