//! Shared directory polling.
//!
//! Every request routed to an agent wants the same thing: the URLs of the kas
//! instances holding tunnels to that agent, over and over until one of them
//! works. [`AggregatingQuerier`] runs one poller per agent no matter how many
//! requests are waiting on it and fans every poll cycle out to all of them.
//! The result of the last cycle is kept after the last consumer leaves, until
//! the GC loop drops it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::tracker::Querier;
use crate::retry::{Attempt, PollConfig, Poller};

type Urls = Arc<Vec<String>>;

struct PollingContext {
    urls: Arc<watch::Sender<Urls>>,
    consumers: usize,
    /// Set while a poller runs.
    poller: Option<CancellationToken>,
    stopped_at: Option<Instant>,
}

type Contexts = Arc<Mutex<HashMap<i64, PollingContext>>>;

pub struct AggregatingQuerier {
    delegate: Arc<dyn Querier>,
    poll_config: PollConfig,
    gc_period: Duration,
    contexts: Contexts,
}

impl AggregatingQuerier {
    pub fn new(delegate: Arc<dyn Querier>, poll_config: PollConfig, gc_period: Duration) -> Self {
        Self {
            delegate,
            poll_config,
            gc_period,
            contexts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Feed `cb` with the URLs of every poll cycle for `agent_id` until it
    /// returns `true` or `ctx` is cancelled. The first argument of `cb` is
    /// `true` for the first URL of a cycle. Cached URLs, if any, are delivered
    /// as the first cycle.
    pub async fn poll_kas_urls_by_agent_id<F>(
        &self,
        ctx: &CancellationToken,
        agent_id: i64,
        mut cb: F,
    ) where
        F: FnMut(bool, &str) -> bool,
    {
        let (mut rx, _guard) = self.subscribe(agent_id);
        let cached = rx.borrow_and_update().clone();
        if deliver(&cached, &mut cb) {
            return;
        }
        loop {
            tokio::select! {
                () = ctx.cancelled() => return,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            let urls = rx.borrow_and_update().clone();
            if deliver(&urls, &mut cb) {
                return;
            }
        }
    }

    /// URLs seen by the last poll cycle for `agent_id`.
    pub fn cached_kas_urls_by_agent_id(&self, agent_id: i64) -> Vec<String> {
        self.contexts
            .lock()
            .get(&agent_id)
            .map(|c| c.urls.borrow().to_vec())
            .unwrap_or_default()
    }

    /// Drop cached results of agents nobody polled for a GC period.
    pub async fn run(&self, ctx: CancellationToken) {
        let mut gc = tokio::time::interval(self.gc_period);
        gc.tick().await;
        loop {
            tokio::select! {
                () = ctx.cancelled() => break,
                _ = gc.tick() => self.gc(),
            }
        }
        for c in self.contexts.lock().values_mut() {
            if let Some(poller) = c.poller.take() {
                poller.cancel();
            }
        }
    }

    fn gc(&self) {
        let now = Instant::now();
        let gc_period = self.gc_period;
        let mut contexts = self.contexts.lock();
        let before = contexts.len();
        contexts.retain(|_, c| {
            c.consumers > 0
                || c
                    .stopped_at
                    .is_some_and(|at| now.duration_since(at) < gc_period)
        });
        let removed = before - contexts.len();
        if removed > 0 {
            debug!(removed, "Removed stale polling contexts");
        }
    }

    fn subscribe(&self, agent_id: i64) -> (watch::Receiver<Urls>, ConsumerGuard) {
        let mut contexts = self.contexts.lock();
        let c = contexts.entry(agent_id).or_insert_with(|| PollingContext {
            urls: Arc::new(watch::channel(Urls::default()).0),
            consumers: 0,
            poller: None,
            stopped_at: None,
        });
        c.consumers += 1;
        if c.poller.is_none() {
            let token = CancellationToken::new();
            tokio::spawn(poll(
                self.delegate.clone(),
                agent_id,
                c.urls.clone(),
                token.clone(),
                self.poll_config,
            ));
            c.poller = Some(token);
            c.stopped_at = None;
        }
        let rx = c.urls.subscribe();
        (
            rx,
            ConsumerGuard {
                contexts: self.contexts.clone(),
                agent_id,
            },
        )
    }
}

/// Returns `true` if `cb` is done.
fn deliver<F: FnMut(bool, &str) -> bool>(urls: &[String], cb: &mut F) -> bool {
    urls.iter().enumerate().any(|(i, url)| cb(i == 0, url))
}

async fn poll(
    delegate: Arc<dyn Querier>,
    agent_id: i64,
    tx: Arc<watch::Sender<Urls>>,
    ctx: CancellationToken,
    config: PollConfig,
) {
    let mut poller = Poller::new(config);
    loop {
        let mut urls = Vec::new();
        let mut collect = |url| {
            urls.push(url);
            false
        };
        let result = tokio::select! {
            () = ctx.cancelled() => return,
            r = delegate.kas_urls_by_agent_id(agent_id, &mut collect) => r,
        };
        let attempt = match result {
            Ok(()) => {
                tx.send_replace(Arc::new(urls));
                Attempt::Continue
            }
            Err(e) => {
                warn!(agent_id, error = %e, "Failed to get kas URLs for agent");
                // partial results are still worth trying
                if !urls.is_empty() {
                    tx.send_replace(Arc::new(urls));
                }
                Attempt::Backoff
            }
        };
        if !poller.next(&ctx, attempt).await {
            return;
        }
    }
}

struct ConsumerGuard {
    contexts: Contexts,
    agent_id: i64,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        let mut contexts = self.contexts.lock();
        let Some(c) = contexts.get_mut(&self.agent_id) else {
            return;
        };
        c.consumers -= 1;
        if c.consumers > 0 {
            return;
        }
        if let Some(poller) = c.poller.take() {
            poller.cancel();
        }
        if c.urls.borrow().is_empty() {
            contexts.remove(&self.agent_id);
        } else {
            c.stopped_at = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::errors::Error;

    struct Fake {
        calls: AtomicUsize,
        urls: Mutex<Vec<String>>,
        fail: Mutex<bool>,
    }

    impl Fake {
        fn new(urls: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                urls: Mutex::new(urls.iter().map(|u| u.to_string()).collect()),
                fail: Mutex::new(false),
            })
        }
    }

    #[async_trait]
    impl Querier for Fake {
        async fn kas_urls_by_agent_id(
            &self,
            _agent_id: i64,
            cb: &mut (dyn FnMut(String) -> bool + Send),
        ) -> Result<(), Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if *self.fail.lock() {
                return Err(Error::Redis(redis::RedisError::from((
                    redis::ErrorKind::IoError,
                    "down",
                ))));
            }
            let urls = self.urls.lock().clone();
            for url in urls {
                if cb(url) {
                    break;
                }
            }
            Ok(())
        }
    }

    fn querier(fake: &Arc<Fake>) -> Arc<AggregatingQuerier> {
        Arc::new(AggregatingQuerier::new(
            fake.clone(),
            PollConfig::new(Duration::from_secs(1)),
            Duration::from_secs(10),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycles_are_tagged() {
        let fake = Fake::new(&["grpc://a:1", "grpc://b:1"]);
        let q = querier(&fake);
        let mut seen = Vec::new();
        q.poll_kas_urls_by_agent_id(&CancellationToken::new(), 42, |new_cycle, url| {
            seen.push((new_cycle, url.to_string()));
            seen.len() == 4
        })
        .await;
        assert_eq!(
            seen,
            vec![
                (true, "grpc://a:1".to_string()),
                (false, "grpc://b:1".to_string()),
                (true, "grpc://a:1".to_string()),
                (false, "grpc://b:1".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumers_share_one_poller() {
        let fake = Fake::new(&["grpc://a:1"]);
        let q = querier(&fake);
        let ctx = CancellationToken::new();
        let mut tasks = Vec::new();
        for _ in 0..5 {
            let q = q.clone();
            let ctx = ctx.clone();
            tasks.push(tokio::spawn(async move {
                let mut cycles = 0;
                q.poll_kas_urls_by_agent_id(&ctx, 42, |new_cycle, _| {
                    if new_cycle {
                        cycles += 1;
                    }
                    false
                })
                .await;
                cycles
            }));
        }
        tokio::time::sleep(Duration::from_millis(3500)).await;
        ctx.cancel();
        for t in tasks {
            assert!(t.await.unwrap() >= 3);
        }
        // one call per second, not one per consumer
        assert_eq!(fake.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_outlives_consumers_until_gc() {
        let fake = Fake::new(&["grpc://a:1"]);
        let q = querier(&fake);
        q.poll_kas_urls_by_agent_id(&CancellationToken::new(), 42, |_, _| true)
            .await;
        assert_eq!(q.cached_kas_urls_by_agent_id(42), vec!["grpc://a:1".to_string()]);

        // poller is gone
        let calls = fake.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fake.calls.load(Ordering::SeqCst), calls);

        let ctx = CancellationToken::new();
        let run = tokio::spawn({
            let q = q.clone();
            let ctx = ctx.clone();
            async move { q.run(ctx).await }
        });
        tokio::time::sleep(Duration::from_secs(21)).await;
        assert!(q.cached_kas_urls_by_agent_id(42).is_empty());
        ctx.cancel();
        run.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_urls_delivered_first() {
        let fake = Fake::new(&["grpc://a:1"]);
        let q = querier(&fake);
        q.poll_kas_urls_by_agent_id(&CancellationToken::new(), 42, |_, _| true)
            .await;
        *fake.fail.lock() = true;
        let calls = fake.calls.load(Ordering::SeqCst);
        let mut first = None;
        q.poll_kas_urls_by_agent_id(&CancellationToken::new(), 42, |new_cycle, url| {
            first = Some((new_cycle, url.to_string()));
            true
        })
        .await;
        assert_eq!(first, Some((true, "grpc://a:1".to_string())));
        // delivered without waiting for the failing store
        assert!(fake.calls.load(Ordering::SeqCst) <= calls + 1);

        let ctx = CancellationToken::new();
        let consumer = tokio::spawn({
            let q = q.clone();
            let ctx = ctx.clone();
            async move { q.poll_kas_urls_by_agent_id(&ctx, 42, |_, _| false).await }
        });
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(fake.calls.load(Ordering::SeqCst) > calls + 1);
        // failed cycles do not wipe the cache
        assert_eq!(q.cached_kas_urls_by_agent_id(42), vec!["grpc://a:1".to_string()]);
        ctx.cancel();
        consumer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_polling() {
        let fake = Fake::new(&[]);
        let q = querier(&fake);
        let ctx = CancellationToken::new();
        let task = tokio::spawn({
            let q = q.clone();
            let ctx = ctx.clone();
            async move { q.poll_kas_urls_by_agent_id(&ctx, 42, |_, _| false).await }
        });
        tokio::time::sleep(Duration::from_millis(1500)).await;
        ctx.cancel();
        task.await.unwrap();
        // nothing was ever found so nothing is cached
        assert!(q.contexts.lock().is_empty());
    }
}
