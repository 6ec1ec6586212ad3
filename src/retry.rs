//! Polling with exponential backoff.
//!
//! Every retry loop in kas (directory polling, tunnel connections, peer
//! dials) is an attempt that reports what should happen next:
//!
//! - [`Attempt::Done`]: stop polling
//! - [`Attempt::Continue`]: success, wait the poll interval and go again
//! - [`Attempt::ContinueImmediately`]: success, go again right away
//! - [`Attempt::Backoff`]: failure, wait the next backoff delay

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Done,
    Continue,
    ContinueImmediately,
    Backoff,
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    /// Forget accumulated backoff after this long without failures.
    pub reset: Duration,
    pub factor: f64,
    /// Up to this fraction of the delay is added at random.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            reset: Duration::from_secs(20),
            factor: 2.0,
            jitter: 1.0,
        }
    }
}

/// Exponential backoff state.
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    current: Duration,
    last_failure: Option<Instant>,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            current: config.initial,
            last_failure: None,
        }
    }

    /// Delay before the next attempt after a failure.
    pub fn next_delay(&mut self) -> Duration {
        let now = Instant::now();
        if let Some(last) = self.last_failure {
            if now.duration_since(last) >= self.config.reset {
                self.current = self.config.initial;
            }
        }
        self.last_failure = Some(now);
        let base = self.current;
        self.current = self.current.mul_f64(self.config.factor).min(self.config.max);
        let jitter = base.mul_f64(self.config.jitter * rand::thread_rng().gen::<f64>());
        base + jitter
    }

    pub fn reset(&mut self) {
        self.current = self.config.initial;
        self.last_failure = None;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollConfig {
    pub interval: Duration,
    pub backoff: BackoffConfig,
}

impl PollConfig {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Drives a hand-written retry loop:
///
/// ```ignore
/// let mut poller = Poller::new(config);
/// loop {
///     let attempt = do_something().await;
///     if !poller.next(&ctx, attempt).await {
///         break;
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Poller {
    interval: Duration,
    backoff: Backoff,
}

impl Poller {
    pub fn new(config: PollConfig) -> Self {
        Self {
            interval: config.interval,
            backoff: Backoff::new(config.backoff),
        }
    }

    /// Wait as `attempt` asks. Returns `false` when polling should stop,
    /// because the attempt is done or `ctx` was cancelled.
    pub async fn next(&mut self, ctx: &CancellationToken, attempt: Attempt) -> bool {
        let delay = match attempt {
            Attempt::Done => return false,
            Attempt::ContinueImmediately => {
                self.backoff.reset();
                return !ctx.is_cancelled();
            }
            Attempt::Continue => {
                self.backoff.reset();
                self.interval
            }
            Attempt::Backoff => self.backoff.next_delay(),
        };
        tokio::select! {
            () = ctx.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }
}

/// Run `f` until it returns [`Attempt::Done`] or `ctx` is cancelled.
/// Returns `true` if polling finished because of `Done`.
pub async fn poll_with_backoff<F, Fut>(ctx: &CancellationToken, config: PollConfig, mut f: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Attempt>,
{
    let mut poller = Poller::new(config);
    loop {
        if ctx.is_cancelled() {
            return false;
        }
        let attempt = tokio::select! {
            () = ctx.cancelled() => return false,
            attempt = f() => attempt,
        };
        if attempt == Attempt::Done {
            return true;
        }
        if !poller.next(ctx, attempt).await {
            return false;
        }
    }
}
