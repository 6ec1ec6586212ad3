//! Pool of tunnel connections.
//!
//! The pool keeps at least `min_idle_connections` tunnels waiting for a
//! request. When a tunnel starts carrying a request the pool scales up by
//! `scale_up_step` (never past `max_connections`); tunnels idle for longer
//! than `max_idle_time` are closed while there are more idle tunnels than the
//! minimum.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// Runs one connection until the token is cancelled. The connection reports
/// its transitions through the hooks.
pub type ConnectionFactory =
    Arc<dyn Fn(ConnectionHooks, CancellationToken) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct PoolParams {
    pub min_idle_connections: usize,
    pub max_connections: usize,
    pub scale_up_step: usize,
    pub max_idle_time: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Active,
    TimedOut,
}

struct Entry {
    cancel: CancellationToken,
    state: State,
    /// Bumped to invalidate a pending idle timer.
    timer_gen: u64,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<u64, Entry>,
    idle: usize,
    active: usize,
    next_id: u64,
    root: Option<CancellationToken>,
}

struct Shared {
    inner: Mutex<Inner>,
    tasks: TaskTracker,
    params: PoolParams,
    factory: ConnectionFactory,
}

/// Lets a running connection tell the pool what it is doing.
#[derive(Clone)]
pub struct ConnectionHooks {
    id: u64,
    shared: Arc<Shared>,
}

impl ConnectionHooks {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The connection received a request.
    pub fn on_active(&self) {
        self.shared.on_active(self.id);
    }

    /// The connection finished a request, or an attempt ended.
    pub fn on_idle(&self) {
        self.shared.on_idle(self.id);
    }
}

/// Connection counts at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub active: usize,
    /// Includes timed out connections that have not exited yet.
    pub total: usize,
}

#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(params: PoolParams, factory: ConnectionFactory) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                tasks: TaskTracker::new(),
                params,
                factory,
            }),
        }
    }

    /// Start the minimum number of connections, then block until `ctx` is
    /// cancelled and every connection has exited.
    pub async fn run(&self, ctx: CancellationToken) {
        {
            let mut inner = self.shared.inner.lock();
            inner.root = Some(ctx.clone());
            while inner.idle < self.shared.params.min_idle_connections {
                self.shared.start_connection_locked(&mut inner, &ctx);
            }
        }
        ctx.cancelled().await;
        self.shared.tasks.close();
        self.shared.tasks.wait().await;
        debug!("Tunnel connections stopped");
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.shared.inner.lock();
        PoolStats {
            idle: inner.idle,
            active: inner.active,
            total: inner.connections.len(),
        }
    }
}

impl Shared {
    fn start_connection_locked(self: &Arc<Self>, inner: &mut Inner, root: &CancellationToken) {
        inner.idle += 1;
        inner.next_id += 1;
        let id = inner.next_id;
        let cancel = root.child_token();
        inner.connections.insert(
            id,
            Entry {
                cancel: cancel.clone(),
                state: State::Idle,
                timer_gen: 0,
            },
        );
        self.arm_idle_timer(id, 0, cancel.clone());
        let hooks = ConnectionHooks {
            id,
            shared: self.clone(),
        };
        let run = (self.factory)(hooks, cancel);
        let shared = self.clone();
        self.tasks.spawn(async move {
            run.await;
            shared.on_stop(id);
        });
    }

    /// The timer dies with the connection's token.
    fn arm_idle_timer(self: &Arc<Self>, id: u64, generation: u64, cancel: CancellationToken) {
        let shared = Arc::downgrade(self);
        let max_idle_time = self.params.max_idle_time;
        self.tasks.spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(max_idle_time) => {
                    if let Some(shared) = shared.upgrade() {
                        shared.on_idle_timeout(id, generation);
                    }
                }
            }
        });
    }

    fn on_active(self: &Arc<Self>, id: u64) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.connections.get_mut(&id) else {
            return;
        };
        match entry.state {
            State::Idle => {
                entry.state = State::Active;
                entry.timer_gen += 1;
                inner.idle -= 1;
                inner.active += 1;
                if inner.idle < self.params.min_idle_connections {
                    // timed out connections still count until they exit
                    let can_spawn = self
                        .params
                        .max_connections
                        .saturating_sub(inner.connections.len());
                    let scale_by = self.params.scale_up_step.min(can_spawn);
                    if let Some(root) = inner.root.clone() {
                        for _ in 0..scale_by {
                            self.start_connection_locked(&mut inner, &root);
                        }
                    }
                }
            }
            // being cancelled, leaves the map soon
            State::TimedOut => {}
            State::Active => debug!(connection_id = id, "Connection is already active"),
        }
    }

    fn on_idle(self: &Arc<Self>, id: u64) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.connections.get_mut(&id) else {
            return;
        };
        if entry.state != State::Active {
            return;
        }
        entry.state = State::Idle;
        entry.timer_gen += 1;
        let generation = entry.timer_gen;
        let cancel = entry.cancel.clone();
        inner.idle += 1;
        inner.active -= 1;
        self.arm_idle_timer(id, generation, cancel);
    }

    fn on_idle_timeout(self: &Arc<Self>, id: u64, generation: u64) {
        let mut inner = self.inner.lock();
        let over_minimum = inner.idle > self.params.min_idle_connections;
        let Some(entry) = inner.connections.get_mut(&id) else {
            return;
        };
        if entry.state != State::Idle || entry.timer_gen != generation {
            return;
        }
        if over_minimum {
            debug!(connection_id = id, "Closing idle connection");
            entry.state = State::TimedOut;
            entry.cancel.cancel();
            inner.idle -= 1;
        } else {
            entry.timer_gen += 1;
            let generation = entry.timer_gen;
            let cancel = entry.cancel.clone();
            self.arm_idle_timer(id, generation, cancel);
        }
    }

    fn on_stop(&self, id: u64) {
        let mut inner = self.inner.lock();
        match inner.connections.remove(&id).map(|e| e.state) {
            Some(State::Idle) => inner.idle -= 1,
            Some(State::Active) => inner.active -= 1,
            Some(State::TimedOut) | None => {}
        }
    }
}
