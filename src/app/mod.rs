//! Process wiring for `kas serve`.
//!
//! Startup is staged: observability, then the registerers (tunnel tracker,
//! directory poller, peer pool), then the internal/private/API servers and
//! finally the agent-facing server. Every fallible step (secrets, binds, own
//! URL) runs before anything is spawned, so a failed start leaves nothing
//! behind. [`Server::shutdown`] stops the stages in reverse.

pub mod agentk;
mod observability;
mod own_url;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::middleware::{from_fn, from_fn_with_state};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::transport::Channel;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub use own_url::{construct_own_url, ListenAddr};

use crate::auth::{limit_per_token, require_agent_token};
use crate::config::{read_secret, Config};
use crate::errors::Error;
use crate::gitlab::{AgentInfoCache, AgentInfoResolver, GitlabClient};
use crate::grpc::jwt::{require_jwt, JwtSigner, JwtValidator};
use crate::grpc::listener::{serve, Listener, ServeOptions};
use crate::grpc::pipe::PipeListener;
use crate::grpc::pool::{KasPool, Pool, SelfPool};
use crate::grpc::server::unimplemented;
use crate::metrics::{observe, Metrics};
use crate::redistool::{Backend, RedisBackend, TokenLimiter};
use crate::registrar::{register_route, ConnectionTracker, REGISTER_METHOD};
use crate::retry::PollConfig;
use crate::router::{MethodTable, RouterConfig, TunnelRouter};
use crate::rpc_api::inject;
use crate::tunnel::rpc::CONNECT_METHOD;
use crate::tunnel::server::connect_route;
use crate::tunnel::{AggregatingQuerier, Registry, Tracker};

/// Issuer and audience of peer JWTs.
pub const SERVER_NAME: &str = "gitlab-kas";
/// Issuer of JWTs presented on the external API.
pub const API_ISSUER: &str = "gitlab";

const POOL_SWEEP_PERIOD: Duration = Duration::from_secs(60);
/// Added to the grace period when waiting for a stage; the tracker needs up
/// to 10s to clear its records.
const STAGE_STOP_SLACK: Duration = Duration::from_secs(12);

/// External collaborators, replaceable in tests.
pub struct Deps {
    pub backend: Arc<dyn Backend>,
    pub agent_info: Arc<dyn AgentInfoResolver>,
}

impl Deps {
    pub async fn from_config(config: &Config) -> Result<Self, Error> {
        let backend = RedisBackend::connect(
            &config.redis.url,
            config.redis.dial_timeout,
            config.redis.write_timeout,
        )
        .await?;
        let secret_file = config
            .gitlab
            .authentication_secret_file
            .as_deref()
            .ok_or_else(|| Error::config("gitlab.authentication_secret_file is required"))?;
        let gitlab = GitlabClient::new(&config.gitlab.address, &read_secret(secret_file)?)?;
        let cache = AgentInfoCache::new(
            Arc::new(gitlab),
            config.agent.info_cache_ttl,
            config.agent.info_cache_error_ttl,
        );
        Ok(Self {
            backend: Arc::new(backend),
            agent_info: Arc::new(cache),
        })
    }
}

/// A group of tasks started and stopped together.
struct Stage {
    name: &'static str,
    ctx: CancellationToken,
    tasks: TaskTracker,
}

impl Stage {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            ctx: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    fn spawn<F, Fut>(&self, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(f(self.ctx.clone()));
    }

    async fn stop(self, timeout: Duration) {
        self.ctx.cancel();
        self.tasks.close();
        if tokio::time::timeout(timeout, self.tasks.wait()).await.is_err() {
            warn!(stage = self.name, "Stage did not stop in time");
        }
        info!(stage = self.name, "Stage stopped");
    }
}

/// A running kas instance.
pub struct Server {
    own_url: String,
    agent_addr: String,
    private_addr: String,
    api_addr: Option<String>,
    observability_addr: String,
    internal_channel: Channel,
    metrics: Metrics,
    registry: Registry,
    pool: Pool,
    ready: Arc<AtomicBool>,
    agent_grace: Duration,
    server_grace: Duration,
    observability: Stage,
    registerers: Stage,
    servers: Stage,
    agent: Stage,
}

impl Server {
    #[allow(clippy::too_many_lines)]
    pub async fn start(config: &Config, deps: Deps) -> Result<Self, Error> {
        let prefix = &config.redis.key_prefix;

        // Everything fallible first.
        let private_secret = read_secret(
            config
                .listen_private_api
                .authentication_secret_file
                .as_deref()
                .ok_or_else(|| {
                    Error::config("listen_private_api.authentication_secret_file is required")
                })?,
        )?;
        let api_secret = config
            .listen_api
            .authentication_secret_file
            .as_deref()
            .map(read_secret)
            .transpose()?;

        let prom = prometheus::Registry::new();
        let metrics = Metrics::new(&prom)?;

        let observability_listener = observability::HttpListener::bind(&config.observability).await?;
        let private_listener = Listener::bind(
            config.listen_private_api.network,
            &config.listen_private_api.address,
        )
        .await?;
        let listen = match &private_listener {
            Listener::Tcp(l) => ListenAddr::Tcp(l.local_addr()?),
            _ => ListenAddr::Unix(config.listen_private_api.address.clone()),
        };
        let own_url = construct_own_url(&config.own_private_api, &listen)?;
        let api_listener = match &api_secret {
            Some(_) => Some(Listener::bind(config.listen_api.network, &config.listen_api.address).await?),
            None => None,
        };
        let agent_listener =
            Listener::bind(config.listen_agent.network, &config.listen_agent.address).await?;

        let observability_addr = observability_listener.local_addr();
        let private_addr = private_listener.local_addr();
        let api_addr = api_listener.as_ref().map(Listener::local_addr);
        let agent_addr = agent_listener.local_addr();
        info!(own_url = %own_url, "Starting kas");

        // Stage 1: observability.
        let ready = Arc::new(AtomicBool::new(false));
        let observability = Stage::new("observability");
        let probes = observability::router(prom, ready.clone());
        observability.spawn(|ctx| observability::serve(observability_listener, probes, ctx));

        // Stage 2: registerers.
        let registerers = Stage::new("registerers");
        let tracker = Arc::new(Tracker::new(
            deps.backend.clone(),
            prefix,
            own_url.clone(),
            config.agent.redis_conn_info_ttl,
            config.agent.redis_conn_info_refresh,
            config.agent.redis_conn_info_gc,
        ));
        let poll_config = PollConfig::new(config.routing.poll_interval);
        let querier = Arc::new(AggregatingQuerier::new(
            tracker.clone(),
            poll_config,
            config.agent.redis_conn_info_gc,
        ));
        let signer = Arc::new(JwtSigner::new(&private_secret, SERVER_NAME, SERVER_NAME));
        let pool = Pool::new(Some(signer.clone()), config.routing.pool_idle_timeout);
        {
            let tracker = tracker.clone();
            registerers.spawn(|ctx| async move { tracker.run(ctx).await });
            let querier = querier.clone();
            registerers.spawn(|ctx| async move { querier.run(ctx).await });
            let pool = pool.clone();
            registerers.spawn(|ctx| async move {
                let mut sweep = tokio::time::interval(POOL_SWEEP_PERIOD);
                loop {
                    tokio::select! {
                        () = ctx.cancelled() => break,
                        _ = sweep.tick() => pool.sweep(),
                    }
                }
            });
        }

        // Stage 3: internal, private and API servers.
        let servers = Stage::new("servers");
        let registry = Registry::new(tracker, metrics.tunnel_registrations.clone());
        let private_pipe = PipeListener::new();
        let self_pool: Arc<dyn KasPool> = Arc::new(SelfPool::new(
            Arc::new(pool.clone()),
            own_url.clone(),
            private_pipe.dialer().channel(),
            Some(signer),
        ));
        let router = TunnelRouter::new(
            self_pool,
            querier,
            registry.clone(),
            own_url.clone(),
            RouterConfig {
                tunnel_find_timeout: config.routing.tunnel_find_timeout,
                poll_config,
                speculation_factor: config.routing.speculation_factor,
            },
            metrics.clone(),
        );
        let table = MethodTable::new(&config.agent_services);

        let private_router = grpc_layers(
            router
                .agent_routes(&table)
                .layer(from_fn_with_state(
                    JwtValidator::new(&private_secret, SERVER_NAME, SERVER_NAME),
                    require_jwt,
                )),
            &metrics,
        );
        let private_opts = ServeOptions {
            name: "private_api",
            max_connection_age: Some(config.listen_private_api.max_connection_age),
            grace_period: config.listen_private_api.listen_grace_period,
        };
        {
            let (r, o) = (private_router.clone(), private_opts.clone());
            servers.spawn(|ctx| serve(private_listener, r, o, ctx));
            let o = ServeOptions {
                name: "private_api_self",
                max_connection_age: None,
                ..private_opts
            };
            servers.spawn(|ctx| serve(Listener::Pipe(private_pipe), private_router, o, ctx));
        }

        let internal_pipe = PipeListener::new();
        let internal_channel = internal_pipe.dialer().channel();
        let internal_router = grpc_layers(router.kas_routes(&table), &metrics);
        let internal_opts = ServeOptions {
            name: "internal",
            max_connection_age: None,
            grace_period: config.listen_api.listen_grace_period,
        };
        servers.spawn(|ctx| serve(Listener::Pipe(internal_pipe), internal_router, internal_opts, ctx));

        if let (Some(listener), Some(secret)) = (api_listener, api_secret) {
            let api_router = grpc_layers(
                router.kas_routes(&table).layer(from_fn_with_state(
                    JwtValidator::new(&secret, API_ISSUER, SERVER_NAME),
                    require_jwt,
                )),
                &metrics,
            );
            let opts = ServeOptions {
                name: "api",
                max_connection_age: Some(config.listen_api.max_connection_age),
                grace_period: config.listen_api.listen_grace_period,
            };
            servers.spawn(|ctx| serve(listener, api_router, opts, ctx));
        }

        // Stage 4: agent-facing server.
        let agent = Stage::new("agent_server");
        let connections = Arc::new(ConnectionTracker::new(
            deps.backend.clone(),
            prefix,
            config.agent.redis_conn_info_ttl,
        ));
        let limiter = Arc::new(TokenLimiter::new(
            deps.backend,
            prefix,
            config.listen_agent.connections_per_token_per_minute,
            metrics.token_limit_exceeded.clone(),
        ));
        let agent_router = Router::new()
            .route(CONNECT_METHOD, connect_route(registry.clone()))
            .route(REGISTER_METHOD, register_route(connections))
            .fallback(unimplemented)
            .layer(from_fn_with_state(limiter, limit_per_token))
            .layer(from_fn_with_state(deps.agent_info, require_agent_token));
        let agent_router = grpc_layers(agent_router, &metrics);
        let agent_opts = ServeOptions {
            name: "agent",
            max_connection_age: Some(config.listen_agent.max_connection_age),
            grace_period: config.listen_agent.listen_grace_period,
        };
        agent.spawn(|ctx| serve(agent_listener, agent_router, agent_opts, ctx));

        ready.store(true, Ordering::Relaxed);
        info!(
            agent = %agent_addr,
            private_api = %private_addr,
            observability = %observability_addr,
            "kas started"
        );

        Ok(Self {
            own_url,
            agent_addr,
            private_addr,
            api_addr,
            observability_addr,
            internal_channel,
            metrics,
            registry,
            pool,
            ready,
            agent_grace: config.listen_agent.listen_grace_period,
            server_grace: config
                .listen_private_api
                .listen_grace_period
                .max(config.listen_api.listen_grace_period),
            observability,
            registerers,
            servers,
            agent,
        })
    }

    pub fn own_url(&self) -> &str {
        &self.own_url
    }

    /// Agent-facing listener address.
    pub fn agent_addr(&self) -> &str {
        &self.agent_addr
    }

    pub fn private_addr(&self) -> &str {
        &self.private_addr
    }

    pub fn api_addr(&self) -> Option<&str> {
        self.api_addr.as_deref()
    }

    pub fn observability_addr(&self) -> &str {
        &self.observability_addr
    }

    /// In-process connection to the routing surface (no auth).
    pub fn internal_channel(&self) -> Channel {
        self.internal_channel.clone()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub async fn shutdown(self) {
        info!("Shutting down");
        self.ready.store(false, Ordering::Relaxed);
        self.agent.ctx.cancel();
        self.registry.stop().await;
        self.agent.stop(self.agent_grace + STAGE_STOP_SLACK).await;
        self.servers.stop(self.server_grace + STAGE_STOP_SLACK).await;
        self.registerers.stop(STAGE_STOP_SLACK).await;
        self.pool.close();
        self.observability.stop(STAGE_STOP_SLACK).await;
        info!("Goodbye");
    }
}

/// Layers shared by every gRPC server, outermost last: call metrics, HTTP
/// tracing, then the per-request RPC API.
fn grpc_layers(router: Router, metrics: &Metrics) -> Router {
    router
        .layer(from_fn(inject))
        .layer(TraceLayer::new_for_grpc())
        .layer(from_fn_with_state(metrics.clone(), observe))
}

/// `kas serve`: run until SIGINT or SIGTERM.
pub async fn run(config: Config) -> Result<(), Error> {
    let deps = Deps::from_config(&config).await?;
    let server = Server::start(&config, deps).await?;
    wait_for_signal().await?;
    server.shutdown().await;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
pub async fn wait_for_signal() -> Result<(), Error> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => {
            r?;
            info!("Received SIGINT");
        }
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryBackend, StaticAgentInfoResolver};

    fn write_secret(dir: &std::path::Path, name: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, "c2VjcmV0LXNlY3JldC1zZWNyZXQtc2VjcmV0LXNlY3JldA==").unwrap();
        path.display().to_string()
    }

    fn test_config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.listen_agent.address = "127.0.0.1:0".to_string();
        config.listen_private_api.address = "127.0.0.1:0".to_string();
        config.listen_private_api.authentication_secret_file = Some(write_secret(dir, "private"));
        config.observability.address = "127.0.0.1:0".to_string();
        config
    }

    fn deps() -> Deps {
        Deps {
            backend: Arc::new(MemoryBackend::new()),
            agent_info: Arc::new(StaticAgentInfoResolver::new()),
        }
    }

    fn temp_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("kas-app-{name}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let dir = temp_dir("start");
        let server = Server::start(&test_config(&dir), deps()).await.unwrap();
        assert!(server.own_url().starts_with("grpc://127.0.0.1:"));
        assert!(server.api_addr().is_none());
        assert_ne!(server.agent_addr(), "127.0.0.1:0");
        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_private_secret_required() {
        let dir = temp_dir("nosecret");
        let mut config = test_config(&dir);
        config.listen_private_api.authentication_secret_file = None;
        let Err(err) = Server::start(&config, deps()).await else {
            panic!("expected an error");
        };
        assert!(err.to_string().contains("authentication_secret_file"), "{err}");
    }

    #[tokio::test]
    async fn test_api_server_enabled_by_secret() {
        let dir = temp_dir("api");
        let mut config = test_config(&dir);
        config.listen_api.address = "127.0.0.1:0".to_string();
        config.listen_api.authentication_secret_file = Some(write_secret(&dir, "api"));
        let server = Server::start(&config, deps()).await.unwrap();
        assert!(server.api_addr().is_some());
        server.shutdown().await;
    }
}
