//! Two kas instances sharing one backing store, an agent connected to one of
//! them, and calls entering through the other.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use prometheus::core::Collector;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::codec::ProstCodec;
use tonic::metadata::MetadataMap;
use tonic::transport::Channel;
use tonic::{Code, Status};

use kas::app::{Deps, Server};
use kas::gitlab::AgentInfoResolver;
use kas::grpc::pool::channel_for_url;
use kas::grpc::server::{handler, Handler};
use kas::grpc::status::{status_with_details, Any, RpcStatus};
use kas::grpc::{ClientStream, ServerStream};
use kas::metrics::{Metrics, ROUTING_STATUS_SUCCESS};
use kas::retry::PollConfig;
use kas::testing::{self, MemoryBackend, Request, Response, StaticAgentInfoResolver};
use kas::tunnel::agent::{ConnectionManager, PoolParams, TunnelConnection};
use kas::tunnel::rpc::{ConnectRequest, ConnectResponse, CONNECT_METHOD};
use kas::Config;

const AGENT_ID: i64 = 42;
const TOKEN: &str = "agent-token";
const SECRET: &str = "c2VjcmV0LXNlY3JldC1zZWNyZXQtc2VjcmV0LXNlY3JldA==";

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("kas-e2e-{name}-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn server_config(dir: &std::path::Path, find_timeout: Duration) -> Config {
    let secret = dir.join("private_api_secret");
    std::fs::write(&secret, SECRET).unwrap();
    let grace = Duration::from_millis(200);

    let mut config = Config::default();
    config.listen_agent.address = "127.0.0.1:0".to_string();
    config.listen_agent.listen_grace_period = grace;
    config.listen_private_api.address = "127.0.0.1:0".to_string();
    config.listen_private_api.listen_grace_period = grace;
    config.listen_private_api.authentication_secret_file = Some(secret.display().to_string());
    config.listen_api.listen_grace_period = grace;
    config.observability.address = "127.0.0.1:0".to_string();
    config.routing.tunnel_find_timeout = find_timeout;
    config.routing.poll_interval = Duration::from_millis(100);
    config.agent_services = vec![testing::testing_service_config()];
    config
}

fn deps(backend: &Arc<MemoryBackend>, resolver: &Arc<dyn AgentInfoResolver>) -> Deps {
    Deps {
        backend: backend.clone(),
        agent_info: resolver.clone(),
    }
}

struct Fleet {
    /// Holds the agent's tunnels.
    gateway: Server,
    /// Receives the calls.
    router: Server,
    agent_ctx: CancellationToken,
    agent: Option<JoinHandle<()>>,
    upstream_shutdown: CancellationToken,
}

impl Fleet {
    async fn start(name: &str, upstream: Option<Handler<Request, Response>>, find_timeout: Duration) -> Self {
        let dir = temp_dir(name);
        let config = server_config(&dir, find_timeout);
        let backend = Arc::new(MemoryBackend::new());
        let resolver: Arc<dyn AgentInfoResolver> = Arc::new(
            StaticAgentInfoResolver::new().with_agent(TOKEN, testing::agent_info(AGENT_ID)),
        );
        let gateway = Server::start(&config, deps(&backend, &resolver)).await.unwrap();
        let router = Server::start(&config, deps(&backend, &resolver)).await.unwrap();
        assert_ne!(gateway.own_url(), router.own_url());

        let agent_ctx = CancellationToken::new();
        let upstream_shutdown = CancellationToken::new();
        let agent = upstream.map(|h| {
            let upstream = testing::serve_pipe(testing::testing_router(h), upstream_shutdown.clone());
            let kas = channel_for_url(&format!("grpc://{}", gateway.agent_addr()), None).unwrap();
            let connection = Arc::new(TunnelConnection::new(
                testing::testing_descriptor(),
                kas,
                TOKEN.to_string(),
                upstream,
                PollConfig::new(Duration::from_millis(100)),
            ));
            let manager = ConnectionManager::new(
                PoolParams {
                    min_idle_connections: 1,
                    max_connections: 4,
                    scale_up_step: 1,
                    max_idle_time: Duration::from_secs(60),
                },
                connection.factory(),
            );
            let ctx = agent_ctx.clone();
            tokio::spawn(async move { manager.run(ctx).await })
        });
        Self {
            gateway,
            router,
            agent_ctx,
            agent,
            upstream_shutdown,
        }
    }

    async fn stop(self) {
        self.agent_ctx.cancel();
        if let Some(agent) = self.agent {
            agent.await.unwrap();
        }
        self.upstream_shutdown.cancel();
        self.router.shutdown().await;
        self.gateway.shutdown().await;
    }
}

/// Calls a server has answered, over all of its listeners.
fn handled_total(metrics: &Metrics) -> u64 {
    metrics
        .grpc_handled
        .collect()
        .iter()
        .flat_map(|family| family.get_metric())
        .map(|m| m.get_counter().get_value() as u64)
        .sum()
}

fn routing_md() -> MetadataMap {
    testing::md(&[
        ("kas-hop-routing-agent-id", "42"),
        ("x-custom", "custom-value"),
    ])
}

#[derive(Default)]
struct Outcome {
    header: Option<MetadataMap>,
    responses: Vec<Response>,
    trailer: Option<MetadataMap>,
    error: Option<Status>,
}

/// Send one request, half-close and read everything back.
async fn call(channel: Channel, method: &str, s1: &str) -> Outcome {
    let (mut tx, pending) = ClientStream::<Request, Response>::start(
        channel,
        method,
        routing_md(),
        ProstCodec::default(),
    )
    .unwrap();
    let _ = tx.send(Request { s1: s1.to_string() }).await;
    tx.close_send();
    let mut out = Outcome::default();
    let mut rx = match pending.await {
        Ok((header, rx)) => {
            out.header = Some(header);
            rx
        }
        Err(e) => {
            out.error = Some(e);
            return out;
        }
    };
    loop {
        match rx.recv().await {
            Ok(Some(r)) => out.responses.push(r),
            Ok(None) => {
                out.trailer = rx.trailers().await.ok();
                break;
            }
            Err(e) => {
                out.error = Some(e);
                break;
            }
        }
    }
    out
}

fn value<'a>(md: &'a MetadataMap, key: &str) -> Option<&'a str> {
    md.get(key).and_then(|v| v.to_str().ok())
}

/// Echo handler that also records the metadata it was called with.
fn recording_echo(seen: Arc<Mutex<Option<MetadataMap>>>) -> Handler<Request, Response> {
    let echo = testing::echo_handler();
    handler(move |stream: ServerStream<Request, Response>| {
        *seen.lock() = Some(stream.info.metadata.clone());
        echo(stream)
    })
}

#[tokio::test]
async fn test_unary_request_is_routed_through_peer() {
    let seen = Arc::new(Mutex::new(None));
    let fleet = Fleet::start("unary", Some(recording_echo(seen.clone())), Duration::from_secs(10)).await;

    let out = call(fleet.router.internal_channel(), testing::REQUEST_RESPONSE, "123").await;

    assert!(out.error.is_none(), "{:?}", out.error);
    assert_eq!(out.responses, vec![Response { scalar: 123 }]);
    assert_eq!(value(out.header.as_ref().unwrap(), "key2"), Some("value2"));
    assert_eq!(value(out.trailer.as_ref().unwrap(), "key3"), Some("value3"));

    let md = seen.lock().clone().unwrap();
    let headers = md.into_headers();
    assert!(headers.keys().all(|k| !k.as_str().starts_with("kas-hop-")), "{headers:?}");
    assert_eq!(headers.get("x-custom").unwrap(), "custom-value");

    let success = fleet
        .router
        .metrics()
        .routing_duration(ROUTING_STATUS_SUCCESS)
        .get_sample_count();
    assert_eq!(success, 1);
    fleet.stop().await;
}

#[tokio::test]
async fn test_immediate_error_keeps_details() {
    let details = vec![Any {
        type_url: "type.googleapis.com/gitlab.agent.Testing.Request".to_string(),
        value: prost::Message::encode_to_vec(&Request {
            s1: "some details".to_string(),
        }),
    }];
    let expected = status_with_details(Code::InvalidArgument, "Some expected error", details.clone());
    let fleet = Fleet::start(
        "error",
        Some(testing::error_handler(expected)),
        Duration::from_secs(10),
    )
    .await;

    let out = call(fleet.router.internal_channel(), testing::REQUEST_RESPONSE, "1").await;

    let err = out.error.expect("error expected");
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(err.message(), "Some expected error");
    assert_eq!(RpcStatus::from_status(&err).details, details);
    assert!(out.responses.is_empty());
    fleet.stop().await;
}

#[tokio::test]
async fn test_error_after_header() {
    let fleet = Fleet::start(
        "after-header",
        Some(testing::error_after_header_handler(Status::invalid_argument(
            "Some expected error",
        ))),
        Duration::from_secs(10),
    )
    .await;

    let out = call(fleet.router.internal_channel(), testing::REQUEST_RESPONSE, "1").await;

    assert_eq!(value(out.header.as_ref().unwrap(), "key2"), Some("value2"));
    let err = out.error.expect("error expected");
    assert_eq!(err.code(), Code::InvalidArgument);
    assert_eq!(err.message(), "Some expected error");
    assert_eq!(value(err.metadata(), "key3"), Some("value3"));
    fleet.stop().await;
}

#[tokio::test]
async fn test_streaming_header_before_first_message() {
    let fleet = Fleet::start(
        "streaming",
        Some(testing::echo_handler()),
        Duration::from_secs(10),
    )
    .await;

    // the header arrives before anything was sent
    let mut stream = ClientStream::<Request, Response>::open(
        fleet.router.internal_channel(),
        testing::STREAMING_REQUEST_RESPONSE,
        routing_md(),
        ProstCodec::default(),
    )
    .await
    .unwrap();
    assert_eq!(value(stream.header(), "key2"), Some("value2"));

    stream
        .send(Request {
            s1: "7".to_string(),
        })
        .await
        .unwrap();
    stream.close_send();
    assert_eq!(stream.recv().await.unwrap(), Some(Response { scalar: 7 }));
    assert_eq!(stream.recv().await.unwrap(), None);
    let trailer = stream.trailers().await.unwrap();
    assert_eq!(value(&trailer, "key3"), Some("value3"));
    fleet.stop().await;
}

#[tokio::test]
async fn test_no_tunnel_times_out() {
    let fleet = Fleet::start("no-tunnel", None, Duration::from_millis(500)).await;

    let out = call(fleet.router.internal_channel(), testing::REQUEST_RESPONSE, "1").await;

    let err = out.error.expect("error expected");
    assert_eq!(err.code(), Code::DeadlineExceeded);
    assert_eq!(fleet.router.metrics().routing_timeout.get(), 1);
    // nothing was dialed: only the incoming call was served anywhere
    assert_eq!(handled_total(fleet.gateway.metrics()), 0);
    assert_eq!(handled_total(fleet.router.metrics()), 1);
    assert_eq!(
        fleet
            .router
            .metrics()
            .routing_duration(ROUTING_STATUS_SUCCESS)
            .get_sample_count(),
        0
    );
    fleet.stop().await;
}

#[tokio::test]
async fn test_connect_rate_limited_per_token() {
    let dir = temp_dir("rate-limit");
    let mut config = server_config(&dir, Duration::from_secs(10));
    config.listen_agent.connections_per_token_per_minute = 1;
    let backend = Arc::new(MemoryBackend::new());
    let resolver: Arc<dyn AgentInfoResolver> = Arc::new(
        StaticAgentInfoResolver::new().with_agent(TOKEN, testing::agent_info(AGENT_ID)),
    );
    let server = Server::start(&config, deps(&backend, &resolver)).await.unwrap();
    let kas = channel_for_url(&format!("grpc://{}", server.agent_addr()), None).unwrap();
    let auth = || testing::md(&[("authorization", "Bearer agent-token")]);

    let first = ClientStream::<ConnectRequest, ConnectResponse>::open(
        kas.clone(),
        CONNECT_METHOD,
        auth(),
        ProstCodec::default(),
    )
    .await;
    assert!(first.is_ok());

    let Err(err) = ClientStream::<ConnectRequest, ConnectResponse>::open(
        kas,
        CONNECT_METHOD,
        auth(),
        ProstCodec::default(),
    )
    .await
    else {
        panic!("second Connect must be rejected");
    };
    assert_eq!(err.code(), Code::ResourceExhausted);
    assert_eq!(server.metrics().token_limit_exceeded.get(), 1);

    drop(first);
    server.shutdown().await;
}
