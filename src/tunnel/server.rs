//! Agent-facing `Connect` RPC.

use axum::routing::MethodRouter;
use tonic::codec::ProstCodec;
use tonic::Status;

use super::registry::Registry;
use super::rpc::{ConnectRequest, ConnectResponse, CONNECT_METHOD};
use crate::grpc::server::{handler, streaming_route};
use crate::grpc::ServerStream;
use crate::rpc_api::AgentRpcApi;

/// Route for `Connect`. Must sit behind the agent token layer.
pub fn connect_route(registry: Registry) -> MethodRouter {
    streaming_route::<ProstCodec<ConnectResponse, ConnectRequest>>(
        CONNECT_METHOD,
        handler(move |stream| {
            let registry = registry.clone();
            async move { connect(registry, stream).await }
        }),
    )
}

async fn connect(
    registry: Registry,
    stream: ServerStream<ConnectRequest, ConnectResponse>,
) -> Result<(), Status> {
    let Some(agent_api) = stream.extensions.get::<AgentRpcApi>().cloned() else {
        return Err(Status::internal("agent RPC API missing"));
    };
    let info = agent_api.agent_info().await?;
    // the agent sends its descriptor once the call is established
    stream.sink.send_header(tonic::metadata::MetadataMap::new())?;
    let result = registry.handle_tunnel(agent_api.api(), info.id, stream).await;
    if let Err(status) = &result {
        agent_api.api().log_status(status);
    }
    result
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::middleware::{from_fn, from_fn_with_state};
    use axum::Router;
    use prometheus::IntGauge;
    use tokio_util::sync::CancellationToken;
    use tonic::metadata::MetadataMap;
    use tonic::transport::Channel;
    use tonic::Code;

    use super::*;
    use crate::auth::require_agent_token;
    use crate::gitlab::AgentInfoResolver;
    use crate::grpc::listener::{serve, Listener, ServeOptions};
    use crate::grpc::ClientStream;
    use crate::rpc_api::inject;
    use crate::testing::{self, MemoryBackend, PipeListener, StaticAgentInfoResolver};
    use crate::tunnel::rpc::{connect_request, Descriptor};
    use crate::tunnel::tracker::{Querier, Tracker};

    const TOKEN: &str = "agent-token";
    const OWN_URL: &str = "grpc://127.0.0.1:8155";

    struct Harness {
        registry: Registry,
        tracker: Arc<Tracker>,
        channel: Channel,
        shutdown: CancellationToken,
    }

    fn start() -> Harness {
        let backend = Arc::new(MemoryBackend::new());
        let tracker = Arc::new(Tracker::new(
            backend,
            "kas",
            OWN_URL.to_string(),
            Duration::from_secs(300),
            Duration::from_secs(240),
            Duration::from_secs(600),
        ));
        let registry = Registry::new(tracker.clone(), IntGauge::new("t", "t").unwrap());
        let resolver: Arc<dyn AgentInfoResolver> =
            Arc::new(StaticAgentInfoResolver::new().with_agent(TOKEN, testing::agent_info(42)));
        let router = Router::new()
            .route(CONNECT_METHOD, connect_route(registry.clone()))
            .layer(from_fn_with_state(resolver, require_agent_token))
            .layer(from_fn(inject));
        let pipe = PipeListener::new();
        let channel = pipe.dialer().channel();
        let shutdown = CancellationToken::new();
        tokio::spawn(serve(
            Listener::Pipe(pipe),
            router,
            ServeOptions {
                name: "agent",
                max_connection_age: None,
                grace_period: Duration::from_millis(100),
            },
            shutdown.clone(),
        ));
        Harness {
            registry,
            tracker,
            channel,
            shutdown,
        }
    }

    fn auth(token: &str) -> MetadataMap {
        let mut md = MetadataMap::new();
        md.insert("authorization", format!("Bearer {token}").parse().unwrap());
        md
    }

    async fn connect_agent(
        channel: Channel,
    ) -> ClientStream<ConnectRequest, ConnectResponse> {
        let stream = ClientStream::open(
            channel,
            CONNECT_METHOD,
            auth(TOKEN),
            ProstCodec::<ConnectRequest, ConnectResponse>::default(),
        )
        .await
        .unwrap();
        stream
            .send(ConnectRequest::new(connect_request::Msg::Descriptor(
                Descriptor {
                    agent_descriptor: Some(testing::testing_descriptor()),
                },
            )))
            .await
            .unwrap();
        stream
    }

    async fn wait_parked(registry: &Registry, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.parked(42) != n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    async fn advertised(tracker: &Tracker) -> Vec<String> {
        let mut urls = Vec::new();
        tracker
            .kas_urls_by_agent_id(42, &mut |url| {
                urls.push(url);
                false
            })
            .await
            .unwrap();
        urls
    }

    #[tokio::test]
    async fn test_tunnel_is_parked_and_advertised() {
        let h = start();
        let agent = connect_agent(h.channel.clone()).await;
        wait_parked(&h.registry, 1).await;
        assert_eq!(advertised(&h.tracker).await, vec![OWN_URL.to_string()]);

        drop(agent);
        wait_parked(&h.registry, 0).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while !advertised(&h.tracker).await.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_found_tunnel_returns_when_unused() {
        let h = start();
        let _agent = connect_agent(h.channel.clone()).await;
        wait_parked(&h.registry, 1).await;

        let (found, mut handle) = h
            .registry
            .find_tunnel(42, testing::SERVICE, "RequestResponse")
            .await;
        assert!(found);
        let tunnel = handle.get(&CancellationToken::new()).await.unwrap();
        assert_eq!(h.registry.parked(42), 0);
        tunnel.done().await;
        assert_eq!(h.registry.parked(42), 1);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_queued_request_gets_next_tunnel() {
        let h = start();
        let (found, mut handle) = h
            .registry
            .find_tunnel(42, testing::SERVICE, "RequestResponse")
            .await;
        assert!(!found);
        let _agent = connect_agent(h.channel.clone()).await;
        let tunnel = tokio::time::timeout(
            Duration::from_secs(5),
            handle.get(&CancellationToken::new()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(tunnel.agent_id(), 42);
        // went straight to the request, never parked
        assert_eq!(h.registry.parked(42), 0);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unsupported_method_is_not_matched() {
        let h = start();
        let _agent = connect_agent(h.channel.clone()).await;
        wait_parked(&h.registry, 1).await;
        let (found, mut handle) = h.registry.find_tunnel(42, "other.Service", "M").await;
        assert!(!found);
        let ctx = CancellationToken::new();
        ctx.cancel();
        let err = handle.get(&ctx).await.unwrap_err();
        assert_eq!(err.code(), Code::Cancelled);
        assert_eq!(err.message(), "FindTunnel request aborted");
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_stop_releases_tunnels_and_requests() {
        let h = start();
        let mut agent = connect_agent(h.channel.clone()).await;
        wait_parked(&h.registry, 1).await;
        let (_, mut waiting) = h.registry.find_tunnel(7, testing::SERVICE, "RequestResponse").await;

        h.registry.stop().await;
        assert_eq!(h.registry.parked(42), 0);
        let err = waiting.get(&CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
        assert_eq!(err.message(), "kas is shutting down");
        // the agent's call ends cleanly
        assert!(agent.recv().await.unwrap().is_none());
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_unknown_token_rejected() {
        let h = start();
        let err = ClientStream::open(
            h.channel.clone(),
            CONNECT_METHOD,
            auth("bad"),
            ProstCodec::<ConnectRequest, ConnectResponse>::default(),
        )
        .await
        .err()
        .unwrap();
        assert_eq!(err.code(), Code::Unauthenticated);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_first_frame_must_be_descriptor() {
        let h = start();
        let mut stream = ClientStream::open(
            h.channel.clone(),
            CONNECT_METHOD,
            auth(TOKEN),
            ProstCodec::<ConnectRequest, ConnectResponse>::default(),
        )
        .await
        .unwrap();
        stream
            .send(ConnectRequest::new(connect_request::Msg::Header(
                crate::tunnel::rpc::Header::default(),
            )))
            .await
            .unwrap();
        let err = stream.recv().await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);
        h.shutdown.cancel();
    }
}
