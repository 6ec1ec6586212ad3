//! Request routing into agent tunnels.
//!
//! Every agent-facing method is served twice, always as a bidi stream of raw
//! frames:
//!
//! - on the internal server by [`TunnelRouter::kas_routes`]: the routing side.
//!   It finds a kas instance holding a tunnel to the target agent and proxies
//!   the call to it.
//! - on the private API server by [`TunnelRouter::agent_routes`]: the gateway
//!   side. It waits for a local tunnel and pipes the call through it.
//!
//! Between the two kas instances the call carries `StartStreaming` plus the
//! caller's raw frames in one direction and [`GatewayResponse`] frames in the
//! other.

mod agent;
mod finder;
mod forwarder;
mod kas;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tonic::metadata::MetadataMap;
use tonic::Status;

use crate::config::ServiceConfig;
use crate::grpc::metadata::ROUTING_AGENT_ID_KEY;
use crate::grpc::pool::KasPool;
use crate::grpc::server::{handler, streaming_route, unimplemented, Handler};
use crate::grpc::status::RpcStatus;
use crate::grpc::visitor::{Automaton, Transition};
use crate::grpc::{full_method, RawCodec};
use crate::metrics::Metrics;
use crate::retry::PollConfig;
use crate::tunnel::rpc::{Error, Header, Message, Trailer};
use crate::tunnel::{AggregatingQuerier, Registry};

pub use finder::{ReadyTunnel, TunnelFinder};

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct TunnelReady {}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct NoTunnel {}

/// Sent by the routing kas once it has committed to a gateway.
#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct StartStreaming {}

/// What the gateway kas sends back to the routing kas.
#[derive(Clone, PartialEq, prost::Message)]
pub struct GatewayResponse {
    #[prost(oneof = "gateway_response::Msg", tags = "1, 2, 3, 4, 5, 6")]
    pub msg: Option<gateway_response::Msg>,
}

pub mod gateway_response {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Msg {
        #[prost(message, tag = "1")]
        TunnelReady(super::TunnelReady),
        #[prost(message, tag = "2")]
        Header(super::Header),
        #[prost(message, tag = "3")]
        Message(super::Message),
        #[prost(message, tag = "4")]
        Trailer(super::Trailer),
        #[prost(message, tag = "5")]
        Error(super::Error),
        #[prost(message, tag = "6")]
        NoTunnel(super::NoTunnel),
    }

    impl Msg {
        pub fn field_number(&self) -> u32 {
            match self {
                Self::TunnelReady(_) => TUNNEL_READY,
                Self::Header(_) => HEADER,
                Self::Message(_) => MESSAGE,
                Self::Trailer(_) => TRAILER,
                Self::Error(_) => ERROR,
                Self::NoTunnel(_) => NO_TUNNEL,
            }
        }
    }

    pub const TUNNEL_READY: u32 = 1;
    pub const HEADER: u32 = 2;
    pub const MESSAGE: u32 = 3;
    pub const TRAILER: u32 = 4;
    pub const ERROR: u32 = 5;
    pub const NO_TUNNEL: u32 = 6;
}

impl GatewayResponse {
    pub fn new(msg: gateway_response::Msg) -> Self {
        Self { msg: Some(msg) }
    }

    pub fn error(status: RpcStatus) -> Self {
        Self::new(gateway_response::Msg::Error(Error {
            status: Some(status),
        }))
    }
}

/// Frame order from the gateway kas.
pub static GATEWAY_RESPONSE_AUTOMATON: Automaton = {
    use gateway_response::{ERROR, HEADER, MESSAGE, NO_TUNNEL, TRAILER, TUNNEL_READY};
    Automaton {
        name: "GatewayResponse",
        transitions: &[
            Transition {
                from: NO_TUNNEL,
                next: &[TUNNEL_READY],
                eof_allowed: false,
            },
            Transition {
                from: TUNNEL_READY,
                next: &[HEADER, ERROR],
                eof_allowed: false,
            },
            Transition {
                from: HEADER,
                next: &[MESSAGE, TRAILER, ERROR],
                eof_allowed: false,
            },
            Transition {
                from: MESSAGE,
                next: &[MESSAGE, TRAILER, ERROR],
                eof_allowed: false,
            },
            Transition {
                from: TRAILER,
                next: &[ERROR],
                eof_allowed: true,
            },
            Transition {
                from: ERROR,
                next: &[],
                eof_allowed: true,
            },
        ],
    }
};

/// Every routable method, built once from the configured agent services.
#[derive(Debug, Clone, Default)]
pub struct MethodTable {
    methods: Vec<String>,
}

impl MethodTable {
    pub fn new(services: &[ServiceConfig]) -> Self {
        let mut methods: Vec<String> = services
            .iter()
            .flat_map(|s| s.methods.iter().map(|m| full_method(&s.name, m)))
            .collect();
        methods.sort();
        methods.dedup();
        Self { methods }
    }

    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    /// Mount `handler` on every method. Anything else is `Unimplemented`.
    pub fn routes(&self, handler: Handler<Bytes, Bytes>) -> axum::Router {
        self.methods
            .iter()
            .fold(axum::Router::new(), |router, method| {
                router.route(
                    method,
                    streaming_route::<RawCodec>(method, handler.clone()),
                )
            })
            .fallback(unimplemented)
    }
}

/// Target agent of a routed call.
pub fn agent_id_from_meta(md: &MetadataMap) -> Result<i64, Status> {
    let values: Vec<_> = md.get_all(ROUTING_AGENT_ID_KEY).iter().collect();
    if values.len() != 1 {
        return Err(Status::invalid_argument(format!(
            "Expecting a single {ROUTING_AGENT_ID_KEY}, got {}",
            values.len()
        )));
    }
    values[0]
        .to_str()
        .ok()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| Status::invalid_argument(format!("Invalid {ROUTING_AGENT_ID_KEY}")))
}

#[derive(Debug, Clone, Copy)]
pub struct RouterConfig {
    pub tunnel_find_timeout: Duration,
    pub poll_config: PollConfig,
    pub speculation_factor: usize,
}

/// Both routing handlers and what they share.
pub struct TunnelRouter {
    pool: Arc<dyn KasPool>,
    querier: Arc<AggregatingQuerier>,
    registry: Registry,
    own_url: String,
    config: RouterConfig,
    metrics: Metrics,
}

impl TunnelRouter {
    pub fn new(
        pool: Arc<dyn KasPool>,
        querier: Arc<AggregatingQuerier>,
        registry: Registry,
        own_url: String,
        config: RouterConfig,
        metrics: Metrics,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            querier,
            registry,
            own_url,
            config,
            metrics,
        })
    }

    /// Routing side, for the internal and API servers.
    pub fn kas_routes(self: &Arc<Self>, table: &MethodTable) -> axum::Router {
        let router = self.clone();
        table.routes(handler(move |stream| {
            let router = router.clone();
            async move { router.route_to_kas(stream).await }
        }))
    }

    /// Gateway side, for the private API server.
    pub fn agent_routes(self: &Arc<Self>, table: &MethodTable) -> axum::Router {
        let router = self.clone();
        table.routes(handler(move |stream| {
            let router = router.clone();
            async move { router.route_to_agent(stream).await }
        }))
    }
}
