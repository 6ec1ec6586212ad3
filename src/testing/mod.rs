//! Test support shared by unit and integration tests.
//!
//! - [`MemoryBackend`]: the backing store in memory
//! - [`PipeListener`]: serve gRPC without sockets
//! - [`StaticAgentInfoResolver`]: fixed token to agent mapping
//! - the `gitlab.agent.Testing` service used as an agent's upstream

mod backend;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tonic::codec::ProstCodec;
use tonic::metadata::MetadataMap;
use tonic::transport::Channel;
use tonic::Status;

pub use backend::MemoryBackend;
pub use crate::grpc::pipe::{PipeDialer, PipeListener};

use crate::config::ServiceConfig;
use crate::errors::Error;
use crate::gitlab::{AgentInfo, AgentInfoResolver};
use crate::grpc::listener::{serve, Listener, ServeOptions};
use crate::grpc::server::{handler, streaming_route, unimplemented, Handler};
use crate::grpc::ServerStream;
use crate::tunnel::rpc::{AgentDescriptor, Method, Service};

pub const SERVICE: &str = "gitlab.agent.Testing";
pub const REQUEST_RESPONSE: &str = "/gitlab.agent.Testing/RequestResponse";
pub const STREAMING_REQUEST_RESPONSE: &str = "/gitlab.agent.Testing/StreamingRequestResponse";

#[derive(Clone, PartialEq, prost::Message)]
pub struct Request {
    #[prost(string, tag = "1")]
    pub s1: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Response {
    #[prost(int64, tag = "1")]
    pub scalar: i64,
}

/// Resolves a fixed set of tokens. Unknown tokens are rejected the way GitLab
/// rejects them.
#[derive(Default)]
pub struct StaticAgentInfoResolver {
    agents: HashMap<String, AgentInfo>,
}

impl StaticAgentInfoResolver {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_agent(mut self, token: &str, info: AgentInfo) -> Self {
        self.agents.insert(token.to_string(), info);
        self
    }
}

#[async_trait]
impl AgentInfoResolver for StaticAgentInfoResolver {
    async fn get_agent_info(&self, agent_token: &str) -> Result<AgentInfo, Error> {
        self.agents
            .get(agent_token)
            .cloned()
            .ok_or_else(|| Error::GitlabClient {
                status: 401,
                message: "unknown token".to_string(),
            })
    }
}

pub fn agent_info(id: i64) -> AgentInfo {
    AgentInfo {
        id,
        project_id: id * 10,
        name: format!("agent-{id}"),
        default_branch: "main".to_string(),
        repository: serde_json::Value::Null,
    }
}

/// Descriptor of an agent serving the testing service.
pub fn testing_descriptor() -> AgentDescriptor {
    AgentDescriptor {
        services: vec![Service {
            name: SERVICE.to_string(),
            methods: vec![
                Method {
                    name: "RequestResponse".to_string(),
                },
                Method {
                    name: "StreamingRequestResponse".to_string(),
                },
            ],
        }],
    }
}

/// The testing service as a routable agent service.
pub fn testing_service_config() -> ServiceConfig {
    ServiceConfig {
        name: SERVICE.to_string(),
        methods: vec![
            "RequestResponse".to_string(),
            "StreamingRequestResponse".to_string(),
        ],
    }
}

/// Serve both testing methods with `handler`.
pub fn testing_router(handler: Handler<Request, Response>) -> Router {
    Router::new()
        .route(
            REQUEST_RESPONSE,
            streaming_route::<ProstCodec<Response, Request>>(REQUEST_RESPONSE, handler.clone()),
        )
        .route(
            STREAMING_REQUEST_RESPONSE,
            streaming_route::<ProstCodec<Response, Request>>(STREAMING_REQUEST_RESPONSE, handler),
        )
        .fallback(unimplemented)
}

/// Serve `router` on a fresh pipe until `shutdown` is cancelled.
pub fn serve_pipe(router: Router, shutdown: CancellationToken) -> Channel {
    let pipe = PipeListener::new();
    let channel = pipe.dialer().channel();
    tokio::spawn(serve(
        Listener::Pipe(pipe),
        router,
        ServeOptions {
            name: "test",
            max_connection_age: None,
            grace_period: Duration::from_millis(100),
        },
        shutdown,
    ));
    channel
}

pub fn md(pairs: &[(&'static str, &'static str)]) -> MetadataMap {
    let mut m = MetadataMap::new();
    for (k, v) in pairs {
        m.append(*k, v.parse().unwrap_or_else(|_| tonic::metadata::MetadataValue::from_static("")));
    }
    m
}

/// Answers every request with its `s1` parsed as the scalar, sending header
/// `key2: value2` first and trailer `key3: value3` last.
pub fn echo_handler() -> Handler<Request, Response> {
    handler(|mut stream: ServerStream<Request, Response>| async move {
        stream.sink.send_header(md(&[("key2", "value2")]))?;
        while let Some(req) = stream.recv().await? {
            let scalar = req
                .s1
                .parse()
                .map_err(|_| Status::invalid_argument("s1 must be a number"))?;
            if stream.send(Response { scalar }).await.is_err() {
                break;
            }
        }
        stream.sink.set_trailer(md(&[("key3", "value3")]));
        Ok(())
    })
}

/// Fails every request with `status` without sending anything else.
pub fn error_handler(status: Status) -> Handler<Request, Response> {
    handler(move |_stream: ServerStream<Request, Response>| {
        let status = status.clone();
        async move { Err(status) }
    })
}

/// Sends header and trailer, then fails with `status`.
pub fn error_after_header_handler(status: Status) -> Handler<Request, Response> {
    handler(move |stream: ServerStream<Request, Response>| {
        let status = status.clone();
        async move {
            stream.sink.send_header(md(&[("key2", "value2")]))?;
            stream.sink.set_trailer(md(&[("key3", "value3")]));
            Err(status)
        }
    })
}
