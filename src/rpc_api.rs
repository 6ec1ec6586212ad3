//! Per-request RPC API.
//!
//! The [`inject`] layer gives every call a [`RpcApi`]: a correlation id, a
//! tracing span carrying that id plus the gRPC service and method, and the
//! error classification every handler shares. Handlers take it from the
//! request extensions. Agent-facing calls additionally carry an
//! [`AgentRpcApi`] with the caller's token.
//!
//! Error classification:
//!
//! - cancellations are logged at debug and never captured
//! - user errors are logged at info
//! - everything else is logged at error with `captured = true`

use std::fmt::Display;
use std::sync::Arc;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use tonic::{Code, Extensions, Status};
use tracing::{debug, error, info, info_span, Instrument, Span};
use uuid::Uuid;

use crate::errors::{is_cancellation, is_user_status, to_status, Error};
use crate::gitlab::{AgentInfo, AgentInfoResolver};
use crate::grpc::{split_method, Closed};

struct Inner {
    correlation_id: String,
    service: String,
    method: String,
    span: Span,
}

/// Request-scoped logging and error handling.
#[derive(Clone)]
pub struct RpcApi {
    inner: Arc<Inner>,
}

impl RpcApi {
    pub fn new(full_method: &str) -> Self {
        let correlation_id = Uuid::new_v4().simple().to_string();
        let (service, method) = split_method(full_method);
        let span = info_span!(
            "rpc",
            correlation_id = %correlation_id,
            grpc_service = service,
            grpc_method = method,
        );
        Self {
            inner: Arc::new(Inner {
                correlation_id,
                service: service.to_string(),
                method: method.to_string(),
                span,
            }),
        }
    }

    /// The injected API, or a fresh one when the route has no [`inject`] layer.
    pub fn from_extensions(extensions: &Extensions, full_method: &str) -> Self {
        extensions
            .get::<Self>()
            .cloned()
            .unwrap_or_else(|| Self::new(full_method))
    }

    pub fn correlation_id(&self) -> &str {
        &self.inner.correlation_id
    }

    pub fn service(&self) -> &str {
        &self.inner.service
    }

    pub fn method(&self) -> &str {
        &self.inner.method
    }

    pub fn span(&self) -> &Span {
        &self.inner.span
    }

    /// Log an error that does not end the request.
    pub fn handle_processing_error(&self, agent_id: i64, msg: &str, err: &dyn Display) {
        error!(parent: &self.inner.span, agent_id, error = %err, captured = true, "{msg}");
    }

    /// Log a failed read or write on a stream and turn it into the status the
    /// handler returns.
    pub fn handle_io_error(&self, msg: &str, err: &Status) -> Status {
        debug!(parent: &self.inner.span, error = %err, "{msg}");
        match err.code() {
            Code::Cancelled | Code::DeadlineExceeded => {
                Status::new(err.code(), format!("{msg}: {}", err.message()))
            }
            _ => Status::unavailable(format!("{msg}: {}", err.message())),
        }
    }

    /// A send failed because the client went away.
    pub fn handle_send_error(&self, msg: &str, err: Closed) -> Status {
        debug!(parent: &self.inner.span, error = %err, "{msg}");
        Status::unavailable(format!("{msg}: {err}"))
    }

    /// Log the final status of a handler according to its class.
    pub fn log_status(&self, status: &Status) {
        let span = &self.inner.span;
        if is_cancellation(status) {
            debug!(parent: span, code = ?status.code(), message = status.message(), "Request cancelled");
        } else if is_user_status(status) {
            info!(parent: span, code = ?status.code(), message = status.message(), "Request failed");
        } else if status.code() != Code::Ok {
            error!(
                parent: span,
                code = ?status.code(),
                message = status.message(),
                captured = true,
                "Request failed"
            );
        }
    }
}

/// RPC API for calls made by agents.
#[derive(Clone)]
pub struct AgentRpcApi {
    api: RpcApi,
    agent_token: String,
    resolver: Arc<dyn AgentInfoResolver>,
}

impl AgentRpcApi {
    pub fn new(api: RpcApi, agent_token: String, resolver: Arc<dyn AgentInfoResolver>) -> Self {
        Self {
            api,
            agent_token,
            resolver,
        }
    }

    pub fn api(&self) -> &RpcApi {
        &self.api
    }

    pub fn agent_token(&self) -> &str {
        &self.agent_token
    }

    /// Resolve the caller's identity, translated to the status a handler
    /// returns on failure.
    pub async fn agent_info(&self) -> Result<AgentInfo, Status> {
        match self.resolver.get_agent_info(&self.agent_token).await {
            Ok(info) => Ok(info),
            Err(e) if e.is_user_error() => {
                info!(parent: self.api.span(), error = %e, "AgentInfo()");
                Err(to_status(&e))
            }
            Err(e) => {
                self.api
                    .handle_processing_error(crate::NO_AGENT_ID, "AgentInfo()", &e);
                Err(match e {
                    Error::Config(_) | Error::InvalidUrl { .. } => to_status(&e),
                    _ => Status::unavailable("unavailable"),
                })
            }
        }
    }
}

/// Outermost-but-one layer: attach a [`RpcApi`] and run the rest of the chain
/// inside its span.
pub async fn inject(mut request: Request, next: Next) -> Response {
    let api = RpcApi::new(request.uri().path());
    let span = api.span().clone();
    request.extensions_mut().insert(api);
    next.run(request).instrument(span).await
}
