//! Bearer credentials on incoming calls.
//!
//! Agents authenticate with `authorization: Bearer <agent token>`. The token is
//! opaque to kas: it is attached to the request's [`AgentRpcApi`] and resolved
//! through GitLab only when a handler asks for the agent's identity. Peer kas
//! instances use the same header with a JWT (see [`crate::grpc::jwt`]).

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use http::HeaderMap;
use tonic::Status;

use crate::gitlab::AgentInfoResolver;
use crate::grpc::server::status_response;
use crate::redistool::TokenLimiter;
use crate::rpc_api::{AgentRpcApi, RpcApi};

const BEARER: &str = "bearer";

/// Extract the credential from `authorization: Bearer <credential>`. The scheme
/// is case-insensitive.
pub fn bearer_token(headers: &HeaderMap) -> Result<String, Status> {
    let unauthenticated = || Status::unauthenticated("Request unauthenticated with bearer");
    let value = headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(unauthenticated)?;
    let (scheme, token) = value.split_once(' ').ok_or_else(unauthenticated)?;
    if !scheme.eq_ignore_ascii_case(BEARER) {
        return Err(unauthenticated());
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(unauthenticated());
    }
    Ok(token.to_string())
}

/// Axum middleware for agent-facing routes: require a bearer token and attach
/// an [`AgentRpcApi`] carrying it.
///
/// Expects [`RpcApi`] to have been injected by an outer layer; a fresh one is
/// made otherwise.
pub async fn require_agent_token(
    State(resolver): State<Arc<dyn AgentInfoResolver>>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = match bearer_token(request.headers()) {
        Ok(token) => token,
        Err(status) => return status_response(status),
    };
    let api = request
        .extensions()
        .get::<RpcApi>()
        .cloned()
        .unwrap_or_else(|| RpcApi::new(request.uri().path()));
    request
        .extensions_mut()
        .insert(AgentRpcApi::new(api, token, resolver));
    next.run(request).await
}

/// Axum middleware: per-token connection rate limit. Must run inside
/// [`require_agent_token`].
pub async fn limit_per_token(
    State(limiter): State<Arc<TokenLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(api) = request.extensions().get::<AgentRpcApi>() else {
        return status_response(Status::internal("agent RPC API missing"));
    };
    if !limiter.allow(api.agent_token()).await {
        // ResourceExhausted, not Unavailable: agents back off on it
        return status_response(Status::resource_exhausted(
            "rate limit exceeded, please retry later",
        ));
    }
    next.run(request).await
}
