use std::sync::Arc;

use axum::routing::MethodRouter;
use tonic::codec::ProstCodec;
use tonic::Status;

use super::{ConnectedAgentInfo, ConnectionTracker, RegisterRequest, RegisterResponse, REGISTER_METHOD};
use crate::grpc::server::{handler, streaming_route};
use crate::grpc::ServerStream;
use crate::redistool::expiring_hash::unix_now;
use crate::rpc_api::AgentRpcApi;

/// Route for `Register`. Must sit behind the agent token layer.
pub fn register_route(tracker: Arc<ConnectionTracker>) -> MethodRouter {
    streaming_route::<ProstCodec<RegisterResponse, RegisterRequest>>(
        REGISTER_METHOD,
        handler(move |stream| {
            let tracker = tracker.clone();
            async move { register(&tracker, stream).await }
        }),
    )
}

async fn register(
    tracker: &ConnectionTracker,
    mut stream: ServerStream<RegisterRequest, RegisterResponse>,
) -> Result<(), Status> {
    let Some(agent_api) = stream.extensions.get::<AgentRpcApi>().cloned() else {
        return Err(Status::internal("agent RPC API missing"));
    };
    let api = agent_api.api();
    let req = stream
        .recv()
        .await
        .map_err(|e| api.handle_io_error("RecvMsg(RegisterRequest) failed", &e))?
        .ok_or_else(|| Status::invalid_argument("RegisterRequest expected"))?;
    let Some(agent_meta) = req.agent_meta else {
        return Err(Status::invalid_argument("agent_meta is required"));
    };
    let info = agent_api.agent_info().await?;
    let connected = ConnectedAgentInfo {
        agent_meta: Some(agent_meta),
        connected_at: unix_now(),
        connection_id: req.pod_id,
        agent_id: info.id,
        project_id: info.project_id,
    };
    if let Err(e) = tracker.register_connection(&connected).await {
        api.handle_processing_error(info.id, "Failed to register agent", &e);
        return Err(Status::unavailable("Failed to register agent"));
    }
    stream
        .send(RegisterResponse {})
        .await
        .map_err(|e| api.handle_send_error("SendMsg(RegisterResponse) failed", e))
}
