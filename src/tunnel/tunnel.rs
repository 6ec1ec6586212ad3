//! One agent tunnel, as held by the gateway kas.
//!
//! A [`Tunnel`] owns the server side of an agent's `Connect` stream. The
//! registry hands it to whoever found it; that caller pipes one incoming
//! request through it with [`Tunnel::forward_stream`] and gives it back with
//! [`Tunnel::done`].

use std::collections::HashMap;
use std::pin::pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{self, Either};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataMap;
use tonic::Status;

use super::registry::Shared;
use super::rpc::{
    connect_request, connect_response, AgentDescriptor, CloseSend, ConnectRequest,
    ConnectResponse, Message, RequestInfo, CONNECT_REQUEST_AUTOMATON,
};
use crate::grpc::metadata::{to_values, Values};
use crate::grpc::server::Incoming;
use crate::grpc::status::RpcStatus;
use crate::grpc::ResponseSink;
use crate::rpc_api::RpcApi;

/// Lifecycle of a tunnel, guarded by the registry lock. A tunnel whose
/// agent went away while it was idle or found has no state at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    /// Owned by the registry, can be found.
    Ready,
    /// Handed out, not used yet.
    Found,
    /// Carrying a request.
    Forwarding,
    /// Request finished, [`Tunnel::done`] called.
    Done,
}

/// Receives what the agent's upstream produced.
#[async_trait]
pub trait DataCallback: Send + Sync {
    async fn header(&self, meta: HashMap<String, Values>) -> Result<(), Status>;
    async fn message(&self, data: Bytes) -> Result<(), Status>;
    async fn trailer(&self, meta: HashMap<String, Values>) -> Result<(), Status>;
    async fn error(&self, status: RpcStatus) -> Result<(), Status>;
}

pub struct Tunnel {
    pub(crate) connection_id: u64,
    pub(crate) agent_id: i64,
    pub(crate) descriptor: AgentDescriptor,
    incoming: Incoming<ConnectRequest>,
    sink: ResponseSink<ConnectResponse>,
    /// Result for the agent's `Connect` handler.
    ret_tx: Option<oneshot::Sender<Result<(), Status>>>,
    registry: Arc<Shared>,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("connection_id", &self.connection_id)
            .field("agent_id", &self.agent_id)
            .finish_non_exhaustive()
    }
}

/// Outcome of one forwarding: what the `Connect` handler returns and what the
/// incoming request's handler returns.
struct ErrPair {
    for_tunnel: Result<(), Status>,
    for_incoming: Result<(), Status>,
}

impl ErrPair {
    fn ok() -> Self {
        Self {
            for_tunnel: Ok(()),
            for_incoming: Ok(()),
        }
    }

    fn both(status: Status) -> Self {
        Self {
            for_tunnel: Err(status.clone()),
            for_incoming: Err(status),
        }
    }

    fn is_ok(&self) -> bool {
        self.for_tunnel.is_ok() && self.for_incoming.is_ok()
    }
}

impl Tunnel {
    pub(crate) fn new(
        connection_id: u64,
        agent_id: i64,
        descriptor: AgentDescriptor,
        incoming: Incoming<ConnectRequest>,
        sink: ResponseSink<ConnectResponse>,
        ret_tx: oneshot::Sender<Result<(), Status>>,
        registry: Arc<Shared>,
    ) -> Self {
        Self {
            connection_id,
            agent_id,
            descriptor,
            incoming,
            sink,
            ret_tx: Some(ret_tx),
            registry,
        }
    }

    pub fn agent_id(&self) -> i64 {
        self.agent_id
    }

    pub fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    /// End the agent's `Connect` call with `result`.
    pub(crate) fn finish(&mut self, result: Result<(), Status>) {
        if let Some(tx) = self.ret_tx.take() {
            let _ = tx.send(result);
        }
    }

    /// Pipe one request through the tunnel.
    ///
    /// `incoming` carries the caller's raw request frames; `method` and `meta`
    /// are sent ahead of them as the request info. Whatever the agent answers
    /// goes to `cb`. Returns the status for the incoming request; the agent's
    /// `Connect` call is completed with its own result.
    pub async fn forward_stream<C: DataCallback>(
        &mut self,
        api: &RpcApi,
        incoming: &mut Incoming<Bytes>,
        incoming_ctx: &CancellationToken,
        method: &str,
        meta: &MetadataMap,
        cb: &C,
    ) -> Result<(), Status> {
        self.registry.on_forward(self.connection_id)?;
        let pair = self
            .forward(api, incoming, incoming_ctx, method, meta, cb)
            .await;
        self.finish(pair.for_tunnel);
        pair.for_incoming
    }

    async fn forward<C: DataCallback>(
        &mut self,
        api: &RpcApi,
        incoming: &mut Incoming<Bytes>,
        incoming_ctx: &CancellationToken,
        method: &str,
        meta: &MetadataMap,
        cb: &C,
    ) -> ErrPair {
        let sink = &self.sink;
        let tunnel_in = &mut self.incoming;

        // incoming request -> agent
        let to_tunnel = async {
            let info = ConnectResponse::new(connect_response::Msg::RequestInfo(RequestInfo {
                method_name: method.to_string(),
                meta: to_values(meta),
            }));
            if let Err(e) = sink.send(info).await {
                return ErrPair::both(api.handle_send_error("Send(ConnectResponse_RequestInfo)", e));
            }
            loop {
                match incoming.recv().await {
                    Ok(Some(data)) => {
                        let msg = ConnectResponse::new(connect_response::Msg::Message(Message {
                            data,
                        }));
                        if let Err(e) = sink.send(msg).await {
                            return ErrPair::both(
                                api.handle_send_error("Send(ConnectResponse_Message)", e),
                            );
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        return ErrPair {
                            for_tunnel: Err(Status::cancelled("read from incoming stream")),
                            for_incoming: Err(e),
                        };
                    }
                }
            }
            let close = ConnectResponse::new(connect_response::Msg::CloseSend(CloseSend {}));
            if let Err(e) = sink.send(close).await {
                return ErrPair::both(api.handle_send_error("Send(ConnectResponse_CloseSend)", e));
            }
            ErrPair::ok()
        };

        // agent -> incoming request
        let from_tunnel = async {
            let mut state = CONNECT_REQUEST_AUTOMATON.start(connect_request::DESCRIPTOR);
            let mut for_incoming = Ok(());
            loop {
                let frame = match tunnel_in.recv().await {
                    Ok(Some(frame)) => frame,
                    Ok(None) => match state.finish() {
                        Ok(()) => break,
                        Err(st) => return ErrPair::both(st),
                    },
                    Err(e) => return ErrPair::both(e),
                };
                let Some(msg) = frame.msg else {
                    return ErrPair::both(Status::invalid_argument("Empty ConnectRequest"));
                };
                if let Err(st) = state.advance(msg.field_number()) {
                    return ErrPair::both(st);
                }
                let res = match msg {
                    connect_request::Msg::Header(h) => cb.header(h.meta).await,
                    connect_request::Msg::Message(m) => cb.message(m.data).await,
                    connect_request::Msg::Trailer(t) => cb.trailer(t.meta).await,
                    connect_request::Msg::Error(e) => {
                        // keep reading until the agent closes the stream
                        for_incoming = cb.error(e.status.unwrap_or_default()).await;
                        Ok(())
                    }
                    connect_request::Msg::Descriptor(_) => {
                        Err(Status::invalid_argument("Unexpected descriptor"))
                    }
                };
                if let Err(st) = res {
                    return ErrPair::both(st);
                }
            }
            ErrPair {
                for_tunnel: Ok(()),
                for_incoming,
            }
        };

        let to_tunnel = pin!(to_tunnel);
        let from_tunnel = pin!(from_tunnel);
        let remaining = match future::select(to_tunnel, from_tunnel).await {
            Either::Left((pair, other)) => {
                if !pair.is_ok() {
                    return pair;
                }
                Either::Left(other)
            }
            Either::Right((pair, other)) => {
                if !pair.is_ok() {
                    return pair;
                }
                Either::Right(other)
            }
        };
        tokio::select! {
            () = incoming_ctx.cancelled() => ErrPair::both(Status::cancelled("Incoming stream closed")),
            pair = remaining => pair,
        }
    }

    /// Hand the tunnel back. An unused tunnel returns to the registry; a used
    /// one is finished.
    pub async fn done(self) {
        let registry = self.registry.clone();
        registry.on_tunnel_done(self).await;
    }
}
