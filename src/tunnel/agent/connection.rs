//! One tunnel connection, agent side.
//!
//! A connection dials kas' `Connect`, sends the agent descriptor and waits.
//! When kas sends a request it is replayed against the agent's upstream
//! server; the upstream response travels back as tunnel frames. Then the
//! connection dials again.

use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tonic::codec::ProstCodec;
use tonic::metadata::MetadataMap;
use tonic::transport::Channel;
use tonic::Status;
use tracing::{debug, error, Instrument};

use super::manager::{ConnectionFactory, ConnectionHooks};
use crate::errors::is_cancellation;
use crate::grpc::client::{ClientSender, PendingResponse};
use crate::grpc::metadata::{from_values, to_values};
use crate::grpc::status::RpcStatus;
use crate::grpc::{ClientStream, RawCodec};
use crate::retry::{Attempt, PollConfig, Poller};
use crate::tunnel::rpc::{
    connect_request, connect_response, AgentDescriptor, ConnectRequest, ConnectResponse,
    Descriptor, Header, Message, Trailer, CONNECT_METHOD, CONNECT_RESPONSE_AUTOMATON,
};

type TunnelSender = ClientSender<ConnectRequest>;

/// Everything a tunnel connection needs. Shared by all connections of a pool.
pub struct TunnelConnection {
    descriptor: AgentDescriptor,
    kas: Channel,
    agent_token: String,
    upstream: Channel,
    poll_config: PollConfig,
}

impl TunnelConnection {
    pub fn new(
        descriptor: AgentDescriptor,
        kas: Channel,
        agent_token: String,
        upstream: Channel,
        poll_config: PollConfig,
    ) -> Self {
        Self {
            descriptor,
            kas,
            agent_token,
            upstream,
            poll_config,
        }
    }

    /// Factory for a [`super::ConnectionManager`].
    pub fn factory(self: Arc<Self>) -> ConnectionFactory {
        Arc::new(move |hooks, ctx| {
            let conn = self.clone();
            let span = tracing::debug_span!("tunnel", connection_id = hooks.id());
            async move { conn.run(&hooks, ctx).await }
                .instrument(span)
                .boxed()
        })
    }

    /// Connect over and over until `ctx` is cancelled.
    pub async fn run(&self, hooks: &ConnectionHooks, ctx: CancellationToken) {
        let mut poller = Poller::new(self.poll_config);
        loop {
            let attempt = match self.attempt(hooks, &ctx).await {
                Ok(()) => {
                    debug!("Handled a connection successfully");
                    Attempt::ContinueImmediately
                }
                Err(e) if is_cancellation(&e) => {
                    debug!(error = %e, "Canceled connection");
                    Attempt::ContinueImmediately
                }
                Err(e) => {
                    error!(error = %e, "Error handling a connection");
                    Attempt::Backoff
                }
            };
            if !poller.next(&ctx, attempt).await {
                break;
            }
        }
        debug!("Connection done");
    }

    async fn attempt(&self, hooks: &ConnectionHooks, ctx: &CancellationToken) -> Result<(), Status> {
        let _idle = IdleOnExit(hooks);
        let (attempt_ctx, stop_propagation) = propagate_until(ctx);
        let _cancel = attempt_ctx.clone().drop_guard();

        let mut md = MetadataMap::new();
        let bearer = format!("Bearer {}", self.agent_token)
            .parse()
            .map_err(|_| Status::invalid_argument("agent token is not valid metadata"))?;
        md.insert("authorization", bearer);
        let tunnel = tokio::select! {
            () = attempt_ctx.cancelled() => return Err(Status::cancelled("Connect(): context done")),
            r = ClientStream::<ConnectRequest, ConnectResponse>::open(
                self.kas.clone(),
                CONNECT_METHOD,
                md,
                ProstCodec::default(),
            ) => r.map_err(|e| wrap("Connect()", &e))?,
        };
        let (tunnel_tx, mut tunnel_rx) = tunnel.split();
        let descriptor = ConnectRequest::new(connect_request::Msg::Descriptor(Descriptor {
            agent_descriptor: Some(self.descriptor.clone()),
        }));
        if tunnel_tx.send(descriptor).await.is_err() {
            // the real error is on the receiving side
            let err = match tunnel_rx.recv().await {
                Err(e) => e,
                Ok(_) => Status::unavailable("stream closed"),
            };
            return Err(wrap("Send(descriptor)", &err));
        }

        let mut tunnel_tx = Some(tunnel_tx);
        let mut upstream: Option<ClientSender<Bytes>> = None;
        let mut pipe = None;
        let pipe_done = CancellationToken::new();
        let mut state = CONNECT_RESPONSE_AUTOMATON.start(connect_response::START);
        let visit: Result<(), Status> = async {
            loop {
                let frame = tokio::select! {
                    () = attempt_ctx.cancelled() => return Err(Status::cancelled("tunnel: context done")),
                    frame = tunnel_rx.recv() => frame.map_err(|e| wrap("Recv(ConnectResponse)", &e))?,
                };
                let Some(frame) = frame else {
                    return state.finish();
                };
                let Some(msg) = frame.msg else {
                    return Err(Status::invalid_argument("Empty ConnectResponse"));
                };
                state.advance(msg.field_number())?;
                match msg {
                    connect_response::Msg::RequestInfo(info) => {
                        hooks.on_active();
                        // the request runs to completion from here on
                        stop_propagation.cancel();
                        let started = ClientStream::<Bytes, Bytes>::start(
                            self.upstream.clone(),
                            &info.method_name,
                            from_values(&info.meta),
                            RawCodec,
                        );
                        let (tx, pending) = match started {
                            Ok(started) => started,
                            Err(e) => {
                                debug!(error = %e, "Cannot start upstream call");
                                if let Some(tunnel_tx) = tunnel_tx.take() {
                                    send_error_to_tunnel(&e, tunnel_tx).await?;
                                }
                                continue;
                            }
                        };
                        upstream = Some(tx);
                        if let Some(tunnel_tx) = tunnel_tx.take() {
                            let ctx = attempt_ctx.clone();
                            let done = pipe_done.clone();
                            pipe = Some(tokio::spawn(
                                async move {
                                    let _done = done.drop_guard();
                                    tokio::select! {
                                        () = ctx.cancelled() => Err(Status::cancelled("pipe: context done")),
                                        r = pipe_upstream_into_tunnel(pending, tunnel_tx) => r,
                                    }
                                }
                                .in_current_span(),
                            ));
                        }
                    }
                    connect_response::Msg::Message(m) => {
                        if let Some(up) = &upstream {
                            // on failure the pipe sees the real error
                            tokio::select! {
                                _ = up.send(m.data) => {}
                                () = pipe_done.cancelled() => {}
                            }
                        }
                    }
                    connect_response::Msg::CloseSend(_) => {
                        if let Some(up) = upstream.as_mut() {
                            up.close_send();
                        }
                    }
                }
            }
        }
        .await;
        if visit.is_err() {
            attempt_ctx.cancel();
        }
        let piped = match pipe {
            Some(handle) => handle
                .await
                .unwrap_or_else(|e| Err(Status::internal(format!("pipe task failed: {e}")))),
            None => Ok(()),
        };
        visit.and(piped)
    }
}

/// Reports the connection idle when an attempt ends, however it ends.
struct IdleOnExit<'a>(&'a ConnectionHooks);

impl Drop for IdleOnExit<'_> {
    fn drop(&mut self) {
        self.0.on_idle();
    }
}

/// Copy the upstream response into the tunnel.
///
/// A send that fails because the tunnel is gone is not an error here: the
/// other direction reads the real error from the tunnel.
async fn pipe_upstream_into_tunnel(
    pending: PendingResponse<Bytes>,
    mut tunnel: TunnelSender,
) -> Result<(), Status> {
    let (header, mut upstream) = match pending.await {
        Ok(r) => r,
        // no header means no trailer either
        Err(e) => return send_error_to_tunnel(&e, tunnel).await,
    };
    let msg = ConnectRequest::new(connect_request::Msg::Header(Header {
        meta: to_values(&header),
    }));
    if tunnel.send(msg).await.is_err() {
        return Ok(());
    }
    loop {
        match upstream.recv().await {
            Ok(Some(data)) => {
                let msg = ConnectRequest::new(connect_request::Msg::Message(Message { data }));
                if tunnel.send(msg).await.is_err() {
                    return Ok(());
                }
            }
            Ok(None) => {
                let trailer = upstream.trailers().await.unwrap_or_default();
                let msg = ConnectRequest::new(connect_request::Msg::Trailer(Trailer {
                    meta: to_values(&trailer),
                }));
                if tunnel.send(msg).await.is_err() {
                    return Ok(());
                }
                break;
            }
            Err(recv_err) => {
                // trailers of a failed call ride on the status
                let msg = ConnectRequest::new(connect_request::Msg::Trailer(Trailer {
                    meta: to_values(recv_err.metadata()),
                }));
                if tunnel.send(msg).await.is_err() {
                    return Err(wrap("Recv(upstream)", &recv_err));
                }
                return send_error_to_tunnel(&recv_err, tunnel).await;
            }
        }
    }
    tunnel.close_send();
    Ok(())
}

async fn send_error_to_tunnel(err: &Status, mut tunnel: TunnelSender) -> Result<(), Status> {
    let msg = ConnectRequest::new(connect_request::Msg::Error(crate::tunnel::rpc::Error {
        status: Some(RpcStatus::from_status(err)),
    }));
    if tunnel.send(msg).await.is_err() {
        return Ok(());
    }
    tunnel.close_send();
    Ok(())
}

fn wrap(op: &str, err: &Status) -> Status {
    Status::new(err.code(), format!("{op}: {}", err.message()))
}

/// Derive a token that follows `ctx` until the returned stop token is
/// cancelled. After that only an explicit cancel of the derived token ends it.
pub(crate) fn propagate_until(ctx: &CancellationToken) -> (CancellationToken, CancellationToken) {
    let internal = CancellationToken::new();
    let stop = CancellationToken::new();
    tokio::spawn({
        let ctx = ctx.clone();
        let internal = internal.clone();
        let stop = stop.clone();
        async move {
            tokio::select! {
                biased;
                () = stop.cancelled() => {}
                () = internal.cancelled() => {}
                () = ctx.cancelled() => internal.cancel(),
            }
        }
    });
    (internal, stop)
}
