//! Piping a routed call between the caller and the gateway kas.

use std::pin::pin;

use bytes::Bytes;
use futures::future::{select, Either};
use tokio_util::sync::CancellationToken;
use tonic::Status;

use super::gateway_response::{Msg, TUNNEL_READY};
use super::{GatewayResponse, GATEWAY_RESPONSE_AUTOMATON};
use crate::grpc::client::{ClientReceiver, ClientSender};
use crate::grpc::codec::decode;
use crate::grpc::metadata::from_values;
use crate::grpc::server::Incoming;
use crate::grpc::ResponseSink;
use crate::rpc_api::RpcApi;

/// Pipe a call through a gateway that has already reported `tunnel_ready`.
///
/// Gateway frames are replayed to the caller; the caller's raw frames go to the
/// gateway as is. An error frame from the gateway becomes the call's status and
/// takes precedence over a failure on the caller's side.
pub async fn forward_stream(
    api: &RpcApi,
    ctx: &CancellationToken,
    peer_tx: ClientSender<Bytes>,
    peer_rx: ClientReceiver<Bytes>,
    incoming: &mut Incoming<Bytes>,
    sink: &ResponseSink<Bytes>,
) -> Result<(), Status> {
    let to_caller = pin!(pipe_peer_to_caller(api, peer_rx, sink));
    let to_peer = pin!(pipe_caller_to_peer(api, incoming, peer_tx));
    match select(to_caller, to_peer).await {
        Either::Left((result, _)) => result,
        Either::Right((Ok(()), to_caller)) => to_caller.await,
        Either::Right((Err(caller_err), to_caller)) => {
            tokio::select! {
                result = to_caller => result.and(Err(caller_err)),
                () = ctx.cancelled() => Err(caller_err),
            }
        }
    }
}

async fn pipe_peer_to_caller(
    api: &RpcApi,
    mut peer_rx: ClientReceiver<Bytes>,
    sink: &ResponseSink<Bytes>,
) -> Result<(), Status> {
    let mut state = GATEWAY_RESPONSE_AUTOMATON.start(TUNNEL_READY);
    let mut peer_err = None;
    loop {
        let frame = match peer_rx.recv().await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                state.finish()?;
                break;
            }
            Err(e) => {
                return Err(peer_err.unwrap_or_else(|| {
                    api.handle_io_error("RecvMsg(GatewayResponse) failed", &e)
                }))
            }
        };
        let resp: GatewayResponse = decode(frame)?;
        let Some(msg) = resp.msg else {
            return Err(Status::internal("GatewayResponse without a message"));
        };
        state.advance(msg.field_number())?;
        match msg {
            Msg::Header(h) => sink.send_header(from_values(&h.meta))?,
            Msg::Message(m) => sink
                .send(m.data)
                .await
                .map_err(|e| api.handle_send_error("SendMsg() failed", e))?,
            Msg::Trailer(t) => sink.set_trailer(from_values(&t.meta)),
            Msg::Error(e) => peer_err = Some(e.status.unwrap_or_default().into_status()),
            Msg::TunnelReady(_) | Msg::NoTunnel(_) => {
                return Err(Status::internal("unexpected GatewayResponse"))
            }
        }
    }
    peer_err.map_or(Ok(()), Err)
}

async fn pipe_caller_to_peer(
    api: &RpcApi,
    incoming: &mut Incoming<Bytes>,
    mut peer_tx: ClientSender<Bytes>,
) -> Result<(), Status> {
    loop {
        match incoming.recv().await {
            Ok(Some(frame)) => {
                if peer_tx.send(frame).await.is_err() {
                    // the gateway is done; its answer arrives on the other half
                    return Ok(());
                }
            }
            Ok(None) => {
                peer_tx.close_send();
                return Ok(());
            }
            Err(e) => return Err(api.handle_io_error("RecvMsg() failed", &e)),
        }
    }
}
