//! Gateway side: pipe a routed call through a local tunnel.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use tonic::Status;

use super::gateway_response::Msg;
use super::{agent_id_from_meta, GatewayResponse, NoTunnel, StartStreaming, TunnelReady, TunnelRouter};
use crate::grpc::codec::{decode, encode};
use crate::grpc::metadata::{remove_hop_meta, Values};
use crate::grpc::status::RpcStatus;
use crate::grpc::{split_method, ResponseSink, ServerStream};
use crate::rpc_api::RpcApi;
use crate::tunnel::rpc::{Error, Header, Message, Trailer};
use crate::tunnel::DataCallback;

impl TunnelRouter {
    pub(super) async fn route_to_agent(
        &self,
        stream: ServerStream<Bytes, Bytes>,
    ) -> Result<(), Status> {
        let api = RpcApi::from_extensions(&stream.extensions, &stream.info.method);
        let result = self.route_to_agent_inner(&api, stream).await;
        if let Err(status) = &result {
            api.log_status(status);
        }
        result
    }

    async fn route_to_agent_inner(
        &self,
        api: &RpcApi,
        stream: ServerStream<Bytes, Bytes>,
    ) -> Result<(), Status> {
        let agent_id = agent_id_from_meta(&stream.info.metadata)?;
        let ServerStream {
            info,
            mut incoming,
            sink,
            ..
        } = stream;
        let meta = remove_hop_meta(&info.metadata);
        let (service, method) = split_method(&info.method);
        let (found, mut handle) = self.registry.find_tunnel(agent_id, service, method).await;
        if !found {
            send_gateway(api, &sink, Msg::NoTunnel(NoTunnel {}), "NoTunnel").await?;
        }
        let mut tunnel = handle.get(&info.ctx).await?;
        drop(handle);

        let result = async {
            send_gateway(api, &sink, Msg::TunnelReady(TunnelReady {}), "TunnelReady").await?;
            match incoming.recv().await {
                Ok(Some(frame)) => {
                    decode::<StartStreaming>(frame)?;
                }
                // the routing kas picked another gateway
                Ok(None) => return Ok(()),
                Err(e) => return Err(api.handle_io_error("RecvMsg(StartStreaming) failed", &e)),
            }
            let cb = GatewayCallback { api, sink: &sink };
            tunnel
                .forward_stream(api, &mut incoming, &info.ctx, &info.method, &meta, &cb)
                .await
        }
        .await;
        tunnel.done().await;
        result
    }
}

async fn send_gateway(
    api: &RpcApi,
    sink: &ResponseSink<Bytes>,
    msg: Msg,
    name: &str,
) -> Result<(), Status> {
    sink.send(encode(&GatewayResponse::new(msg)))
        .await
        .map_err(|e| api.handle_send_error(&format!("SendMsg(GatewayResponse_{name}) failed"), e))
}

/// Wraps what the agent answers into gateway frames for the routing kas.
struct GatewayCallback<'a> {
    api: &'a RpcApi,
    sink: &'a ResponseSink<Bytes>,
}

#[async_trait]
impl DataCallback for GatewayCallback<'_> {
    async fn header(&self, meta: HashMap<String, Values>) -> Result<(), Status> {
        send_gateway(self.api, self.sink, Msg::Header(Header { meta }), "Header").await
    }

    async fn message(&self, data: Bytes) -> Result<(), Status> {
        send_gateway(self.api, self.sink, Msg::Message(Message { data }), "Message").await
    }

    async fn trailer(&self, meta: HashMap<String, Values>) -> Result<(), Status> {
        send_gateway(self.api, self.sink, Msg::Trailer(Trailer { meta }), "Trailer").await
    }

    async fn error(&self, status: RpcStatus) -> Result<(), Status> {
        send_gateway(
            self.api,
            self.sink,
            Msg::Error(Error {
                status: Some(status),
            }),
            "Error",
        )
        .await
    }
}
