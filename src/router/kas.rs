//! Routing side: find a gateway kas and proxy the call to it.

use bytes::Bytes;
use tokio::time::Instant;
use tonic::Status;
use tracing::debug;

use super::finder::TunnelFinder;
use super::forwarder::forward_stream;
use super::{agent_id_from_meta, TunnelRouter};
use crate::grpc::metadata::forwardable;
use crate::grpc::ServerStream;
use crate::metrics::{ROUTING_STATUS_ABORTED, ROUTING_STATUS_SUCCESS};
use crate::rpc_api::RpcApi;

impl TunnelRouter {
    pub(super) async fn route_to_kas(
        &self,
        stream: ServerStream<Bytes, Bytes>,
    ) -> Result<(), Status> {
        let api = RpcApi::from_extensions(&stream.extensions, &stream.info.method);
        let result = self.route_to_kas_inner(&api, stream).await;
        if let Err(status) = &result {
            api.log_status(status);
        }
        result
    }

    async fn route_to_kas_inner(
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
        let finder = TunnelFinder {
            pool: self.pool.clone(),
            querier: self.querier.clone(),
            api: api.clone(),
            own_url: self.own_url.clone(),
            agent_id,
            full_method: info.method.clone(),
            outgoing_md: forwardable(&info.metadata),
            poll_config: self.config.poll_config,
            speculation_factor: self.config.speculation_factor,
        };

        let start = Instant::now();
        let found = tokio::time::timeout(self.config.tunnel_find_timeout, finder.find(&info.ctx)).await;
        let ready = match found {
            Ok(Ok(ready)) => {
                self.metrics
                    .routing_duration(ROUTING_STATUS_SUCCESS)
                    .observe(start.elapsed().as_secs_f64());
                ready
            }
            Ok(Err(status)) => {
                self.metrics
                    .routing_duration(ROUTING_STATUS_ABORTED)
                    .observe(start.elapsed().as_secs_f64());
                return Err(status);
            }
            Err(_elapsed) => {
                self.metrics
                    .routing_duration(ROUTING_STATUS_ABORTED)
                    .observe(start.elapsed().as_secs_f64());
                self.metrics.routing_timeout.inc();
                return Err(Status::deadline_exceeded(
                    "Agent connection not found. Is agent up to date and connected?",
                ));
            }
        };
        debug!(parent: api.span(), agent_id, kas_url = %ready.kas_url, "Routing to gateway kas");

        let (peer, conn) = ready.into_parts();
        let (peer_tx, peer_rx) = peer.split();
        let result = forward_stream(api, &info.ctx, peer_tx, peer_rx, &mut incoming, &sink).await;
        conn.done();
        result
    }
}
