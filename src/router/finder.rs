//! Finding a kas instance that holds a tunnel to an agent.
//!
//! The finder tries its own kas first, then every kas the directory reports
//! for the agent, at most `speculation_factor` new ones per poll cycle. Each
//! attempt opens the routed method on the peer and waits for `tunnel_ready`.
//! The first attempt to get one commits: every other attempt is cancelled and
//! `StartStreaming` goes to the winner. If that send fails the attempt backs
//! off and the search goes on.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataMap;
use tonic::Status;
use tracing::debug;

use super::gateway_response::Msg;
use super::{GatewayResponse, StartStreaming};
use crate::grpc::client::RawClientStream;
use crate::grpc::codec::{decode, encode};
use crate::grpc::pool::{KasPool, PoolConn};
use crate::retry::{Attempt, PollConfig, Poller};
use crate::rpc_api::RpcApi;
use crate::tunnel::AggregatingQuerier;

/// A gateway that has accepted `StartStreaming`. The call goes on over
/// `stream`; dropping this releases the pooled connection.
pub struct ReadyTunnel {
    pub kas_url: String,
    pub stream: RawClientStream,
    conn: PoolConn,
}

impl ReadyTunnel {
    pub fn into_parts(self) -> (RawClientStream, PoolConn) {
        (self.stream, self.conn)
    }
}

#[derive(Default)]
struct FinderState {
    committed: bool,
    attempts: HashMap<String, CancellationToken>,
}

struct Shared {
    pool: Arc<dyn KasPool>,
    api: RpcApi,
    agent_id: i64,
    full_method: String,
    outgoing_md: MetadataMap,
    poll_config: PollConfig,
    state: Mutex<FinderState>,
    found_tx: mpsc::Sender<ReadyTunnel>,
}

enum Outcome {
    Ready(RawClientStream, PoolConn),
    Retry,
    Cancelled,
}

pub struct TunnelFinder {
    pub pool: Arc<dyn KasPool>,
    pub querier: Arc<AggregatingQuerier>,
    pub api: RpcApi,
    pub own_url: String,
    pub agent_id: i64,
    pub full_method: String,
    pub outgoing_md: MetadataMap,
    pub poll_config: PollConfig,
    pub speculation_factor: usize,
}

impl TunnelFinder {
    /// Search until a gateway is committed or `ctx` is cancelled. Dropping the
    /// returned future stops every attempt.
    pub async fn find(self, ctx: &CancellationToken) -> Result<ReadyTunnel, Status> {
        let find_ctx = ctx.child_token();
        let _stop = find_ctx.clone().drop_guard();
        let (found_tx, mut found_rx) = mpsc::channel(1);
        let shared = Arc::new(Shared {
            pool: self.pool,
            api: self.api,
            agent_id: self.agent_id,
            full_method: self.full_method,
            outgoing_md: self.outgoing_md,
            poll_config: self.poll_config,
            state: Mutex::new(FinderState::default()),
            found_tx,
        });

        shared.start_attempt(&find_ctx, &self.own_url);

        let querier = self.querier;
        let speculation_factor = self.speculation_factor;
        let poll_shared = shared.clone();
        let poll_ctx = find_ctx.clone();
        tokio::spawn(async move {
            let mut started_this_cycle = 0;
            querier
                .poll_kas_urls_by_agent_id(&poll_ctx, poll_shared.agent_id, |new_cycle, url| {
                    if new_cycle {
                        started_this_cycle = 0;
                    }
                    if started_this_cycle >= speculation_factor {
                        return false;
                    }
                    if poll_shared.start_attempt(&poll_ctx, url) {
                        started_this_cycle += 1;
                    }
                    false
                })
                .await;
        });

        tokio::select! {
            () = ctx.cancelled() => Err(Status::cancelled("request cancelled while looking for a tunnel")),
            found = found_rx.recv() => {
                found.ok_or_else(|| Status::unavailable("tunnel finder stopped"))
            }
        }
    }
}

impl Shared {
    /// Start trying `url` unless it is already being tried or a gateway has
    /// been committed.
    fn start_attempt(self: &Arc<Self>, find_ctx: &CancellationToken, url: &str) -> bool {
        let attempt_ctx = {
            let mut state = self.state.lock();
            if state.committed || state.attempts.contains_key(url) {
                return false;
            }
            let attempt_ctx = find_ctx.child_token();
            state.attempts.insert(url.to_string(), attempt_ctx.clone());
            attempt_ctx
        };
        let shared = self.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            shared.try_kas(&url, &attempt_ctx).await;
            shared.state.lock().attempts.remove(&url);
        });
        true
    }

    async fn try_kas(&self, url: &str, ctx: &CancellationToken) {
        let mut poller = Poller::new(self.poll_config);
        loop {
            let attempt = match self.attempt(url, ctx).await {
                Outcome::Ready(stream, conn) => {
                    if self.commit(url, stream, conn).await {
                        return;
                    }
                    Attempt::Backoff
                }
                Outcome::Retry => Attempt::Backoff,
                Outcome::Cancelled => return,
            };
            if !poller.next(ctx, attempt).await {
                return;
            }
        }
    }

    /// Open the routed method on `url` and wait for the gateway to report a
    /// tunnel.
    async fn attempt(&self, url: &str, ctx: &CancellationToken) -> Outcome {
        let conn = tokio::select! {
            () = ctx.cancelled() => return Outcome::Cancelled,
            conn = self.pool.dial(url) => match conn {
                Ok(conn) => conn,
                Err(e) => {
                    self.api.handle_processing_error(self.agent_id, "Failed to dial kas", &e);
                    return Outcome::Retry;
                }
            },
        };
        let mut stream = tokio::select! {
            () = ctx.cancelled() => return Outcome::Cancelled,
            stream = conn.open_stream(&self.full_method, self.outgoing_md.clone()) => match stream {
                Ok(stream) => stream,
                Err(e) => {
                    self.api.handle_processing_error(self.agent_id, "Failed to open new stream to kas", &e);
                    return Outcome::Retry;
                }
            },
        };
        loop {
            let frame = tokio::select! {
                () = ctx.cancelled() => return Outcome::Cancelled,
                frame = stream.recv() => frame,
            };
            let frame = match frame {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!(parent: self.api.span(), kas_url = url, "Gateway kas closed the stream before a tunnel was ready");
                    return Outcome::Retry;
                }
                Err(e) => {
                    self.api.handle_processing_error(self.agent_id, "Failed to read response from kas", &e);
                    return Outcome::Retry;
                }
            };
            match decode::<GatewayResponse>(frame).map(|r| r.msg) {
                Ok(Some(Msg::TunnelReady(_))) => return Outcome::Ready(stream, conn),
                Ok(Some(Msg::NoTunnel(_))) => {
                    debug!(parent: self.api.span(), kas_url = url, "Gateway kas has no tunnel yet");
                }
                Ok(_) => {
                    self.api.handle_processing_error(
                        self.agent_id,
                        "Unexpected GatewayResponse before tunnel_ready",
                        &url,
                    );
                    return Outcome::Retry;
                }
                Err(e) => {
                    self.api.handle_processing_error(self.agent_id, "Invalid GatewayResponse", &e);
                    return Outcome::Retry;
                }
            }
        }
    }

    /// Claim the search for `url`. Returns `false` if the gateway could not be
    /// started; the search is then open again.
    async fn commit(&self, url: &str, mut stream: RawClientStream, conn: PoolConn) -> bool {
        {
            let mut state = self.state.lock();
            if state.committed {
                return true;
            }
            state.committed = true;
            for (other, ctx) in &state.attempts {
                if other != url {
                    ctx.cancel();
                }
            }
        }
        if stream.send(encode(&StartStreaming {})).await.is_err() {
            // the send half is gone, the real reason is on the receive half
            let err = match stream.recv().await {
                Err(e) => e.to_string(),
                Ok(_) => "stream closed".to_string(),
            };
            self.api.handle_processing_error(self.agent_id, "SendMsg(StartStreaming) failed", &err);
            self.state.lock().committed = false;
            return false;
        }
        let _ = self
            .found_tx
            .send(ReadyTunnel {
                kas_url: url.to_string(),
                stream,
                conn,
            })
            .await;
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use tonic::transport::Channel;

    use super::*;
    use crate::errors::Error;
    use crate::grpc::metadata::ROUTING_AGENT_ID_KEY;
    use crate::grpc::server::handler;
    use crate::grpc::ServerStream;
    use crate::router::{MethodTable, NoTunnel, TunnelReady};
    use crate::testing;
    use crate::tunnel::Querier;

    /// Pool with one pipe server per URL; unknown URLs fail to dial.
    struct FakePool {
        channels: HashMap<String, Channel>,
        dials: AtomicUsize,
    }

    #[async_trait]
    impl KasPool for FakePool {
        async fn dial(&self, url: &str) -> Result<PoolConn, Error> {
            self.dials.fetch_add(1, Ordering::Relaxed);
            self.channels
                .get(url)
                .map(|ch| PoolConn::unpooled(ch.clone(), None))
                .ok_or_else(|| Error::invalid_url(url, "unknown"))
        }
    }

    struct FixedQuerier(Vec<String>);

    #[async_trait]
    impl Querier for FixedQuerier {
        async fn kas_urls_by_agent_id(
            &self,
            _agent_id: i64,
            cb: &mut (dyn FnMut(String) -> bool + Send),
        ) -> Result<(), Error> {
            for url in &self.0 {
                if cb(url.clone()) {
                    break;
                }
            }
            Ok(())
        }
    }

    #[derive(Clone, Copy)]
    enum Gateway {
        /// `no_tunnel`, then `tunnel_ready` after a delay.
        ReadyAfter(Duration),
        NeverReady,
    }

    /// Gateway that answers `StartStreaming` with one header frame.
    fn gateway(kind: Gateway, started: Arc<AtomicUsize>) -> axum::Router {
        let table = MethodTable::new(&[testing::testing_service_config()]);
        table.routes(handler(move |mut stream: ServerStream<Bytes, Bytes>| {
            let started = started.clone();
            async move {
                let send = |msg| stream.sink.send(encode(&GatewayResponse::new(msg)));
                send(Msg::NoTunnel(NoTunnel {})).await.ok();
                match kind {
                    Gateway::ReadyAfter(d) => tokio::time::sleep(d).await,
                    Gateway::NeverReady => std::future::pending::<()>().await,
                }
                send(Msg::TunnelReady(TunnelReady {})).await.ok();
                if let Some(frame) = stream.incoming.recv().await? {
                    decode::<StartStreaming>(frame)?;
                    started.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            }
        }))
    }

    fn serve_gateway(kind: Gateway, started: Arc<AtomicUsize>) -> Channel {
        testing::serve_pipe(gateway(kind, started), CancellationToken::new())
    }

    fn finder(pool: Arc<FakePool>, urls: Vec<String>, speculation_factor: usize) -> TunnelFinder {
        let querier = Arc::new(AggregatingQuerier::new(
            Arc::new(FixedQuerier(urls)),
            PollConfig::new(Duration::from_millis(100)),
            Duration::from_secs(10),
        ));
        TunnelFinder {
            pool,
            querier,
            api: RpcApi::new(testing::REQUEST_RESPONSE),
            own_url: "grpc://own".to_string(),
            agent_id: 1,
            full_method: testing::REQUEST_RESPONSE.to_string(),
            outgoing_md: testing::md(&[(ROUTING_AGENT_ID_KEY, "1")]),
            poll_config: PollConfig::new(Duration::from_millis(100)),
            speculation_factor,
        }
    }

    #[tokio::test]
    async fn test_fastest_gateway_wins_and_others_are_cancelled() {
        let started = Arc::new(AtomicUsize::new(0));
        let mut channels = HashMap::new();
        channels.insert(
            "grpc://own".to_string(),
            serve_gateway(Gateway::NeverReady, started.clone()),
        );
        channels.insert(
            "grpc://slow".to_string(),
            serve_gateway(Gateway::ReadyAfter(Duration::from_secs(2)), started.clone()),
        );
        channels.insert(
            "grpc://fast".to_string(),
            serve_gateway(Gateway::ReadyAfter(Duration::from_millis(50)), started.clone()),
        );
        let pool = Arc::new(FakePool {
            channels,
            dials: AtomicUsize::new(0),
        });
        let f = finder(
            pool,
            vec!["grpc://slow".to_string(), "grpc://fast".to_string()],
            3,
        );
        let ctx = CancellationToken::new();
        let ready = tokio::time::timeout(Duration::from_secs(5), f.find(&ctx))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ready.kas_url, "grpc://fast");
        drop(ready);
        tokio::time::sleep(Duration::from_secs(3)).await;
        // the slow gateway never got StartStreaming
        assert_eq!(started.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_speculation_factor_limits_attempts_per_cycle() {
        let started = Arc::new(AtomicUsize::new(0));
        let mut channels = HashMap::new();
        for url in ["grpc://own", "grpc://a", "grpc://b", "grpc://c"] {
            channels.insert(
                url.to_string(),
                serve_gateway(Gateway::NeverReady, started.clone()),
            );
        }
        let pool = Arc::new(FakePool {
            channels,
            dials: AtomicUsize::new(0),
        });
        let urls = vec![
            "grpc://a".to_string(),
            "grpc://b".to_string(),
            "grpc://c".to_string(),
        ];
        let f = finder(pool.clone(), urls, 1);
        let ctx = CancellationToken::new();
        let res = tokio::time::timeout(Duration::from_millis(150), f.find(&ctx)).await;
        assert!(res.is_err());
        // own url plus one per cycle; at most two cycles have run
        let dials = pool.dials.load(Ordering::Relaxed);
        assert!((2..=3).contains(&dials), "{dials}");
    }

    #[tokio::test]
    async fn test_cancelled_caller() {
        let pool = Arc::new(FakePool {
            channels: HashMap::new(),
            dials: AtomicUsize::new(0),
        });
        let f = finder(pool, vec![], 3);
        let ctx = CancellationToken::new();
        ctx.cancel();
        let err = f.find(&ctx).await.err().unwrap();
        assert_eq!(err.code(), tonic::Code::Cancelled);
    }

}
