//! Tunnels held by this instance.
//!
//! An agent's `Connect` call parks its tunnel here and waits. A request for
//! that agent takes the tunnel out with [`Registry::find_tunnel`], uses it for
//! exactly one request and gives it back through [`Tunnel::done`]. If no
//! tunnel fits when the request arrives, the request is queued and satisfied
//! by the next tunnel that registers.
//!
//! Tunnel state transitions, all under one lock:
//!
//! ```text
//! Ready --find--> Found --forward--> Forwarding --done--> Done
//!   ^               |
//!   +-----done------+
//! ```
//!
//! When the agent's stream ends, a `Ready` tunnel is withdrawn and a `Found`
//! one loses its state so that forwarding fails without touching the stream.
//! `Forwarding` and `Done` tunnels finish the request first.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future;
use parking_lot::Mutex;
use prometheus::IntGauge;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, info, warn};

use super::rpc::{connect_request, ConnectRequest, ConnectResponse};
use super::tracker::Registerer;
use super::tunnel::{State, Tunnel};
use crate::grpc::ServerStream;
use crate::redistool::IoFunc;
use crate::rpc_api::RpcApi;

struct FindRequest {
    service: String,
    method: String,
    tx: oneshot::Sender<Tunnel>,
}

#[derive(Default)]
struct Inner {
    /// Parked tunnels by agent id, then connection id.
    tunnels: HashMap<i64, HashMap<u64, Tunnel>>,
    find_requests: HashMap<i64, HashMap<u64, FindRequest>>,
    states: HashMap<u64, State>,
    stopped: bool,
}

pub(crate) struct Shared {
    inner: Mutex<Inner>,
    registerer: Arc<dyn Registerer>,
    registrations: IntGauge,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct Registry {
    shared: Arc<Shared>,
}

/// A pending or satisfied tunnel lookup. Dropping the handle cancels the
/// lookup; a tunnel that arrives after that goes back to the registry.
pub struct FindHandle {
    shared: Arc<Shared>,
    agent_id: i64,
    request_id: Option<u64>,
    rx: Option<oneshot::Receiver<Tunnel>>,
}

enum OnContextDone {
    Withdraw(Tunnel, IoFunc),
    Return,
    Wait,
}

impl Registry {
    pub fn new(registerer: Arc<dyn Registerer>, registrations: IntGauge) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                registerer,
                registrations,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Serve one agent `Connect` call until the agent goes away, the tunnel
    /// has been used, or the registry stops.
    pub async fn handle_tunnel(
        &self,
        api: &RpcApi,
        agent_id: i64,
        stream: ServerStream<ConnectRequest, ConnectResponse>,
    ) -> Result<(), Status> {
        let ServerStream {
            info,
            mut incoming,
            sink,
            ..
        } = stream;
        let descriptor = match incoming.recv().await {
            Ok(Some(ConnectRequest {
                msg: Some(connect_request::Msg::Descriptor(d)),
            })) => d.agent_descriptor.unwrap_or_default(),
            Ok(Some(_)) => return Err(Status::invalid_argument("Invalid oneof value type")),
            Ok(None) => return Err(Status::invalid_argument("Expecting descriptor, got EOF")),
            Err(e) => return Err(api.handle_io_error("Recv(ConnectRequest_Descriptor)", &e)),
        };
        let connection_id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (ret_tx, mut ret_rx) = oneshot::channel();
        let tunnel = Tunnel::new(
            connection_id,
            agent_id,
            descriptor,
            incoming,
            sink,
            ret_tx,
            self.shared.clone(),
        );
        debug!(parent: api.span(), agent_id, connection_id, "Tunnel connected");

        let io = {
            let mut inner = self.shared.inner.lock();
            if inner.stopped {
                return Ok(());
            }
            self.shared.register_locked(&mut inner, tunnel)
        };
        if let Some(io) = io {
            if let Err(e) = io.await {
                api.handle_processing_error(agent_id, "Failed to register tunnel", &e);
            }
        }

        let aux = info.aux_ctx.unwrap_or_default();
        let finished = tokio::select! {
            res = &mut ret_rx => Some(res.unwrap_or(Ok(()))),
            () = info.ctx.cancelled() => None,
            () = aux.cancelled() => None,
        };
        let result = match finished {
            Some(result) => result,
            None => self.on_context_done(api, agent_id, connection_id, ret_rx).await,
        };
        self.shared.inner.lock().states.remove(&connection_id);
        debug!(parent: api.span(), agent_id, connection_id, "Tunnel disconnected");
        result
    }

    async fn on_context_done(
        &self,
        api: &RpcApi,
        agent_id: i64,
        connection_id: u64,
        ret_rx: oneshot::Receiver<Result<(), Status>>,
    ) -> Result<(), Status> {
        let next = {
            let mut inner = self.shared.inner.lock();
            match inner.states.get(&connection_id).copied() {
                Some(State::Ready) => {
                    inner.states.remove(&connection_id);
                    match self.shared.unpark_locked(&mut inner, agent_id, connection_id) {
                        Some((tunnel, io)) => OnContextDone::Withdraw(tunnel, io),
                        None => OnContextDone::Return,
                    }
                }
                Some(State::Found) => {
                    // whoever holds it fails on forward
                    inner.states.remove(&connection_id);
                    OnContextDone::Return
                }
                Some(State::Forwarding | State::Done) => OnContextDone::Wait,
                None => OnContextDone::Return,
            }
        };
        match next {
            OnContextDone::Withdraw(tunnel, io) => {
                drop(tunnel);
                if let Err(e) = io.await {
                    api.handle_processing_error(agent_id, "Failed to unregister tunnel", &e);
                }
                Ok(())
            }
            OnContextDone::Return => Ok(()),
            OnContextDone::Wait => ret_rx.await.unwrap_or(Ok(())),
        }
    }

    /// Take a parked tunnel of `agent_id` that serves `service`/`method`, or
    /// queue a request for one. Returns whether a tunnel was available right
    /// away; either way the tunnel is obtained with [`FindHandle::get`].
    pub async fn find_tunnel(&self, agent_id: i64, service: &str, method: &str) -> (bool, FindHandle) {
        let (tx, rx) = oneshot::channel();
        let mut handle = FindHandle {
            shared: self.shared.clone(),
            agent_id,
            request_id: None,
            rx: Some(rx),
        };
        let io = {
            let mut inner = self.shared.inner.lock();
            if inner.stopped {
                // tx dropped, get() reports shutdown
                return (false, handle);
            }
            let candidate = inner.tunnels.get(&agent_id).and_then(|tunnels| {
                tunnels
                    .iter()
                    .find(|(_, t)| t.descriptor.supports_service_and_method(service, method))
                    .map(|(id, _)| *id)
            });
            match candidate {
                Some(connection_id) => self
                    .shared
                    .unpark_locked(&mut inner, agent_id, connection_id)
                    .map(|(tunnel, io)| {
                        inner.states.insert(connection_id, State::Found);
                        let _ = tx.send(tunnel);
                        io
                    }),
                None => {
                    let request_id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
                    inner.find_requests.entry(agent_id).or_default().insert(
                        request_id,
                        FindRequest {
                            service: service.to_string(),
                            method: method.to_string(),
                            tx,
                        },
                    );
                    handle.request_id = Some(request_id);
                    None
                }
            }
        };
        let found = io.is_some();
        if let Some(io) = io {
            if let Err(e) = io.await {
                warn!(agent_id, error = %e, "Failed to unregister tunnel");
            }
        }
        (found, handle)
    }

    /// Fail every queued lookup and release every parked tunnel. Agents see
    /// their `Connect` call end cleanly and reconnect elsewhere.
    pub async fn stop(&self) {
        let (ios, requests, tunnels) = {
            let mut inner = self.shared.inner.lock();
            inner.stopped = true;
            let requests: usize = inner.find_requests.drain().map(|(_, r)| r.len()).sum();
            let parked: Vec<Tunnel> = inner
                .tunnels
                .drain()
                .flat_map(|(_, tunnels)| tunnels.into_values())
                .collect();
            let mut ios = Vec::with_capacity(parked.len());
            let tunnels = parked.len();
            for mut tunnel in parked {
                inner.states.insert(tunnel.connection_id, State::Done);
                self.shared.registrations.dec();
                ios.push(self.shared.registerer.unregister_tunnel(tunnel.agent_id));
                tunnel.finish(Ok(()));
            }
            (ios, requests, tunnels)
        };
        for res in future::join_all(ios).await {
            if let Err(e) = res {
                warn!(error = %e, "Failed to unregister tunnel");
            }
        }
        info!(requests, tunnels, "Tunnel registry stopped");
    }

    /// Parked tunnels, for tests and diagnostics.
    pub fn parked(&self, agent_id: i64) -> usize {
        self.shared
            .inner
            .lock()
            .tunnels
            .get(&agent_id)
            .map_or(0, HashMap::len)
    }
}

impl Shared {
    /// Hand `tunnel` to a waiting request that it can serve, or park it.
    fn register_locked(&self, inner: &mut Inner, mut tunnel: Tunnel) -> Option<IoFunc> {
        let agent_id = tunnel.agent_id;
        let connection_id = tunnel.connection_id;
        loop {
            let Some(requests) = inner.find_requests.get_mut(&agent_id) else {
                break;
            };
            let matching = requests
                .iter()
                .find(|(_, r)| {
                    tunnel
                        .descriptor
                        .supports_service_and_method(&r.service, &r.method)
                })
                .map(|(id, _)| *id);
            let Some(request) = matching.and_then(|id| requests.remove(&id)) else {
                break;
            };
            if requests.is_empty() {
                inner.find_requests.remove(&agent_id);
            }
            inner.states.insert(connection_id, State::Found);
            match request.tx.send(tunnel) {
                Ok(()) => return None,
                // requester gone, try the next one
                Err(t) => tunnel = t,
            }
        }
        inner.states.insert(connection_id, State::Ready);
        inner
            .tunnels
            .entry(agent_id)
            .or_default()
            .insert(connection_id, tunnel);
        self.registrations.inc();
        Some(self.registerer.register_tunnel(agent_id))
    }

    fn unpark_locked(
        &self,
        inner: &mut Inner,
        agent_id: i64,
        connection_id: u64,
    ) -> Option<(Tunnel, IoFunc)> {
        let tunnels = inner.tunnels.get_mut(&agent_id)?;
        let tunnel = tunnels.remove(&connection_id)?;
        if tunnels.is_empty() {
            inner.tunnels.remove(&agent_id);
        }
        self.registrations.dec();
        Some((tunnel, self.registerer.unregister_tunnel(agent_id)))
    }

    pub(crate) fn on_forward(&self, connection_id: u64) -> Result<(), Status> {
        let mut inner = self.inner.lock();
        match inner.states.get_mut(&connection_id) {
            Some(state @ State::Found) => {
                *state = State::Forwarding;
                Ok(())
            }
            None => Err(Status::cancelled("Connect(): context done")),
            Some(state) => Err(Status::internal(format!(
                "Forward from invalid tunnel state: {state:?}"
            ))),
        }
    }

    pub(crate) async fn on_tunnel_done(&self, tunnel: Tunnel) {
        let connection_id = tunnel.connection_id;
        let agent_id = tunnel.agent_id;
        let io = {
            let mut inner = self.inner.lock();
            match inner.states.get(&connection_id).copied() {
                Some(State::Found) if !inner.stopped => self.register_locked(&mut inner, tunnel),
                Some(State::Forwarding) => {
                    inner.states.insert(connection_id, State::Done);
                    None
                }
                _ => None,
            }
        };
        if let Some(io) = io {
            if let Err(e) = io.await {
                warn!(agent_id, error = %e, "Failed to register tunnel");
            }
        }
    }
}

impl FindHandle {
    /// Wait for the tunnel.
    pub async fn get(&mut self, ctx: &CancellationToken) -> Result<Tunnel, Status> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(Status::internal("tunnel already taken"));
        };
        let res = tokio::select! {
            () = ctx.cancelled() => return Err(Status::cancelled("FindTunnel request aborted")),
            res = rx => res,
        };
        self.rx = None;
        self.request_id = None;
        res.map_err(|_| Status::unavailable("kas is shutting down"))
    }
}

impl Drop for FindHandle {
    fn drop(&mut self) {
        if let Some(request_id) = self.request_id.take() {
            let mut inner = self.shared.inner.lock();
            if let Some(requests) = inner.find_requests.get_mut(&self.agent_id) {
                requests.remove(&request_id);
                if requests.is_empty() {
                    inner.find_requests.remove(&self.agent_id);
                }
            }
        }
        // a tunnel may have been handed over before the request was removed
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        if let Ok(tunnel) = rx.try_recv() {
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(tunnel.done());
            }
        }
    }
}
