//! Listeners and the HTTP/2 accept loop.
//!
//! Each accepted connection gets its own [`ConnectionContext`]: a token that is
//! cancelled just before the server starts closing the connection, either
//! because the connection reached its maximum age or because the server is
//! shutting down. Long-lived handlers (agent tunnels) watch that token and
//! wind down before the transport tears their stream apart. Once the token is
//! cancelled the connection is drained with HTTP/2 GOAWAY and dropped after
//! the grace period.

use std::io;
use std::time::Duration;

use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use super::pipe::PipeListener;
use crate::config::Network;

/// Anything a connection can be served over.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Io for T {}

pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
    Pipe(PipeListener),
}

impl Listener {
    pub async fn bind(network: Network, address: &str) -> io::Result<Self> {
        match network {
            Network::Tcp => Ok(Self::Tcp(TcpListener::bind(address).await?)),
            Network::Unix => {
                // a stale socket file from a previous run blocks bind
                match std::fs::remove_file(address) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
                Ok(Self::Unix(UnixListener::bind(address)?))
            }
        }
    }

    /// Human readable address, for logs.
    pub fn local_addr(&self) -> String {
        match self {
            Self::Tcp(l) => l
                .local_addr()
                .map_or_else(|_| "tcp:?".to_string(), |a| a.to_string()),
            Self::Unix(l) => l
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_else(|| "unix:?".to_string()),
            Self::Pipe(_) => "pipe".to_string(),
        }
    }

    async fn accept(&mut self) -> io::Result<Option<Box<dyn Io>>> {
        match self {
            Self::Tcp(l) => {
                let (stream, _) = l.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Some(Box::new(stream)))
            }
            Self::Unix(l) => {
                let (stream, _) = l.accept().await?;
                Ok(Some(Box::new(stream)))
            }
            Self::Pipe(l) => Ok(l.accept().await.map(|s| Box::new(s) as Box<dyn Io>)),
        }
    }
}

/// Connection-scoped cancellation, visible to handlers via request extensions.
#[derive(Debug, Clone)]
pub struct ConnectionContext(CancellationToken);

impl ConnectionContext {
    pub fn token(&self) -> &CancellationToken {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct ServeOptions {
    /// Server name, for logs.
    pub name: &'static str,
    pub max_connection_age: Option<Duration>,
    pub grace_period: Duration,
}

/// Serve `router` until `shutdown` is cancelled, then drain connections for at
/// most the grace period.
pub async fn serve(
    mut listener: Listener,
    router: Router,
    opts: ServeOptions,
    shutdown: CancellationToken,
) {
    info!(server = opts.name, address = %listener.local_addr(), "Listening");
    let connections = TaskTracker::new();
    loop {
        let io = tokio::select! {
            () = shutdown.cancelled() => break,
            res = listener.accept() => match res {
                Ok(Some(io)) => io,
                Ok(None) => break,
                Err(e) => {
                    warn!(server = opts.name, error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
        };
        connections.spawn(serve_connection(
            io,
            router.clone(),
            opts.clone(),
            shutdown.clone(),
        ));
    }
    connections.close();
    // every connection enforces the grace period itself; this is a backstop
    let drain = opts.grace_period + Duration::from_secs(1);
    if tokio::time::timeout(drain, connections.wait()).await.is_err() {
        warn!(server = opts.name, "Connections did not drain in time");
    }
    info!(server = opts.name, "Stopped");
}

async fn serve_connection(
    io: Box<dyn Io>,
    router: Router,
    opts: ServeOptions,
    shutdown: CancellationToken,
) {
    let aux = CancellationToken::new();
    let conn_ctx = ConnectionContext(aux.clone());
    let svc = router.map_request(move |mut req: http::Request<Incoming>| {
        req.extensions_mut().insert(conn_ctx.clone());
        req
    });
    let conn = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(io), TowerToHyperService::new(svc));
    tokio::pin!(conn);

    let max_age = opts.max_connection_age.map(jitter);
    let age = async move {
        match max_age {
            Some(age) => tokio::time::sleep(age).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(age);

    tokio::select! {
        res = conn.as_mut() => {
            if let Err(e) = res {
                debug!(server = opts.name, error = %e, "Connection closed with error");
            }
            return;
        }
        () = &mut age => debug!(server = opts.name, "Max connection age reached"),
        () = shutdown.cancelled() => {}
    }

    aux.cancel();
    conn.as_mut().graceful_shutdown();
    match tokio::time::timeout(opts.grace_period, conn).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(server = opts.name, error = %e, "Connection drain failed"),
        Err(_) => debug!(server = opts.name, "Grace period elapsed, dropping connection"),
    }
}

/// Spread connection recycling by +-10% so a fleet of agents that connected at
/// once does not reconnect at once.
fn jitter(age: Duration) -> Duration {
    age.mul_f64(rand::thread_rng().gen_range(0.9..1.1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_secs(100);
        for _ in 0..100 {
            let j = jitter(base);
            assert!(j >= Duration::from_secs(90) && j <= Duration::from_secs(110));
        }
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let listener = Listener::Pipe(PipeListener::new());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(serve(
            listener,
            Router::new(),
            ServeOptions {
                name: "test",
                max_connection_age: None,
                grace_period: Duration::from_millis(10),
            },
            shutdown.clone(),
        ));
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
