//! In-memory listener.
//!
//! A [`PipeListener`] accepts connections created by its [`PipeDialer`]; each
//! connection is a `tokio::io::duplex` pair. kas serves its internal server on
//! one, and tests run whole servers on them without touching the network.

use std::io;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tonic::transport::{Channel, Endpoint, Uri};

const PIPE_BUFFER: usize = 64 * 1024;

pub struct PipeListener {
    rx: mpsc::Receiver<DuplexStream>,
    dialer: PipeDialer,
}

#[derive(Clone)]
pub struct PipeDialer {
    tx: mpsc::Sender<DuplexStream>,
}

impl PipeListener {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(16);
        Self {
            rx,
            dialer: PipeDialer { tx },
        }
    }

    pub fn dialer(&self) -> PipeDialer {
        self.dialer.clone()
    }

    /// Next connection.
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        self.rx.recv().await
    }
}

impl Default for PipeListener {
    fn default() -> Self {
        Self::new()
    }
}

impl PipeDialer {
    pub async fn dial(&self) -> io::Result<DuplexStream> {
        let (client, server) = tokio::io::duplex(PIPE_BUFFER);
        self.tx.send(server).await.map_err(|_| {
            io::Error::new(io::ErrorKind::ConnectionRefused, "pipe listener closed")
        })?;
        Ok(client)
    }

    /// A lazily connecting channel whose connections are dialed on this pipe.
    pub fn channel(&self) -> Channel {
        let dialer = self.clone();
        Endpoint::from_static("http://pipe.local")
            .connect_timeout(Duration::from_secs(5))
            .connect_with_connector_lazy(tower::service_fn(move |_: Uri| {
                let dialer = dialer.clone();
                async move { dialer.dial().await.map(TokioIo::new) }
            }))
    }
}
