//! Connection pool to peer kas instances.
//!
//! Connections are keyed by URL and shared by every caller dialing that URL.
//! A [`PoolConn`] is a reference; dropping it (or calling
//! [`PoolConn::done`]) releases it. Connections nobody uses are closed once
//! they have been idle for the configured timeout.
//!
//! Supported URLs: `grpc://host:port` (cleartext HTTP/2), `grpcs://host:port`
//! (TLS, native roots) and `unix:///path`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::net::UnixStream;
use tokio::time::Instant;
use tonic::metadata::MetadataMap;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint, Uri};
use tonic::Status;
use tracing::{debug, warn};

use super::client::RawClientStream;
use super::jwt::JwtSigner;
use super::RawCodec;
use crate::errors::Error;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(55);

/// Something that hands out connections to kas URLs.
#[async_trait]
pub trait KasPool: Send + Sync {
    async fn dial(&self, url: &str) -> Result<PoolConn, Error>;
}

/// One use of a pooled connection.
pub struct PoolConn {
    channel: Channel,
    signer: Option<Arc<JwtSigner>>,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl PoolConn {
    /// A connection that is not owned by any pool.
    pub fn unpooled(channel: Channel, signer: Option<Arc<JwtSigner>>) -> Self {
        Self {
            channel,
            signer,
            release: None,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    /// Open a raw bidi stream to `path` with `metadata`, adding a fresh JWT.
    pub async fn open_stream(
        &self,
        path: &str,
        mut metadata: MetadataMap,
    ) -> Result<RawClientStream, Status> {
        if let Some(signer) = &self.signer {
            signer.authorize(&mut metadata)?;
        }
        RawClientStream::open(self.channel.clone(), path, metadata, RawCodec).await
    }

    /// Release this connection back to the pool.
    pub fn done(self) {}
}

impl Drop for PoolConn {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

struct Entry {
    channel: Channel,
    users: usize,
    last_used: Instant,
}

struct PoolInner {
    conns: Mutex<HashMap<String, Entry>>,
    signer: Option<Arc<JwtSigner>>,
    idle_timeout: Duration,
}

impl PoolInner {
    fn release(&self, url: &str) {
        let mut conns = self.conns.lock();
        if let Some(entry) = conns.get_mut(url) {
            entry.users = entry.users.saturating_sub(1);
            entry.last_used = Instant::now();
        }
        Self::evict_idle_locked(&mut conns, self.idle_timeout);
    }

    fn evict_idle_locked(conns: &mut HashMap<String, Entry>, idle_timeout: Duration) {
        let now = Instant::now();
        conns.retain(|url, entry| {
            let keep = entry.users > 0 || now.duration_since(entry.last_used) < idle_timeout;
            if !keep {
                debug!(kas_url = %url, "Closing idle connection");
            }
            keep
        });
    }
}

/// Reference-counted pool of peer connections.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    pub fn new(signer: Option<Arc<JwtSigner>>, idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                conns: Mutex::new(HashMap::new()),
                signer,
                idle_timeout,
            }),
        }
    }

    /// Close connections that have been idle for too long.
    pub fn sweep(&self) {
        let mut conns = self.inner.conns.lock();
        PoolInner::evict_idle_locked(&mut conns, self.inner.idle_timeout);
    }

    /// Close every connection. Connections still in use are reported.
    pub fn close(&self) {
        let mut conns = self.inner.conns.lock();
        for (url, entry) in conns.iter() {
            if entry.users > 0 {
                warn!(kas_url = %url, users = entry.users, "Closing connection that is still in use");
            }
        }
        conns.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.conns.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn checkout(&self, url: &str) -> Result<PoolConn, Error> {
        let channel = {
            let mut conns = self.inner.conns.lock();
            if let Some(entry) = conns.get_mut(url) {
                entry.users += 1;
                entry.last_used = Instant::now();
                entry.channel.clone()
            } else {
                let channel = channel_for_url(url, None)?;
                conns.insert(
                    url.to_string(),
                    Entry {
                        channel: channel.clone(),
                        users: 1,
                        last_used: Instant::now(),
                    },
                );
                channel
            }
        };
        let inner = self.inner.clone();
        let key = url.to_string();
        Ok(PoolConn {
            channel,
            signer: self.inner.signer.clone(),
            release: Some(Box::new(move || inner.release(&key))),
        })
    }
}

#[async_trait]
impl KasPool for Pool {
    async fn dial(&self, url: &str) -> Result<PoolConn, Error> {
        self.checkout(url)
    }
}

/// Routes dials of this instance's own URL to an in-process connection.
pub struct SelfPool {
    delegate: Arc<dyn KasPool>,
    own_url: String,
    own_channel: Channel,
    signer: Option<Arc<JwtSigner>>,
}

impl SelfPool {
    pub fn new(
        delegate: Arc<dyn KasPool>,
        own_url: String,
        own_channel: Channel,
        signer: Option<Arc<JwtSigner>>,
    ) -> Self {
        Self {
            delegate,
            own_url,
            own_channel,
            signer,
        }
    }
}

#[async_trait]
impl KasPool for SelfPool {
    async fn dial(&self, url: &str) -> Result<PoolConn, Error> {
        if url == self.own_url {
            return Ok(PoolConn::unpooled(
                self.own_channel.clone(),
                self.signer.clone(),
            ));
        }
        self.delegate.dial(url).await
    }
}

/// Build a lazily connecting channel for a kas URL.
///
/// `tls_server_name` overrides the name checked against the certificate for
/// `grpcs://` URLs.
pub fn channel_for_url(url: &str, tls_server_name: Option<&str>) -> Result<Channel, Error> {
    if let Some(path) = url.strip_prefix("unix://") {
        if path.is_empty() {
            return Err(Error::invalid_url(url, "missing socket path"));
        }
        let path = path.to_string();
        return Ok(configure(Endpoint::from_static("http://unix.local"))
            .connect_with_connector_lazy(tower::service_fn(move |_: Uri| {
                let path = path.clone();
                async move { UnixStream::connect(path).await.map(TokioIo::new) }
            })));
    }
    let uri: Uri = url
        .parse()
        .map_err(|e: http::uri::InvalidUri| Error::invalid_url(url, e.to_string()))?;
    match uri.scheme_str() {
        Some("grpc") => {
            let authority = authority(url, &uri)?;
            let endpoint = Endpoint::from_shared(format!("http://{authority}"))?;
            Ok(configure(endpoint).connect_lazy())
        }
        Some("grpcs") => {
            let authority = authority(url, &uri)?;
            let host = tls_server_name.unwrap_or_else(|| uri.host().unwrap_or_default());
            let tls = ClientTlsConfig::new()
                .with_native_roots()
                .domain_name(host.to_string());
            let endpoint = Endpoint::from_shared(format!("https://{authority}"))?.tls_config(tls)?;
            Ok(configure(endpoint).connect_lazy())
        }
        _ => Err(Error::invalid_url(
            url,
            "unsupported scheme, expected grpc, grpcs or unix",
        )),
    }
}

fn authority(url: &str, uri: &Uri) -> Result<String, Error> {
    let authority = uri
        .authority()
        .ok_or_else(|| Error::invalid_url(url, "missing host"))?;
    if authority.port_u16().is_none() {
        return Err(Error::invalid_url(url, "missing port"));
    }
    Ok(authority.to_string())
}

fn configure(endpoint: Endpoint) -> Endpoint {
    endpoint
        .connect_timeout(CONNECT_TIMEOUT)
        .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
        .keep_alive_while_idle(true)
}
