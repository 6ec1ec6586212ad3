//! Client-side bidi streams.

use std::future::Future;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use http::uri::PathAndQuery;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::codec::Codec;
use tonic::metadata::MetadataMap;
use tonic::transport::Channel;
use tonic::{Status, Streaming};

use super::Closed;

/// Outbound buffer between the caller and the HTTP/2 body.
const SEND_BUFFER: usize = 1;

/// An open client stream. Response headers are available as soon as
/// [`ClientStream::open`] returns.
pub struct ClientStream<Req, Resp> {
    tx: Option<mpsc::Sender<Req>>,
    header: MetadataMap,
    inbound: Streaming<Resp>,
}

/// Response headers and the receiving half of a call made with
/// [`ClientStream::start`].
pub type PendingResponse<Resp> =
    BoxFuture<'static, Result<(MetadataMap, ClientReceiver<Resp>), Status>>;

/// Sending half after [`ClientStream::split`].
pub struct ClientSender<Req> {
    tx: Option<mpsc::Sender<Req>>,
}

/// Receiving half after [`ClientStream::split`].
pub struct ClientReceiver<Resp> {
    inbound: Streaming<Resp>,
}

impl<Req, Resp> ClientStream<Req, Resp>
where
    Req: Send + Sync + 'static,
    Resp: Send + Sync + 'static,
{
    /// Start a call to `path` and wait for response headers.
    ///
    /// A trailers-only response (the server failed before sending headers)
    /// surfaces here as the error.
    pub async fn open<C>(
        channel: Channel,
        path: &str,
        metadata: MetadataMap,
        codec: C,
    ) -> Result<Self, Status>
    where
        C: Codec<Encode = Req, Decode = Resp> + Send + 'static,
    {
        let (sender, pending) = Self::start(channel, path, metadata, codec)?;
        let (header, receiver) = pending.await?;
        Ok(Self {
            tx: sender.tx,
            header,
            inbound: receiver.inbound,
        })
    }

    /// Start a call to `path` without waiting for response headers.
    ///
    /// Messages can be sent right away; they flow once the returned response
    /// future is being polled. Use this when the server may wait for request
    /// messages before it answers.
    pub fn start<C>(
        channel: Channel,
        path: &str,
        metadata: MetadataMap,
        codec: C,
    ) -> Result<(ClientSender<Req>, PendingResponse<Resp>), Status>
    where
        C: Codec<Encode = Req, Decode = Resp> + Send + 'static,
    {
        let path = PathAndQuery::try_from(path)
            .map_err(|e| Status::internal(format!("invalid method path {path}: {e}")))?;
        let (tx, rx) = mpsc::channel(SEND_BUFFER);
        let response = async move {
            let mut grpc = tonic::client::Grpc::new(channel);
            grpc.ready()
                .await
                .map_err(|e| Status::unavailable(format!("connection not ready: {e}")))?;
            let mut request = tonic::Request::new(ReceiverStream::new(rx));
            *request.metadata_mut() = metadata;
            let response = grpc.streaming(request, path, codec).await?;
            let (header, inbound, _) = response.into_parts();
            Ok((header, ClientReceiver { inbound }))
        };
        Ok((ClientSender { tx: Some(tx) }, response.boxed()))
    }

    pub fn header(&self) -> &MetadataMap {
        &self.header
    }

    pub fn send(&self, msg: Req) -> impl Future<Output = Result<(), Closed>> + '_ {
        send(self.tx.as_ref(), msg)
    }

    /// Half-close: the server sees end of stream after already-sent messages.
    pub fn close_send(&mut self) {
        self.tx = None;
    }

    pub async fn recv(&mut self) -> Result<Option<Resp>, Status> {
        self.inbound.message().await
    }

    /// Trailing metadata. Only meaningful after [`Self::recv`] returned `Ok(None)`.
    pub async fn trailers(&mut self) -> Result<MetadataMap, Status> {
        Ok(self.inbound.trailers().await?.unwrap_or_default())
    }

    pub fn split(self) -> (ClientSender<Req>, ClientReceiver<Resp>) {
        (
            ClientSender { tx: self.tx },
            ClientReceiver {
                inbound: self.inbound,
            },
        )
    }
}

impl<Req> ClientSender<Req> {
    pub async fn send(&self, msg: Req) -> Result<(), Closed> {
        send(self.tx.as_ref(), msg).await
    }

    pub fn close_send(&mut self) {
        self.tx = None;
    }
}

impl<Resp> ClientReceiver<Resp> {
    pub async fn recv(&mut self) -> Result<Option<Resp>, Status> {
        self.inbound.message().await
    }

    pub async fn trailers(&mut self) -> Result<MetadataMap, Status> {
        Ok(self.inbound.trailers().await?.unwrap_or_default())
    }
}

async fn send<Req>(tx: Option<&mpsc::Sender<Req>>, msg: Req) -> Result<(), Closed> {
    match tx {
        Some(tx) => tx.send(msg).await.map_err(|_| Closed),
        None => Err(Closed),
    }
}

/// Raw-frame client stream, as used on every proxy hop.
pub type RawClientStream = ClientStream<Bytes, Bytes>;
