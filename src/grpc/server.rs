//! Streaming handlers on top of axum routes.
//!
//! Every RPC kas serves is bidirectional, including the ones declared unary by
//! their owning service. A handler receives a [`ServerStream`] and returns
//! `Result<(), Status>`. It drives the response explicitly:
//!
//! - [`ResponseSink::send_header`] sends response headers. If the handler sends
//!   a message first, empty headers go out implicitly.
//! - [`ResponseSink::send`] sends one message.
//! - [`ResponseSink::set_trailer`] accumulates trailing metadata.
//!
//! Response headers are released as soon as the handler produces any of
//! them, a message or a final status, so a client awaiting headers never
//! blocks behind request messages. A handler that fails before sending
//! headers produces a trailers-only response that carries the status
//! details.
//!
//! Routes are mounted with [`streaming_route`]. tonic's `server::Grpc` does the
//! framing; axum does the path dispatch and middleware.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::extract::Request;
use axum::response::{IntoResponse, Response};
use axum::routing::{post, MethodRouter};
use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tonic::codec::Codec;
use tonic::metadata::MetadataMap;
use tonic::server::{Grpc, StreamingService};
use tonic::{Code, Extensions, Status, Streaming};
use tracing::Instrument;

use super::metadata::merge;
use super::Closed;
use crate::grpc::listener::ConnectionContext;

/// Boxed handler body shared by every route of one kind.
pub type Handler<Req, Resp> =
    Arc<dyn Fn(ServerStream<Req, Resp>) -> BoxFuture<'static, Result<(), Status>> + Send + Sync>;

/// Wrap an async fn into a [`Handler`].
pub fn handler<Req, Resp, F, Fut>(f: F) -> Handler<Req, Resp>
where
    F: Fn(ServerStream<Req, Resp>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
{
    Arc::new(move |stream| f(stream).boxed())
}

/// Per-request facts every handler can consult.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    /// Full method, `/package.Service/Method`.
    pub method: String,
    /// Incoming request metadata.
    pub metadata: MetadataMap,
    /// Cancelled when the client goes away or the response is finished.
    pub ctx: CancellationToken,
    /// Connection-scoped token, cancelled right before the server closes the
    /// connection (max connection age or shutdown). Absent on servers that do
    /// not enforce a connection age.
    pub aux_ctx: Option<CancellationToken>,
}

/// Incoming half of a server stream.
pub struct Incoming<Req> {
    inner: Streaming<Req>,
}

impl<Req> Incoming<Req> {
    /// Next request message. `Ok(None)` means the client closed its send side.
    pub async fn recv(&mut self) -> Result<Option<Req>, Status> {
        self.inner.message().await
    }
}

/// One server-side bidi stream.
pub struct ServerStream<Req, Resp> {
    pub info: RequestInfo,
    pub extensions: Extensions,
    pub incoming: Incoming<Req>,
    pub sink: ResponseSink<Resp>,
}

impl<Req, Resp> ServerStream<Req, Resp> {
    pub async fn recv(&mut self) -> Result<Option<Req>, Status> {
        self.incoming.recv().await
    }

    pub fn send(&self, msg: Resp) -> impl Future<Output = Result<(), Closed>> + '_ {
        self.sink.send(msg)
    }
}

type HeaderResult = Result<MetadataMap, Status>;

struct SinkInner<Resp> {
    header_tx: Mutex<Option<oneshot::Sender<HeaderResult>>>,
    msg_tx: Mutex<Option<mpsc::Sender<Result<Resp, Status>>>>,
    trailer: Mutex<MetadataMap>,
}

/// Outgoing half of a server stream. Cheap to clone; all clones write to the
/// same response.
pub struct ResponseSink<Resp> {
    inner: Arc<SinkInner<Resp>>,
}

impl<Resp> Clone for ResponseSink<Resp> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<Resp> ResponseSink<Resp> {
    fn new() -> (
        Self,
        oneshot::Receiver<HeaderResult>,
        mpsc::Receiver<Result<Resp, Status>>,
    ) {
        let (header_tx, header_rx) = oneshot::channel();
        let (msg_tx, msg_rx) = mpsc::channel(1);
        let sink = Self {
            inner: Arc::new(SinkInner {
                header_tx: Mutex::new(Some(header_tx)),
                msg_tx: Mutex::new(Some(msg_tx)),
                trailer: Mutex::new(MetadataMap::new()),
            }),
        };
        (sink, header_rx, msg_rx)
    }

    /// Send response headers. Fails if headers were already sent.
    pub fn send_header(&self, md: MetadataMap) -> Result<(), Status> {
        let tx = self.inner.header_tx.lock().take();
        match tx {
            Some(tx) => tx
                .send(Ok(md))
                .map_err(|_| Status::cancelled("stream closed before header was sent")),
            None => Err(Status::internal("header already sent")),
        }
    }

    /// Add trailing metadata. Cannot fail; trailers go out when the handler
    /// returns.
    pub fn set_trailer(&self, md: MetadataMap) {
        merge(&mut self.inner.trailer.lock(), md);
    }

    /// Send one response message, flushing empty headers first if needed.
    pub async fn send(&self, msg: Resp) -> Result<(), Closed> {
        if let Some(tx) = self.inner.header_tx.lock().take() {
            let _ = tx.send(Ok(MetadataMap::new()));
        }
        let tx = self.inner.msg_tx.lock().clone();
        match tx {
            Some(tx) => tx.send(Ok(msg)).await.map_err(|_| Closed),
            None => Err(Closed),
        }
    }

    /// Complete the response with the handler's result plus accumulated trailers.
    async fn finish(&self, result: Result<(), Status>) {
        let trailer = std::mem::take(&mut *self.inner.trailer.lock());
        let header_tx = self.inner.header_tx.lock().take();
        let msg_tx = self.inner.msg_tx.lock().take();
        let status = match result {
            Ok(()) if trailer.is_empty() => None,
            Ok(()) => Some(Status::with_metadata(Code::Ok, "", trailer)),
            Err(mut status) => {
                merge(status.metadata_mut(), trailer);
                Some(status)
            }
        };
        if let Some(header_tx) = header_tx {
            match status {
                Some(status) if status.code() != Code::Ok => {
                    // trailers-only response
                    let _ = header_tx.send(Err(status));
                    return;
                }
                _ => {
                    let _ = header_tx.send(Ok(MetadataMap::new()));
                }
            }
        }
        if let (Some(tx), Some(status)) = (msg_tx, status) {
            let _ = tx.send(Err(status)).await;
        }
    }
}

/// Response body stream. Dropping it (client gone, response complete) cancels
/// the request token.
pub struct ResponseStream<Resp> {
    rx: ReceiverStream<Result<Resp, Status>>,
    _guard: DropGuard,
}

impl<Resp> Stream for ResponseStream<Resp> {
    type Item = Result<Resp, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_next_unpin(cx)
    }
}

struct StreamingHandler<Req, Resp> {
    method: Arc<str>,
    handler: Handler<Req, Resp>,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> StreamingService<Req> for StreamingHandler<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    type Response = Resp;
    type ResponseStream = ResponseStream<Resp>;
    type Future = BoxFuture<'static, Result<tonic::Response<Self::ResponseStream>, Status>>;

    fn call(&mut self, request: tonic::Request<Streaming<Req>>) -> Self::Future {
        let (metadata, extensions, incoming) = request.into_parts();
        let ctx = CancellationToken::new();
        let aux_ctx = extensions
            .get::<ConnectionContext>()
            .map(|c| c.token().clone());
        let (sink, header_rx, msg_rx) = ResponseSink::new();
        let stream = ServerStream {
            info: RequestInfo {
                method: self.method.to_string(),
                metadata,
                ctx: ctx.clone(),
                aux_ctx,
            },
            extensions,
            incoming: Incoming { inner: incoming },
            sink: sink.clone(),
        };
        let handler = self.handler.clone();
        // the request span of the middleware chain, if any
        let span = tracing::Span::current();
        tokio::spawn(
            async move {
                let result = handler(stream).await;
                sink.finish(result).await;
            }
            .instrument(span),
        );
        let body = ResponseStream {
            rx: ReceiverStream::new(msg_rx),
            _guard: ctx.drop_guard(),
        };
        async move {
            match header_rx.await {
                Ok(Ok(md)) => {
                    let mut response = tonic::Response::new(body);
                    *response.metadata_mut() = md;
                    Ok(response)
                }
                Ok(Err(status)) => Err(status),
                Err(_) => Err(Status::internal("handler exited without a response")),
            }
        }
        .boxed()
    }
}

/// Mount `handler` as the POST route for one gRPC method.
pub fn streaming_route<C>(
    full_method: &str,
    handler: Handler<C::Decode, C::Encode>,
) -> MethodRouter
where
    C: Codec + Default + Send + 'static,
    C::Decode: Send + 'static,
    C::Encode: Send + 'static,
{
    let method: Arc<str> = Arc::from(full_method);
    post(move |request: Request| {
        let svc = StreamingHandler {
            method: method.clone(),
            handler: handler.clone(),
            _types: PhantomData,
        };
        async move {
            let mut grpc = Grpc::new(C::default());
            grpc.streaming(svc, request).await.map(axum::body::Body::new)
        }
    })
}

/// Router fallback: unknown methods are `Unimplemented`.
pub async fn unimplemented(request: Request) -> Response {
    Status::unimplemented(format!("unknown method {}", request.uri().path()))
        .into_http::<axum::body::Body>()
        .into_response()
}

/// Turn a status into an HTTP response, for use inside axum middleware.
pub fn status_response(status: Status) -> Response {
    status.into_http::<axum::body::Body>().into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_flushes_empty_header() {
        let (sink, header_rx, mut msg_rx) = ResponseSink::<u32>::new();
        let s = sink.clone();
        let sent = tokio::spawn(async move { s.send(7).await });
        assert!(header_rx.await.unwrap().unwrap().is_empty());
        assert_eq!(msg_rx.recv().await.unwrap().unwrap(), 7);
        sent.await.unwrap().unwrap();
        assert!(sink.send_header(MetadataMap::new()).is_err());
    }

    #[tokio::test]
    async fn test_error_before_header_is_trailers_only() {
        let (sink, header_rx, _msg_rx) = ResponseSink::<u32>::new();
        let mut md = MetadataMap::new();
        md.insert("key3", "value3".parse().unwrap());
        sink.set_trailer(md);
        sink.finish(Err(Status::invalid_argument("boom"))).await;
        let status = header_rx.await.unwrap().unwrap_err();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(status.metadata().get("key3").unwrap(), "value3");
    }

    #[tokio::test]
    async fn test_trailer_after_messages() {
        let (sink, header_rx, mut msg_rx) = ResponseSink::<u32>::new();
        let mut header = MetadataMap::new();
        header.insert("key2", "value2".parse().unwrap());
        sink.send_header(header).unwrap();
        assert_eq!(header_rx.await.unwrap().unwrap().get("key2").unwrap(), "value2");

        let mut trailer = MetadataMap::new();
        trailer.insert("key3", "value3".parse().unwrap());
        sink.set_trailer(trailer);
        let s = sink.clone();
        let fin = tokio::spawn(async move { s.finish(Ok(())).await });
        let last = msg_rx.recv().await.unwrap().unwrap_err();
        assert_eq!(last.code(), Code::Ok);
        assert_eq!(last.metadata().get("key3").unwrap(), "value3");
        fin.await.unwrap();
        assert!(msg_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_ok_without_trailer_just_ends() {
        let (sink, header_rx, mut msg_rx) = ResponseSink::<u32>::new();
        sink.finish(Ok(())).await;
        assert!(header_rx.await.unwrap().is_ok());
        assert!(msg_rx.recv().await.is_none());
    }
}
