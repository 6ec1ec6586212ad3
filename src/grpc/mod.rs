//! gRPC plumbing shared by every server and client in kas.
//!
//! Nothing in here knows about agents or tunnels. The rest of the crate is
//! written against these pieces:
//!
//! - [`codec`]: [`codec::RawCodec`] for opaque frames plus prost helpers
//! - [`server`]: streaming handlers mounted as axum routes, with explicit
//!   header/trailer control ([`server::ServerStream`])
//! - [`client`]: bidi client streams over a `tonic` channel
//! - [`metadata`]: `MetadataMap` <-> wire `Values` maps, hop filtering
//! - [`status`]: `tonic::Status` <-> `google.rpc.Status`
//! - [`jwt`]: HS256 signer/validator and the axum auth layer
//! - [`pool`]: reference-counted peer connection pool
//! - [`listener`]: accept loop with max connection age and graceful drain
//! - [`pipe`]: in-memory listener used for the internal server and tests
//! - [`visitor`]: legal frame orders of envelope streams

pub mod client;
pub mod codec;
pub mod jwt;
pub mod listener;
pub mod metadata;
pub mod pipe;
pub mod pool;
pub mod server;
pub mod status;
pub mod visitor;

pub use client::ClientStream;
pub use codec::RawCodec;
pub use server::{ResponseSink, ServerStream};

/// A send on a stream whose other side has already gone away.
///
/// This is the `io.EOF` of a gRPC send: the real outcome is only observable by
/// reading from the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("stream closed")]
pub struct Closed;

/// Split `/package.Service/Method` into `("package.Service", "Method")`.
///
/// Malformed names produce empty parts, which never match a descriptor.
pub fn split_method(full_method: &str) -> (&str, &str) {
    let trimmed = full_method.strip_prefix('/').unwrap_or(full_method);
    match trimmed.rsplit_once('/') {
        Some((service, method)) => (service, method),
        None => ("", ""),
    }
}

/// Join a service and method name into a gRPC path.
pub fn full_method(service: &str, method: &str) -> String {
    format!("/{service}/{method}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_method() {
        assert_eq!(
            split_method("/gitlab.agent.Testing/RequestResponse"),
            ("gitlab.agent.Testing", "RequestResponse")
        );
        assert_eq!(split_method("garbage"), ("", ""));
        assert_eq!(split_method("/a/b/c"), ("a/b", "c"));
    }

    #[test]
    fn test_full_method_round_trip() {
        let m = full_method("svc.S", "M");
        assert_eq!(m, "/svc.S/M");
        assert_eq!(split_method(&m), ("svc.S", "M"));
    }
}
