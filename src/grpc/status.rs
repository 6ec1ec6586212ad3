//! `google.rpc.Status` on the wire.
//!
//! tonic carries rich error details in `grpc-status-details-bin` as an encoded
//! `google.rpc.Status`. Tunnel frames carry the same proto, so converting in
//! both directions keeps code, message and every detail intact.

use bytes::Bytes;
use tonic::{Code, Status};

/// `google.protobuf.Any`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Any {
    #[prost(string, tag = "1")]
    pub type_url: String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

/// `google.rpc.Status`.
#[derive(Clone, PartialEq, prost::Message)]
pub struct RpcStatus {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(message, repeated, tag = "3")]
    pub details: Vec<Any>,
}

impl RpcStatus {
    /// Convert a live status into its proto form.
    pub fn from_status(status: &Status) -> Self {
        if !status.details().is_empty() {
            if let Ok(decoded) = <Self as prost::Message>::decode(status.details()) {
                return decoded;
            }
        }
        Self {
            code: status.code() as i32,
            message: status.message().to_string(),
            details: Vec::new(),
        }
    }

    /// Rebuild a status. Details survive through `grpc-status-details-bin`.
    pub fn into_status(self) -> Status {
        let code = Code::from_i32(self.code);
        if self.details.is_empty() {
            return Status::new(code, self.message);
        }
        let encoded = Bytes::from(prost::Message::encode_to_vec(&self));
        Status::with_details(code, self.message, encoded)
    }
}

/// Build a status carrying typed details, the way a service handler would.
pub fn status_with_details(code: Code, message: &str, details: Vec<Any>) -> Status {
    RpcStatus {
        code: code as i32,
        message: message.to_string(),
        details,
    }
    .into_status()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_status_round_trip() {
        let st = Status::not_found("nope");
        let proto = RpcStatus::from_status(&st);
        assert_eq!(proto.code, Code::NotFound as i32);
        assert!(proto.details.is_empty());
        let back = proto.into_status();
        assert_eq!(back.code(), Code::NotFound);
        assert_eq!(back.message(), "nope");
        assert!(back.details().is_empty());
    }

    #[test]
    fn test_details_preserved() {
        let any = Any {
            type_url: "type.googleapis.com/test.Request".to_string(),
            value: vec![10, 3, b'a', b'b', b'c'],
        };
        let st = status_with_details(Code::InvalidArgument, "bad", vec![any.clone()]);
        let proto = RpcStatus::from_status(&st);
        assert_eq!(proto.details, vec![any]);
        let back = proto.clone().into_status();
        assert_eq!(RpcStatus::from_status(&back), proto);
    }
}
