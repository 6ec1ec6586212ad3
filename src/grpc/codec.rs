//! Codecs.
//!
//! The proxy path never decodes payloads: [`RawCodec`] moves each length-prefixed
//! gRPC frame through as [`Bytes`]. Typed messages that travel inside raw
//! streams (`GatewayResponse`, `StartStreaming`) are encoded with
//! [`encode`]/[`decode`].

use bytes::{Buf, BufMut, Bytes};
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::Status;

/// Pass-through codec for opaque message frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec for RawCodec {
    type Encode = Bytes;
    type Decode = Bytes;
    type Encoder = RawCodec;
    type Decoder = RawCodec;

    fn encoder(&mut self) -> Self::Encoder {
        RawCodec
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawCodec
    }
}

impl Encoder for RawCodec {
    type Item = Bytes;
    type Error = Status;

    fn encode(&mut self, item: Bytes, dst: &mut EncodeBuf<'_>) -> Result<(), Status> {
        dst.put(item);
        Ok(())
    }
}

impl Decoder for RawCodec {
    type Item = Bytes;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Bytes>, Status> {
        let len = src.remaining();
        Ok(Some(src.copy_to_bytes(len)))
    }
}

/// Encode a prost message into a frame.
pub fn encode<M: prost::Message>(msg: &M) -> Bytes {
    Bytes::from(msg.encode_to_vec())
}

/// Decode a frame into a prost message, as a gRPC `Internal` error on failure.
pub fn decode<M: prost::Message + Default>(frame: Bytes) -> Result<M, Status> {
    M::decode(frame).map_err(|e| Status::internal(format!("failed to decode message: {e}")))
}
