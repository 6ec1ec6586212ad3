//! Wire messages of `gitlab.agent.reverse_tunnel.rpc.ReverseTunnel/Connect`.
//!
//! The agent sends [`ConnectRequest`] frames: one descriptor, then, once the
//! tunnel carries a request, the upstream response as header, messages,
//! trailer and error. kas sends [`ConnectResponse`] frames: the request info
//! followed by request messages and a close-send marker.

use std::collections::HashMap;

use crate::grpc::metadata::Values;
use crate::grpc::status::RpcStatus;
use crate::grpc::visitor::{Automaton, Transition};

pub const CONNECT_METHOD: &str = "/gitlab.agent.reverse_tunnel.rpc.ReverseTunnel/Connect";

#[derive(Clone, PartialEq, prost::Message)]
pub struct AgentDescriptor {
    #[prost(message, repeated, tag = "1")]
    pub services: Vec<Service>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Service {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "2")]
    pub methods: Vec<Method>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Method {
    #[prost(string, tag = "1")]
    pub name: String,
}

impl AgentDescriptor {
    /// Whether the agent serves `method` of `service`.
    pub fn supports_service_and_method(&self, service: &str, method: &str) -> bool {
        self.services
            .iter()
            .filter(|s| s.name == service)
            .any(|s| s.methods.iter().any(|m| m.name == method))
    }
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Descriptor {
    #[prost(message, optional, tag = "1")]
    pub agent_descriptor: Option<AgentDescriptor>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Header {
    #[prost(map = "string, message", tag = "1")]
    pub meta: HashMap<String, Values>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Message {
    #[prost(bytes = "bytes", tag = "1")]
    pub data: bytes::Bytes,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Trailer {
    #[prost(map = "string, message", tag = "1")]
    pub meta: HashMap<String, Values>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Error {
    #[prost(message, optional, tag = "1")]
    pub status: Option<RpcStatus>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ConnectRequest {
    #[prost(oneof = "connect_request::Msg", tags = "1, 2, 3, 4, 5")]
    pub msg: Option<connect_request::Msg>,
}

pub mod connect_request {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Msg {
        #[prost(message, tag = "1")]
        Descriptor(super::Descriptor),
        #[prost(message, tag = "2")]
        Header(super::Header),
        #[prost(message, tag = "3")]
        Message(super::Message),
        #[prost(message, tag = "4")]
        Trailer(super::Trailer),
        #[prost(message, tag = "5")]
        Error(super::Error),
    }

    impl Msg {
        pub fn field_number(&self) -> u32 {
            match self {
                Self::Descriptor(_) => DESCRIPTOR,
                Self::Header(_) => HEADER,
                Self::Message(_) => MESSAGE,
                Self::Trailer(_) => TRAILER,
                Self::Error(_) => ERROR,
            }
        }
    }

    pub const DESCRIPTOR: u32 = 1;
    pub const HEADER: u32 = 2;
    pub const MESSAGE: u32 = 3;
    pub const TRAILER: u32 = 4;
    pub const ERROR: u32 = 5;
}

/// Frame order on the agent's side of a tunnel.
pub static CONNECT_REQUEST_AUTOMATON: Automaton = {
    use connect_request::{DESCRIPTOR, ERROR, HEADER, MESSAGE, TRAILER};
    Automaton {
        name: "ConnectRequest",
        transitions: &[
            Transition {
                from: DESCRIPTOR,
                next: &[HEADER, ERROR],
                eof_allowed: false,
            },
            Transition {
                from: HEADER,
                next: &[MESSAGE, TRAILER, ERROR],
                eof_allowed: false,
            },
            Transition {
                from: MESSAGE,
                next: &[MESSAGE, TRAILER, ERROR],
                eof_allowed: false,
            },
            Transition {
                from: TRAILER,
                next: &[ERROR],
                eof_allowed: true,
            },
            Transition {
                from: ERROR,
                next: &[],
                eof_allowed: true,
            },
        ],
    }
};

#[derive(Clone, PartialEq, prost::Message)]
pub struct RequestInfo {
    #[prost(string, tag = "1")]
    pub method_name: String,
    #[prost(map = "string, message", tag = "2")]
    pub meta: HashMap<String, Values>,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct CloseSend {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ConnectResponse {
    #[prost(oneof = "connect_response::Msg", tags = "1, 2, 3")]
    pub msg: Option<connect_response::Msg>,
}

pub mod connect_response {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Msg {
        #[prost(message, tag = "1")]
        RequestInfo(super::RequestInfo),
        #[prost(message, tag = "2")]
        Message(super::Message),
        #[prost(message, tag = "3")]
        CloseSend(super::CloseSend),
    }

    impl Msg {
        pub fn field_number(&self) -> u32 {
            match self {
                Self::RequestInfo(_) => REQUEST_INFO,
                Self::Message(_) => MESSAGE,
                Self::CloseSend(_) => CLOSE_SEND,
            }
        }
    }

    /// Nothing received yet.
    pub const START: u32 = 0;
    pub const REQUEST_INFO: u32 = 1;
    pub const MESSAGE: u32 = 2;
    pub const CLOSE_SEND: u32 = 3;
}

/// Frame order on kas' side of a tunnel. kas may end the call at any point,
/// for example when it shuts down.
pub static CONNECT_RESPONSE_AUTOMATON: Automaton = {
    use connect_response::{CLOSE_SEND, MESSAGE, REQUEST_INFO, START};
    Automaton {
        name: "ConnectResponse",
        transitions: &[
            Transition {
                from: START,
                next: &[REQUEST_INFO],
                eof_allowed: true,
            },
            Transition {
                from: REQUEST_INFO,
                next: &[MESSAGE, CLOSE_SEND],
                eof_allowed: true,
            },
            Transition {
                from: MESSAGE,
                next: &[MESSAGE, CLOSE_SEND],
                eof_allowed: true,
            },
            Transition {
                from: CLOSE_SEND,
                next: &[],
                eof_allowed: true,
            },
        ],
    }
};

impl ConnectRequest {
    pub fn new(msg: connect_request::Msg) -> Self {
        Self { msg: Some(msg) }
    }
}

impl ConnectResponse {
    pub fn new(msg: connect_response::Msg) -> Self {
        Self { msg: Some(msg) }
    }
}
