#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! kas library: the building blocks of the reverse-tunnel control plane.
//!
//! - `tunnel`: agent tunnels, their registry and directory, the agent pool
//! - `router`: routing a call to whichever instance holds a tunnel
//! - `registrar`: agent `Register` RPC and connected-agent bookkeeping
//! - `grpc`: raw HTTP/2 gRPC streams, codecs, listeners and the peer pool
//! - `redistool`: expiring hashes and the token rate limiter over Redis
//! - `auth` / `rpc_api`: per-request middleware and error translation
//! - `gitlab`: agent info lookups
//! - `app`: process wiring and staged lifecycle
//! - `testing`: in-memory backends and listeners for tests

pub mod app;
pub mod auth;
pub mod config;
pub mod errors;
pub mod gitlab;
pub mod grpc;
pub mod metrics;
pub mod redistool;
pub mod registrar;
pub mod retry;
pub mod router;
pub mod rpc_api;
pub mod testing;
pub mod tunnel;

/// Agent id used in logs when the agent is not known yet.
pub const NO_AGENT_ID: i64 = 0;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use errors::Error;
