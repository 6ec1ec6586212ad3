//! Reverse tunnel.
//!
//! Agents keep `Connect` streams open to kas. kas parks them in the
//! [`registry::Registry`] and advertises them in the shared directory
//! ([`tracker::Tracker`]); routers find them through the
//! [`querier::AggregatingQuerier`] and pipe requests through them.
//!
//! - [`rpc`]: `Connect` wire messages
//! - [`tunnel`]: one parked tunnel and request forwarding through it
//! - [`server`]: the `Connect` handler
//! - [`agent`]: the agent's connection pool

pub mod agent;
pub mod querier;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod tracker;
#[allow(clippy::module_inception)]
pub mod tunnel;

pub use querier::AggregatingQuerier;
pub use registry::{FindHandle, Registry};
pub use tracker::{Querier, Registerer, Tracker};
pub use tunnel::{DataCallback, Tunnel};
