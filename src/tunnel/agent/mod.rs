//! Agent side of the reverse tunnel: a pool of connections to kas, each
//! ready to carry one request at a time into the agent's upstream server.

mod connection;
mod manager;

pub use connection::TunnelConnection;
pub use manager::{ConnectionFactory, ConnectionHooks, ConnectionManager, PoolParams, PoolStats};
