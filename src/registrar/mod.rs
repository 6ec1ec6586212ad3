//! Agent registrar.
//!
//! Agents call `Register` periodically with their identity. kas records the
//! connection in three expiring hashes so other components can ask which
//! agents are connected; an agent that stops registering drops out once its
//! entries expire.

mod agent;
mod server;
mod tracker;

use std::collections::HashMap;

pub use agent::Registrar;
pub use server::register_route;
pub use tracker::ConnectionTracker;

pub const REGISTER_METHOD: &str = "/gitlab.agent.agent_registrar.rpc.AgentRegistrar/Register";

#[derive(Clone, PartialEq, prost::Message)]
pub struct AgentMeta {
    #[prost(string, tag = "1")]
    pub version: String,
    #[prost(string, tag = "2")]
    pub commit_id: String,
    #[prost(string, tag = "3")]
    pub pod_namespace: String,
    #[prost(string, tag = "4")]
    pub pod_name: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RegisterRequest {
    #[prost(message, optional, tag = "1")]
    pub agent_meta: Option<AgentMeta>,
    #[prost(int64, tag = "2")]
    pub pod_id: i64,
}

#[derive(Clone, Copy, PartialEq, prost::Message)]
pub struct RegisterResponse {}

/// What the tracker stores per connection.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ConnectedAgentInfo {
    #[prost(message, optional, tag = "1")]
    pub agent_meta: Option<AgentMeta>,
    /// Unix seconds.
    #[prost(int64, tag = "2")]
    pub connected_at: i64,
    #[prost(int64, tag = "3")]
    pub connection_id: i64,
    #[prost(int64, tag = "4")]
    pub agent_id: i64,
    #[prost(int64, tag = "5")]
    pub project_id: i64,
}

/// Connections of one agent or project, keyed by connection id.
pub type Connections = HashMap<i64, ConnectedAgentInfo>;
