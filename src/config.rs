//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `OWN_PRIVATE_API_URL`, `OWN_PRIVATE_API_CIDR`,
//!    `OWN_PRIVATE_API_PORT`, `OWN_PRIVATE_API_SCHEME`, `OWN_PRIVATE_API_HOST`,
//!    `KAS_REDIS_URL`, `KAS_AGENT_TOKEN`
//! 2. **Config file**: path via `--config <path>`, or `kas.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [listen_agent]
//! network = "tcp"
//! address = "127.0.0.1:8150"
//! connections_per_token_per_minute = 40000
//! max_connection_age = "2h"
//! listen_grace_period = "5s"
//!
//! [listen_private_api]
//! address = "127.0.0.1:8155"
//! authentication_secret_file = "/etc/kas/private_api_secret"
//!
//! [redis]
//! url = "redis://127.0.0.1:6379"
//! key_prefix = "gitlab-kas"
//!
//! [agent]
//! redis_conn_info_ttl = "5m"
//!
//! [routing]
//! tunnel_find_timeout = "20s"
//!
//! [[agent_services]]
//! name = "gitlab.agent.kubernetes_api.rpc.KubernetesApi"
//! methods = ["MakeRequest"]
//! ```

use std::path::Path;
use std::time::Duration;

use base64::Engine;
use serde::Deserialize;

use crate::errors::Error;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub listen_agent: AgentListenConfig,
    #[serde(default)]
    pub listen_api: ApiListenConfig,
    #[serde(default)]
    pub listen_private_api: PrivateApiListenConfig,
    #[serde(default)]
    pub own_private_api: OwnPrivateApiConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub gitlab: GitlabConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Agent-facing services that can be routed into clusters.
    #[serde(default)]
    pub agent_services: Vec<ServiceConfig>,
    /// Settings for `kas agent`.
    #[serde(default)]
    pub agentk: AgentkConfig,
}

/// Listener address family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    Unix,
}

/// Agent-facing gRPC server.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentListenConfig {
    #[serde(default)]
    pub network: Network,
    #[serde(default = "default_agent_address")]
    pub address: String,
    /// Per agent token, counted per wall-clock minute (default 40 000).
    #[serde(default = "default_connections_per_token_per_minute")]
    pub connections_per_token_per_minute: u64,
    #[serde(with = "humantime_serde", default = "default_max_connection_age")]
    pub max_connection_age: Duration,
    #[serde(with = "humantime_serde", default = "default_listen_grace_period")]
    pub listen_grace_period: Duration,
}

/// External API server: the routing surface behind JWT auth.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiListenConfig {
    #[serde(default)]
    pub network: Network,
    #[serde(default = "default_api_address")]
    pub address: String,
    #[serde(with = "humantime_serde", default = "default_max_connection_age")]
    pub max_connection_age: Duration,
    #[serde(with = "humantime_serde", default = "default_listen_grace_period")]
    pub listen_grace_period: Duration,
    /// Base64 encoded JWT secret. The API server is disabled without one.
    pub authentication_secret_file: Option<String>,
}

/// Private API server that peer kas instances dial.
#[derive(Debug, Clone, Deserialize)]
pub struct PrivateApiListenConfig {
    #[serde(default)]
    pub network: Network,
    #[serde(default = "default_private_api_address")]
    pub address: String,
    #[serde(with = "humantime_serde", default = "default_max_connection_age")]
    pub max_connection_age: Duration,
    #[serde(with = "humantime_serde", default = "default_listen_grace_period")]
    pub listen_grace_period: Duration,
    /// Base64 encoded JWT secret shared by every kas instance. Required.
    pub authentication_secret_file: Option<String>,
}

/// How peers reach this instance's private API. Usually set through the
/// environment rather than the file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OwnPrivateApiConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub cidr: String,
    #[serde(default)]
    pub port: String,
    #[serde(default)]
    pub scheme: String,
    /// TLS server name to use when this instance dials itself.
    #[serde(default)]
    pub host: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Namespace for every key this fleet writes.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(with = "humantime_serde", default = "default_redis_dial_timeout")]
    pub dial_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_redis_write_timeout")]
    pub write_timeout: Duration,
}

/// Agent bookkeeping: info cache and directory entry lifetimes.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(with = "humantime_serde", default = "default_info_cache_ttl")]
    pub info_cache_ttl: Duration,
    #[serde(with = "humantime_serde", default = "default_info_cache_error_ttl")]
    pub info_cache_error_ttl: Duration,
    #[serde(with = "humantime_serde", default = "default_redis_conn_info_ttl")]
    pub redis_conn_info_ttl: Duration,
    #[serde(with = "humantime_serde", default = "default_redis_conn_info_refresh")]
    pub redis_conn_info_refresh: Duration,
    #[serde(with = "humantime_serde", default = "default_redis_conn_info_gc")]
    pub redis_conn_info_gc: Duration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitlabConfig {
    #[serde(default = "default_gitlab_address")]
    pub address: String,
    /// Base64 encoded secret for `Gitlab-Kas-Api-Request` JWTs.
    pub authentication_secret_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub network: Network,
    #[serde(default = "default_observability_address")]
    pub address: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    #[serde(with = "humantime_serde", default = "default_tunnel_find_timeout")]
    pub tunnel_find_timeout: Duration,
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
    /// Peer dials started per directory poll cycle.
    #[serde(default = "default_speculation_factor")]
    pub speculation_factor: usize,
    /// Unused peer connections are closed after this long.
    #[serde(with = "humantime_serde", default = "default_pool_idle_timeout")]
    pub pool_idle_timeout: Duration,
}

/// One agent-facing service and its methods.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default)]
    pub methods: Vec<String>,
}

/// Agent mode: the tunnel pool running inside a cluster.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentkConfig {
    /// Agent-facing kas endpoint, `grpc://`, `grpcs://` or `unix://`.
    #[serde(default = "default_kas_address")]
    pub kas_address: String,
    /// Agent token. Override with `KAS_AGENT_TOKEN`.
    #[serde(default)]
    pub token: String,
    /// In-cluster gRPC endpoint requests are delivered to.
    #[serde(default = "default_upstream_address")]
    pub upstream_address: String,
    #[serde(default = "default_min_idle_connections")]
    pub min_idle_connections: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_scale_up_step")]
    pub scale_up_step: usize,
    #[serde(with = "humantime_serde", default = "default_max_idle_time")]
    pub max_idle_time: Duration,
    #[serde(with = "humantime_serde", default = "default_register_period")]
    pub register_period: Duration,
    #[serde(default)]
    pub pod_namespace: String,
    #[serde(default)]
    pub pod_name: String,
}

fn default_agent_address() -> String {
    "127.0.0.1:8150".to_string()
}
fn default_api_address() -> String {
    "127.0.0.1:8153".to_string()
}
fn default_private_api_address() -> String {
    "127.0.0.1:8155".to_string()
}
fn default_observability_address() -> String {
    "127.0.0.1:8151".to_string()
}
fn default_connections_per_token_per_minute() -> u64 {
    40_000
}
fn default_max_connection_age() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}
fn default_listen_grace_period() -> Duration {
    Duration::from_secs(5)
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_key_prefix() -> String {
    "gitlab-kas".to_string()
}
fn default_redis_dial_timeout() -> Duration {
    Duration::from_secs(5)
}
fn default_redis_write_timeout() -> Duration {
    Duration::from_secs(3)
}
fn default_info_cache_ttl() -> Duration {
    Duration::from_secs(5 * 60)
}
fn default_info_cache_error_ttl() -> Duration {
    Duration::from_secs(60)
}
fn default_redis_conn_info_ttl() -> Duration {
    Duration::from_secs(5 * 60)
}
fn default_redis_conn_info_refresh() -> Duration {
    Duration::from_secs(4 * 60)
}
fn default_redis_conn_info_gc() -> Duration {
    Duration::from_secs(10 * 60)
}
fn default_gitlab_address() -> String {
    "http://127.0.0.1:8080".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_tunnel_find_timeout() -> Duration {
    Duration::from_secs(20)
}
fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_speculation_factor() -> usize {
    2
}
fn default_pool_idle_timeout() -> Duration {
    Duration::from_secs(60 * 60)
}
fn default_kas_address() -> String {
    "grpc://127.0.0.1:8150".to_string()
}
fn default_upstream_address() -> String {
    "grpc://127.0.0.1:8160".to_string()
}
fn default_min_idle_connections() -> usize {
    2
}
fn default_max_connections() -> usize {
    500
}
fn default_scale_up_step() -> usize {
    10
}
fn default_max_idle_time() -> Duration {
    Duration::from_secs(60)
}
fn default_register_period() -> Duration {
    Duration::from_secs(150)
}

impl Default for AgentListenConfig {
    fn default() -> Self {
        Self {
            network: Network::Tcp,
            address: default_agent_address(),
            connections_per_token_per_minute: default_connections_per_token_per_minute(),
            max_connection_age: default_max_connection_age(),
            listen_grace_period: default_listen_grace_period(),
        }
    }
}

impl Default for ApiListenConfig {
    fn default() -> Self {
        Self {
            network: Network::Tcp,
            address: default_api_address(),
            max_connection_age: default_max_connection_age(),
            listen_grace_period: default_listen_grace_period(),
            authentication_secret_file: None,
        }
    }
}

impl Default for PrivateApiListenConfig {
    fn default() -> Self {
        Self {
            network: Network::Tcp,
            address: default_private_api_address(),
            max_connection_age: default_max_connection_age(),
            listen_grace_period: default_listen_grace_period(),
            authentication_secret_file: None,
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            dial_timeout: default_redis_dial_timeout(),
            write_timeout: default_redis_write_timeout(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            info_cache_ttl: default_info_cache_ttl(),
            info_cache_error_ttl: default_info_cache_error_ttl(),
            redis_conn_info_ttl: default_redis_conn_info_ttl(),
            redis_conn_info_refresh: default_redis_conn_info_refresh(),
            redis_conn_info_gc: default_redis_conn_info_gc(),
        }
    }
}

impl Default for GitlabConfig {
    fn default() -> Self {
        Self {
            address: default_gitlab_address(),
            authentication_secret_file: None,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            network: Network::Tcp,
            address: default_observability_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            tunnel_find_timeout: default_tunnel_find_timeout(),
            poll_interval: default_poll_interval(),
            speculation_factor: default_speculation_factor(),
            pool_idle_timeout: default_pool_idle_timeout(),
        }
    }
}

impl Default for AgentkConfig {
    fn default() -> Self {
        Self {
            kas_address: default_kas_address(),
            token: String::new(),
            upstream_address: default_upstream_address(),
            min_idle_connections: default_min_idle_connections(),
            max_connections: default_max_connections(),
            scale_up_step: default_scale_up_step(),
            max_idle_time: default_max_idle_time(),
            register_period: default_register_period(),
            pod_namespace: String::new(),
            pod_name: String::new(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for `kas.toml` in
    /// the current directory, falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Result<Self, Error> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new("kas.toml").exists() => Self::from_file("kas.toml")?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read config file {path}: {e}")))?;
        Self::parse(&content).map_err(|e| Error::config(format!("{path}: {e}")))
    }

    pub fn parse(content: &str) -> Result<Self, Error> {
        toml::from_str(content).map_err(|e| Error::config(e.to_string()))
    }

    /// Apply environment overrides. `get` is `std::env::var` outside tests.
    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(v) = get("OWN_PRIVATE_API_URL") {
            self.own_private_api.url = v;
        }
        if let Some(v) = get("OWN_PRIVATE_API_CIDR") {
            self.own_private_api.cidr = v;
        }
        if let Some(v) = get("OWN_PRIVATE_API_PORT") {
            self.own_private_api.port = v;
        }
        if let Some(v) = get("OWN_PRIVATE_API_SCHEME") {
            self.own_private_api.scheme = v;
        }
        if let Some(v) = get("OWN_PRIVATE_API_HOST") {
            self.own_private_api.host = v;
        }
        if let Some(v) = get("KAS_REDIS_URL") {
            self.redis.url = v;
        }
        if let Some(v) = get("KAS_AGENT_TOKEN") {
            self.agentk.token = v;
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.agent.redis_conn_info_refresh >= self.agent.redis_conn_info_ttl {
            return Err(Error::config(
                "agent.redis_conn_info_refresh must be shorter than agent.redis_conn_info_ttl",
            ));
        }
        if self.routing.speculation_factor == 0 {
            return Err(Error::config("routing.speculation_factor must be at least 1"));
        }
        if self.agentk.max_connections < self.agentk.min_idle_connections {
            return Err(Error::config(
                "agentk.max_connections must not be below agentk.min_idle_connections",
            ));
        }
        for svc in &self.agent_services {
            if svc.name.is_empty() {
                return Err(Error::config("agent_services entry without a name"));
            }
        }
        Ok(())
    }
}

/// Read a base64 encoded secret file.
pub fn read_secret(path: &str) -> Result<Vec<u8>, Error> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read secret file {path}: {e}")))?;
    base64::engine::general_purpose::STANDARD
        .decode(content.trim())
        .map_err(|e| Error::config(format!("secret file {path} is not valid base64: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.listen_agent.address, "127.0.0.1:8150");
        assert_eq!(config.listen_agent.connections_per_token_per_minute, 40_000);
        assert_eq!(config.listen_agent.max_connection_age, Duration::from_secs(7200));
        assert_eq!(config.listen_private_api.address, "127.0.0.1:8155");
        assert_eq!(config.redis.key_prefix, "gitlab-kas");
        assert_eq!(config.agent.redis_conn_info_ttl, Duration::from_secs(300));
        assert_eq!(config.routing.tunnel_find_timeout, Duration::from_secs(20));
        assert_eq!(config.routing.speculation_factor, 2);
        assert_eq!(config.agentk.register_period, Duration::from_secs(150));
        config.validate().unwrap();
    }

    #[test]
    fn test_durations_and_services() {
        let config = Config::parse(
            r#"
            [listen_agent]
            network = "unix"
            address = "/tmp/kas.sock"
            max_connection_age = "30m"

            [routing]
            tunnel_find_timeout = "300ms"

            [[agent_services]]
            name = "gitlab.agent.Testing"
            methods = ["RequestResponse", "StreamingRequestResponse"]
            "#,
        )
        .unwrap();
        assert_eq!(config.listen_agent.network, Network::Unix);
        assert_eq!(config.listen_agent.max_connection_age, Duration::from_secs(1800));
        assert_eq!(config.routing.tunnel_find_timeout, Duration::from_millis(300));
        assert_eq!(config.agent_services[0].methods.len(), 2);
    }

    #[test]
    fn test_bad_duration_is_error() {
        let err = Config::parse("[routing]\ntunnel_find_timeout = \"soon\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("OWN_PRIVATE_API_CIDR", "10.0.0.0/8"),
            ("OWN_PRIVATE_API_PORT", "8155"),
            ("KAS_REDIS_URL", "redis://redis:6379"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.apply_env(|k| env.get(k).map(|v| (*v).to_string()));
        assert_eq!(config.own_private_api.cidr, "10.0.0.0/8");
        assert_eq!(config.own_private_api.port, "8155");
        assert!(config.own_private_api.url.is_empty());
        assert_eq!(config.redis.url, "redis://redis:6379");
    }

    #[test]
    fn test_refresh_must_be_below_ttl() {
        let mut config = Config::default();
        config.agent.redis_conn_info_refresh = config.agent.redis_conn_info_ttl;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_read_secret() {
        let path = std::env::temp_dir().join(format!("kas-secret-{}", uuid::Uuid::new_v4()));
        std::fs::write(&path, "c2VjcmV0\n").unwrap();
        let secret = read_secret(path.to_str().unwrap()).unwrap();
        assert_eq!(secret, b"secret");
        std::fs::remove_file(&path).unwrap();
    }
}
