//! `kas agent`: the in-cluster half. Keeps a pool of tunnels open to kas and
//! registers the agent periodically.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::Config;
use crate::errors::Error;
use crate::grpc::pool::channel_for_url;
use crate::registrar::{AgentMeta, Registrar};
use crate::retry::PollConfig;
use crate::tunnel::agent::{ConnectionManager, PoolParams, TunnelConnection};
use crate::tunnel::rpc::{AgentDescriptor, Method, Service};

const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// What the agent advertises: every configured agent service.
pub fn descriptor(config: &Config) -> AgentDescriptor {
    AgentDescriptor {
        services: config
            .agent_services
            .iter()
            .map(|s| Service {
                name: s.name.clone(),
                methods: s
                    .methods
                    .iter()
                    .map(|m| Method { name: m.clone() })
                    .collect(),
            })
            .collect(),
    }
}

/// Run until `ctx` is cancelled.
pub async fn run_agent(config: &Config, ctx: CancellationToken) -> Result<(), Error> {
    let cfg = &config.agentk;
    if cfg.token.is_empty() {
        return Err(Error::config("agentk.token (or KAS_AGENT_TOKEN) is required"));
    }
    let kas = channel_for_url(&cfg.kas_address, None)?;
    let upstream = channel_for_url(&cfg.upstream_address, None)?;

    let connection = Arc::new(TunnelConnection::new(
        descriptor(config),
        kas.clone(),
        cfg.token.clone(),
        upstream,
        PollConfig::new(RECONNECT_INTERVAL),
    ));
    let manager = ConnectionManager::new(
        PoolParams {
            min_idle_connections: cfg.min_idle_connections,
            max_connections: cfg.max_connections,
            scale_up_step: cfg.scale_up_step,
            max_idle_time: cfg.max_idle_time,
        },
        connection.factory(),
    );
    let registrar = Registrar::new(
        kas,
        cfg.token.clone(),
        AgentMeta {
            version: env!("CARGO_PKG_VERSION").to_string(),
            commit_id: String::new(),
            pod_namespace: cfg.pod_namespace.clone(),
            pod_name: cfg.pod_name.clone(),
        },
        i64::from(rand::random::<u32>()),
        PollConfig::new(cfg.register_period),
    );

    info!(kas_address = %cfg.kas_address, upstream_address = %cfg.upstream_address, "Agent starting");
    tokio::join!(manager.run(ctx.clone()), registrar.run(ctx));
    info!("Agent stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_descriptor_from_services() {
        let mut config = Config::default();
        config.agent_services = vec![testing::testing_service_config()];
        let d = descriptor(&config);
        assert_eq!(d, testing::testing_descriptor());
        assert!(d.supports_service_and_method(testing::SERVICE, "RequestResponse"));
    }

    #[tokio::test]
    async fn test_token_required() {
        let err = run_agent(&Config::default(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("token"), "{err}");
    }
}
