use std::sync::Arc;
use std::time::Duration;

use futures::future;
use parking_lot::Mutex;
use prost::Message as _;
use tracing::warn;

use super::{ConnectedAgentInfo, Connections};
use crate::errors::Error;
use crate::redistool::expiring_hash::HashStore;
use crate::redistool::{prefixed_i64_key, Backend, ExpiringHash};

struct Hashes {
    by_agent_id: ExpiringHash<i64, i64>,
    by_project_id: ExpiringHash<i64, i64>,
    connected_agents: ExpiringHash<(), i64>,
}

/// Records registered agent connections in the backing store.
///
/// Entries are written and immediately forgotten: nothing here refreshes them,
/// the agent does by registering again.
pub struct ConnectionTracker {
    hashes: Mutex<Hashes>,
    by_agent_id: HashStore<i64>,
    by_project_id: HashStore<i64>,
    connected_agents: HashStore<()>,
}

impl ConnectionTracker {
    pub fn new(backend: Arc<dyn Backend>, key_prefix: &str, ttl: Duration) -> Self {
        let conn_field = |id: &i64| id.to_le_bytes().to_vec();
        let agent_prefix = format!("{key_prefix}:conn_by_agent_id:");
        let project_prefix = format!("{key_prefix}:conn_by_project_id:");
        let agents_key = format!("{key_prefix}:connected_agents").into_bytes();
        let by_agent_id = ExpiringHash::new(
            backend.clone(),
            move |id: &i64| prefixed_i64_key(&agent_prefix, *id),
            conn_field,
            ttl,
        );
        let by_project_id = ExpiringHash::new(
            backend.clone(),
            move |id: &i64| prefixed_i64_key(&project_prefix, *id),
            conn_field,
            ttl,
        );
        let connected_agents = ExpiringHash::new(
            backend,
            move |_: &()| agents_key.clone(),
            conn_field,
            ttl,
        );
        Self {
            by_agent_id: by_agent_id.store(),
            by_project_id: by_project_id.store(),
            connected_agents: connected_agents.store(),
            hashes: Mutex::new(Hashes {
                by_agent_id,
                by_project_id,
                connected_agents,
            }),
        }
    }

    pub async fn register_connection(&self, info: &ConnectedAgentInfo) -> Result<(), Error> {
        let value = info.encode_to_vec();
        let writes = {
            let mut h = self.hashes.lock();
            let writes = [
                h.by_agent_id
                    .set(info.agent_id, info.connection_id, value.clone()),
                h.by_project_id
                    .set(info.project_id, info.connection_id, value),
                h.connected_agents.set((), info.agent_id, Vec::new()),
            ];
            h.by_agent_id.forget(&info.agent_id, &info.connection_id);
            h.by_project_id.forget(&info.project_id, &info.connection_id);
            h.connected_agents.forget(&(), &info.agent_id);
            writes
        };
        future::try_join_all(writes).await?;
        Ok(())
    }

    pub async fn connections_by_agent_id(&self, agent_id: i64) -> Result<Connections, Error> {
        scan_connections(&self.by_agent_id, &agent_id).await
    }

    pub async fn connections_by_project_id(&self, project_id: i64) -> Result<Connections, Error> {
        scan_connections(&self.by_project_id, &project_id).await
    }

    pub async fn connected_agents_count(&self) -> Result<u64, Error> {
        self.connected_agents.len(&()).await
    }
}

async fn scan_connections(store: &HashStore<i64>, key: &i64) -> Result<Connections, Error> {
    let mut out = Connections::new();
    store
        .scan(key, |field, value| {
            match value.and_then(|v| ConnectedAgentInfo::decode(v.as_slice()).map_err(Error::from)) {
                Ok(info) => {
                    out.insert(info.connection_id, info);
                }
                Err(e) => warn!(field = ?field, error = %e, "Skipping invalid connection entry"),
            }
            false
        })
        .await?;
    Ok(out)
}
