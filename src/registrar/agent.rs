use tokio_util::sync::CancellationToken;
use tonic::codec::ProstCodec;
use tonic::metadata::MetadataMap;
use tonic::transport::Channel;
use tonic::Status;
use tracing::{debug, warn};

use super::{AgentMeta, RegisterRequest, RegisterResponse, REGISTER_METHOD};
use crate::grpc::ClientStream;
use crate::retry::{poll_with_backoff, Attempt, PollConfig};

/// Agent side: call `Register` every period until cancelled.
pub struct Registrar {
    kas: Channel,
    agent_token: String,
    agent_meta: AgentMeta,
    pod_id: i64,
    poll_config: PollConfig,
}

impl Registrar {
    pub fn new(
        kas: Channel,
        agent_token: String,
        agent_meta: AgentMeta,
        pod_id: i64,
        poll_config: PollConfig,
    ) -> Self {
        Self {
            kas,
            agent_token,
            agent_meta,
            pod_id,
            poll_config,
        }
    }

    pub async fn run(&self, ctx: CancellationToken) {
        poll_with_backoff(&ctx, self.poll_config, || async move {
            match self.register().await {
                Ok(()) => {
                    debug!("Registered agent");
                    Attempt::Continue
                }
                Err(e) => {
                    warn!(error = %e, "Failed to register agent");
                    Attempt::Backoff
                }
            }
        })
        .await;
    }

    pub async fn register(&self) -> Result<(), Status> {
        let mut md = MetadataMap::new();
        let bearer = format!("Bearer {}", self.agent_token)
            .parse()
            .map_err(|_| Status::invalid_argument("agent token is not valid metadata"))?;
        md.insert("authorization", bearer);
        let (mut tx, pending) = ClientStream::<RegisterRequest, RegisterResponse>::start(
            self.kas.clone(),
            REGISTER_METHOD,
            md,
            ProstCodec::default(),
        )?;
        let req = RegisterRequest {
            agent_meta: Some(self.agent_meta.clone()),
            pod_id: self.pod_id,
        };
        let sent = tx.send(req).await;
        tx.close_send();
        let (_, mut rx) = pending.await?;
        match rx.recv().await? {
            Some(RegisterResponse {}) => Ok(()),
            None if sent.is_err() => Err(Status::unavailable("Register(): stream closed")),
            None => Err(Status::internal("Register(): empty response")),
        }
    }
}
