//! Agent token resolution against GitLab.
//!
//! kas never validates agent tokens itself. Every token is sent to GitLab's
//! internal API, which answers with the agent's identity. Answers are cached
//! per token: successes for `info_cache_ttl`, client errors (the token is
//! bad) for `info_cache_error_ttl`. Transport and server errors are not
//! cached.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, StatusCode};
use http_body_util::{BodyExt, Empty};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::errors::Error;
use crate::grpc::jwt::JwtSigner;

pub const AGENT_INFO_PATH: &str = "/api/v4/internal/kubernetes/agent_info";
/// Carries the kas-to-GitLab JWT.
pub const JWT_REQUEST_HEADER: &str = "Gitlab-Kas-Api-Request";

const JWT_ISSUER: &str = "gitlab-kas";
const JWT_AUDIENCE: &str = "gitlab";
const JWT_VALID_FOR: Duration = Duration::from_secs(30);
const JWT_NOT_BEFORE: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

/// Identity of an agent, as returned by GitLab.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    #[serde(rename = "agent_id")]
    pub id: i64,
    pub project_id: i64,
    #[serde(rename = "agent_name")]
    pub name: String,
    #[serde(default)]
    pub default_branch: String,
    /// Opaque to kas.
    #[serde(default, rename = "gitaly_repository")]
    pub repository: serde_json::Value,
}

#[async_trait]
pub trait AgentInfoResolver: Send + Sync {
    async fn get_agent_info(&self, agent_token: &str) -> Result<AgentInfo, Error>;
}

/// Client for GitLab's internal API.
pub struct GitlabClient {
    base: String,
    http: Client<HttpConnector, Empty<Bytes>>,
    signer: JwtSigner,
}

impl GitlabClient {
    pub fn new(address: &str, auth_secret: &[u8]) -> Result<Self, Error> {
        if !address.starts_with("http://") {
            return Err(Error::config(format!(
                "gitlab.address must be an http:// URL, got {address}"
            )));
        }
        Ok(Self {
            base: address.trim_end_matches('/').to_string(),
            http: Client::builder(TokioExecutor::new()).build_http(),
            signer: JwtSigner::new(auth_secret, JWT_ISSUER, JWT_AUDIENCE)
                .with_lifetime(JWT_VALID_FOR, JWT_NOT_BEFORE),
        })
    }
}

#[async_trait]
impl AgentInfoResolver for GitlabClient {
    async fn get_agent_info(&self, agent_token: &str) -> Result<AgentInfo, Error> {
        let url = format!("{}{AGENT_INFO_PATH}", self.base);
        let request = Request::get(&url)
            .header("authorization", format!("Bearer {agent_token}"))
            .header(JWT_REQUEST_HEADER, self.signer.token()?)
            .header("accept", "application/json")
            .body(Empty::<Bytes>::new())
            .map_err(|e| Error::GitlabUnavailable(e.to_string()))?;

        let response = tokio::time::timeout(REQUEST_TIMEOUT, self.http.request(request))
            .await
            .map_err(|_| Error::GitlabUnavailable("request timed out".to_string()))?
            .map_err(|e| Error::GitlabUnavailable(e.to_string()))?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| Error::GitlabUnavailable(e.to_string()))?
            .to_bytes();
        debug!(url, status = status.as_u16(), "GitLab agent_info response");

        if status == StatusCode::OK {
            return serde_json::from_slice(&body)
                .map_err(|e| Error::GitlabUnavailable(format!("invalid agent_info response: {e}")));
        }
        if status.is_client_error() {
            return Err(Error::GitlabClient {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).trim().to_string(),
            });
        }
        Err(Error::GitlabUnavailable(format!("HTTP {status}")))
    }
}

#[derive(Clone)]
enum Cached {
    Info(AgentInfo),
    ClientError { status: u16, message: String },
}

struct Slot {
    value: Option<(Cached, Instant)>,
}

/// Token-keyed cache in front of a resolver. Concurrent lookups of one token
/// share a single upstream request.
pub struct AgentInfoCache {
    delegate: Arc<dyn AgentInfoResolver>,
    ttl: Duration,
    error_ttl: Duration,
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Slot>>>>,
}

impl AgentInfoCache {
    pub fn new(delegate: Arc<dyn AgentInfoResolver>, ttl: Duration, error_ttl: Duration) -> Self {
        Self {
            delegate,
            ttl,
            error_ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, token: &str) -> Arc<tokio::sync::Mutex<Slot>> {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(token) {
            return slot.clone();
        }
        // drop expired entries nobody is waiting on
        let now = Instant::now();
        slots.retain(|_, slot| match slot.try_lock() {
            Ok(s) => s.value.as_ref().is_some_and(|(_, exp)| *exp > now),
            Err(_) => true,
        });
        let slot = Arc::new(tokio::sync::Mutex::new(Slot { value: None }));
        slots.insert(token.to_string(), slot.clone());
        slot
    }
}

#[async_trait]
impl AgentInfoResolver for AgentInfoCache {
    async fn get_agent_info(&self, agent_token: &str) -> Result<AgentInfo, Error> {
        let slot = self.slot(agent_token);
        let mut slot = slot.lock().await;
        if let Some((cached, expires)) = &slot.value {
            if *expires > Instant::now() {
                return match cached.clone() {
                    Cached::Info(info) => Ok(info),
                    Cached::ClientError { status, message } => {
                        Err(Error::GitlabClient { status, message })
                    }
                };
            }
        }
        match self.delegate.get_agent_info(agent_token).await {
            Ok(info) => {
                slot.value = Some((Cached::Info(info.clone()), Instant::now() + self.ttl));
                Ok(info)
            }
            Err(Error::GitlabClient { status, message }) => {
                slot.value = Some((
                    Cached::ClientError {
                        status,
                        message: message.clone(),
                    },
                    Instant::now() + self.error_ttl,
                ));
                Err(Error::GitlabClient { status, message })
            }
            Err(e) => {
                slot.value = None;
                Err(e)
            }
        }
    }
}
