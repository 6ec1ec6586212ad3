//! Shared-secret JWT authentication between kas instances.
//!
//! Tokens are HS256 with `iss` and `aud` both set to the server name. Each
//! outgoing call gets a fresh short-lived token; validation tolerates 30
//! seconds of clock skew.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::Status;
use tracing::debug;

use super::server::status_response;
use crate::auth::bearer_token;
use crate::errors::Error;

const TOKEN_LIFETIME: Duration = Duration::from_secs(5);
const LEEWAY_SECS: u64 = 30;

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    iss: String,
    aud: String,
    iat: u64,
    nbf: u64,
    exp: u64,
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Signs per-call credentials.
pub struct JwtSigner {
    key: EncodingKey,
    issuer: String,
    audience: String,
    lifetime: Duration,
    not_before_skew: Duration,
}

impl JwtSigner {
    pub fn new(secret: &[u8], issuer: &str, audience: &str) -> Self {
        Self {
            key: EncodingKey::from_secret(secret),
            issuer: issuer.to_string(),
            audience: audience.to_string(),
            lifetime: TOKEN_LIFETIME,
            not_before_skew: Duration::ZERO,
        }
    }

    /// Tokens valid for `lifetime`, and from `not_before_skew` in the past.
    #[must_use]
    pub fn with_lifetime(mut self, lifetime: Duration, not_before_skew: Duration) -> Self {
        self.lifetime = lifetime;
        self.not_before_skew = not_before_skew;
        self
    }

    pub fn token(&self) -> Result<String, Error> {
        let now = now_unix();
        let claims = Claims {
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now,
            nbf: now.saturating_sub(self.not_before_skew.as_secs()),
            exp: now + self.lifetime.as_secs(),
        };
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &self.key,
        )?)
    }

    /// Add `authorization: Bearer <jwt>` to outgoing metadata.
    pub fn authorize(&self, md: &mut MetadataMap) -> Result<(), Status> {
        let token = self
            .token()
            .map_err(|e| Status::internal(format!("failed to sign JWT: {e}")))?;
        let value = MetadataValue::try_from(format!("Bearer {token}"))
            .map_err(|e| Status::internal(format!("invalid JWT header: {e}")))?;
        md.insert("authorization", value);
        Ok(())
    }
}

/// Validates incoming credentials.
#[derive(Clone)]
pub struct JwtValidator {
    key: Arc<DecodingKey>,
    validation: Arc<Validation>,
}

impl JwtValidator {
    pub fn new(secret: &[u8], issuer: &str, audience: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = LEEWAY_SECS;
        validation.validate_nbf = true;
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);
        Self {
            key: Arc::new(DecodingKey::from_secret(secret)),
            validation: Arc::new(validation),
        }
    }

    pub fn validate(&self, token: &str) -> Result<(), Status> {
        jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)
            .map(|_| ())
            .map_err(|e| {
                debug!(error = %e, "JWT validation failed");
                Status::unauthenticated("JWT validation failed")
            })
    }
}

/// Axum middleware: reject requests without a valid JWT bearer token.
pub async fn require_jwt(
    State(validator): State<JwtValidator>,
    request: Request,
    next: Next,
) -> Response {
    let token = match bearer_token(request.headers()) {
        Ok(token) => token,
        Err(status) => return status_response(status),
    };
    if let Err(status) = validator.validate(&token) {
        return status_response(status);
    }
    next.run(request).await
}
