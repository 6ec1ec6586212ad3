//! Library error type and its translation to gRPC statuses.

use tonic::{Code, Status};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration: {0}")]
    Config(String),

    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("transport: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("jwt: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// GitLab answered with a 4xx status.
    #[error("gitlab: HTTP {status}: {message}")]
    GitlabClient { status: u16, message: String },

    /// GitLab could not be reached or answered with a 5xx status.
    #[error("gitlab: {0}")]
    GitlabUnavailable(String),

    #[error("invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("decode: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn invalid_url(url: &str, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    /// User errors are the caller's fault. They are logged at info and never
    /// captured.
    pub fn is_user_error(&self) -> bool {
        matches!(self, Self::GitlabClient { .. })
    }
}

/// Translate an error into the status a handler returns.
///
/// | Source                          | Code               |
/// |---------------------------------|--------------------|
/// | GitLab 401                      | `Unauthenticated`  |
/// | GitLab 403                      | `PermissionDenied` |
/// | GitLab 404                      | `NotFound`         |
/// | other 4xx                       | `FailedPrecondition` |
/// | GitLab 5xx, transport, store    | `Unavailable`      |
pub fn to_status(err: &Error) -> Status {
    match err {
        Error::GitlabClient { status: 401, .. } => Status::unauthenticated("unauthenticated"),
        Error::GitlabClient { status: 403, .. } => Status::permission_denied("forbidden"),
        Error::GitlabClient { status: 404, .. } => Status::not_found("agent not found"),
        Error::GitlabClient { message, .. } => Status::failed_precondition(message.clone()),
        Error::Config(_) | Error::InvalidUrl { .. } | Error::Decode(_) | Error::Metrics(_) => {
            Status::internal(err.to_string())
        }
        Error::Redis(_)
        | Error::Transport(_)
        | Error::Jwt(_)
        | Error::GitlabUnavailable(_)
        | Error::Io(_) => Status::unavailable("unavailable"),
    }
}

/// Whether a status is the result of the caller going away or running out of
/// time. Such statuses are never captured.
pub fn is_cancellation(status: &Status) -> bool {
    matches!(status.code(), Code::Cancelled | Code::DeadlineExceeded)
}

/// Whether a status reflects a problem with the caller's input.
pub fn is_user_status(status: &Status) -> bool {
    matches!(
        status.code(),
        Code::InvalidArgument
            | Code::FailedPrecondition
            | Code::Unauthenticated
            | Code::PermissionDenied
            | Code::NotFound
    )
}
