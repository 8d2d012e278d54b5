//! Error types for the authenticated request pipeline

use std::time::Duration;

/// Failure of a request that never produced an HTTP response.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout(e.to_string())
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else {
            TransportError::Other(e.to_string())
        }
    }
}

/// Why a refresh cycle failed.
///
/// `Clone` because one failure is delivered to the driving request and to
/// every request queued behind it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    #[error("refresh executor failed: {0}")]
    Executor(String),

    #[error("no refresh credential available")]
    MissingCredential,

    #[error("refresh did not complete within {0:?}")]
    Timeout(Duration),

    #[error("no refresh executor configured")]
    NotConfigured,

    #[error("credential store error: {0}")]
    Store(String),

    #[error("refresh cycle abandoned before it settled")]
    Abandoned,
}

impl From<session_auth::Error> for RefreshError {
    fn from(e: session_auth::Error) -> Self {
        match e {
            session_auth::Error::Io(msg) | session_auth::Error::CredentialParse(msg) => {
                RefreshError::Store(msg)
            }
            other => RefreshError::Executor(other.to_string()),
        }
    }
}

/// Errors surfaced to callers of `SessionClient`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("request unauthorized after credential refresh")]
    Unauthorized,

    #[error("credential refresh failed: {0}")]
    RefreshFailed(#[from] RefreshError),

    #[error("request failed with status {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("response decode error: {0}")]
    Decode(String),
}

/// Result alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;
