//! Error taxonomy shared by the token manager, the upload engine, the poller and the store.
//!
//! Callers match on [`UploadError`] to decide what to do next: [`UploadError::is_retryable`]
//! separates failures worth another attempt (transient network trouble, quota) from the ones
//! that need a human (authentication) or that must never be retried (integrity).

use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::time::Duration;

/// Credential problems that cannot be fixed without the resource owner.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// There is no refresh token; the interactive consent flow must be run first.
    #[error("not authenticated to YouTube; run the OAuth consent flow first")]
    NotAuthenticated,
    /// The identity provider answered `invalid_grant` for the stored refresh token.
    #[error("stored refresh token was rejected by the identity provider")]
    RefreshRejected,
    /// The API refused the access token even after a refresh.
    #[error("access token rejected: {0}")]
    Unauthorized(String),
    /// The authorization-code flow failed (bad state, missing code, exchange error).
    #[error("OAuth flow failed: {0}")]
    Flow(String),
}

/// Failures of the local persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("read state file {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("write state file {}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parse state file {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("serialize state")]
    Serialize(#[source] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Network error, timeout, or 5xx. Retryable with bounded backoff.
    #[error("transient network failure: {0}")]
    Transient(String),

    /// Byte accounting does not add up. Fatal, never retried.
    #[error("upload integrity violation: {0}")]
    Integrity(String),

    /// Remote rate limit or quota. Retry after the provider's delay, if any.
    #[error("YouTube quota exceeded: {message}")]
    Quota {
        retry_after: Option<Duration>,
        message: String,
    },

    /// The remote resource vanished (for example deleted on YouTube).
    #[error("not found on YouTube: {0}")]
    NotFound(String),

    #[error("YouTube API request failed with status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("local I/O failure: {0}")]
    Local(#[from] io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("attachment {0} already has an upload in progress")]
    AlreadyUploading(u64),

    #[error("upload cancelled")]
    Cancelled,

    /// The server answered something the resumable protocol does not allow.
    #[error("unexpected response from YouTube: {0}")]
    Protocol(String),
}

/// Stable, serializable name of an error class, used for the persisted last-error record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Auth,
    Transient,
    Integrity,
    Quota,
    NotFound,
    Api,
    Local,
    Config,
    Store,
    AlreadyUploading,
    Cancelled,
    Protocol,
}

impl UploadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            UploadError::Auth(_) => ErrorKind::Auth,
            UploadError::Transient(_) => ErrorKind::Transient,
            UploadError::Integrity(_) => ErrorKind::Integrity,
            UploadError::Quota { .. } => ErrorKind::Quota,
            UploadError::NotFound(_) => ErrorKind::NotFound,
            UploadError::Api { .. } => ErrorKind::Api,
            UploadError::Local(_) => ErrorKind::Local,
            UploadError::Config(_) => ErrorKind::Config,
            UploadError::Store(_) => ErrorKind::Store,
            UploadError::AlreadyUploading(_) => ErrorKind::AlreadyUploading,
            UploadError::Cancelled => ErrorKind::Cancelled,
            UploadError::Protocol(_) => ErrorKind::Protocol,
        }
    }

    /// Whether another attempt at the same request may succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UploadError::Transient(_) | UploadError::Quota { .. })
    }

    /// Whether the failure leaves the remote side intact and should only be reported.
    pub fn is_recoverable(&self) -> bool {
        self.is_retryable() || matches!(self, UploadError::NotFound(_))
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            UploadError::Protocol(e.to_string())
        } else if e.is_builder() {
            UploadError::Config(e.to_string())
        } else {
            // connect, timeout, body and request errors all mean the exchange did not finish
            UploadError::Transient(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(UploadError::Transient("reset".into()).is_retryable());
        assert!(
            UploadError::Quota {
                retry_after: None,
                message: "quotaExceeded".into()
            }
            .is_retryable()
        );
        assert!(!UploadError::Integrity("short".into()).is_retryable());
        assert!(!UploadError::Auth(AuthError::NotAuthenticated).is_retryable());
        assert!(UploadError::NotFound("abc".into()).is_recoverable());
        assert!(!UploadError::Cancelled.is_recoverable());
    }

    #[test]
    fn kind_serializes_snake_case() {
        let kind = UploadError::AlreadyUploading(7).kind();
        assert_eq!(serde_json::to_string(&kind).unwrap(), "\"already_uploading\"");
    }
}
