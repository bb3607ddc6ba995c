//! Error types for triggr

use thiserror::Error;

/// Main error type for triggr operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// GitHub API error; `status` is None for transport-level failures
    #[error("github error{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
    GitHub {
        /// HTTP status returned by GitHub, if a response was received
        status: Option<reqwest::StatusCode>,
        /// Error detail, from the response body where available
        message: String,
    },

    /// Task manifest missing or undecodable
    #[error("manifest error: {0}")]
    Manifest(String),

    /// Workload name collision on submission (duplicate dispatch)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Programmer bugs and invariant violations
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a manifest error with the given message
    pub fn manifest(msg: impl Into<String>) -> Self {
        Self::Manifest(msg.into())
    }

    /// Create a conflict error with the given message
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a GitHub error from a response status and body
    pub fn github(status: reqwest::StatusCode, msg: impl Into<String>) -> Self {
        Self::GitHub {
            status: Some(status),
            message: msg.into(),
        }
    }

    /// Whether retrying the failed operation can reasonably succeed.
    ///
    /// Transport failures and 5xx responses are transient; 4xx responses,
    /// manifest problems, and name conflicts are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::GitHub { status, .. } => match status {
                Some(code) => code.is_server_error(),
                None => true,
            },
            Error::Kube(kube::Error::Api(ae)) => ae.code >= 500,
            Error::Kube(_) => true,
            Error::Manifest(_) | Error::Conflict(_) | Error::Internal(_) => false,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::GitHub {
            status: err.status(),
            message: err.to_string(),
        }
    }
}
