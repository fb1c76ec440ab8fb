//! Error taxonomy for remote calls.

use thiserror::Error;

/// Failure of a dispatch or of a composite operation built on top of it.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Authentication was requested but no key was available.
    #[error("Missing API key.")]
    CredentialMissing,

    /// Transport failure before any response arrived.
    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("GW2 API error {status}: {body}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body text, or the canonical reason when the body was empty.
        body: String,
    },

    /// The body was not JSON, or not the JSON shape the endpoint promises.
    #[error("malformed response: {0}")]
    Parse(#[source] serde_json::Error),

    /// A required argument was empty.
    #[error("{0}")]
    InvalidInput(String),

    /// The request path could not be joined onto the base URL.
    #[error("invalid request url: {0}")]
    InvalidUrl(String),

    /// The caller cancelled before the result was committed.
    #[error("request superseded")]
    Cancelled,
}

impl ApiError {
    /// HTTP status for [`ApiError::Http`] failures.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether this failure came from the dispatcher itself, as opposed to
    /// caller-side validation or cancellation.
    pub fn is_dispatch_failure(&self) -> bool {
        matches!(
            self,
            ApiError::CredentialMissing
                | ApiError::Network(_)
                | ApiError::Http { .. }
                | ApiError::Parse(_)
        )
    }
}

/// Result alias for API operations.
pub type Result<T> = std::result::Result<T, ApiError>;
