//! Transport and credential error types.

use thiserror::Error;

/// Errors from a [`CredentialProvider`](crate::auth::CredentialProvider).
#[derive(Debug, Error)]
pub enum AuthError {
    /// No refresh token is configured, so a 401 cannot be recovered.
    #[error("no refresh token available")]
    NoRefreshToken,

    /// The refresh endpoint rejected the request.
    #[error("token refresh failed ({status}): {message}")]
    RefreshRejected {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// The refresh call itself failed.
    #[error("token refresh request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors raised by the streaming transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Network-level failure (connect, TLS, body read).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("server returned {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        message: String,
    },

    /// The server still answered 401 after one refresh-and-retry cycle.
    #[error("unauthorized: {message}")]
    Unauthorized {
        /// Response body, truncated.
        message: String,
    },

    /// Credentials could not be obtained or refreshed.
    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    /// A non-stream response body could not be decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The turn's cancellation token fired. Not a failure.
    #[error("stream aborted")]
    Aborted,
}

impl TransportError {
    /// Whether this is the cancellation condition rather than a failure.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// Error category for logging.
    pub fn category(&self) -> &str {
        match self {
            Self::Http(_) => "network",
            Self::Unauthorized { .. } | Self::Auth(_) => "auth",
            Self::Status { .. } => "http",
            Self::Json(_) => "parse",
            Self::Aborted => "aborted",
        }
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborted_is_distinguished() {
        assert!(TransportError::Aborted.is_aborted());
        assert_eq!(TransportError::Aborted.category(), "aborted");
        let status = TransportError::Status {
            status: 500,
            message: "boom".into(),
        };
        assert!(!status.is_aborted());
        assert_eq!(status.category(), "http");
    }

    #[test]
    fn auth_errors_categorize_as_auth() {
        let err: TransportError = AuthError::NoRefreshToken.into();
        assert_eq!(err.category(), "auth");
        assert_eq!(
            TransportError::Unauthorized {
                message: "expired".into()
            }
            .category(),
            "auth"
        );
    }

    #[test]
    fn display_includes_status() {
        let err = TransportError::Status {
            status: 502,
            message: "bad gateway".into(),
        };
        assert_eq!(err.to_string(), "server returned 502: bad gateway");
    }
}
