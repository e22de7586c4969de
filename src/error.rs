//! Errors shared by every component that talks to the venue.

use thiserror::Error;

use crate::api::StreamKind;

/// Error code the venue returns for a revoked or unknown credential.
pub const INVALID_TOKEN: &str = "InvalidToken";

/// Failure of a single request/response exchange with the venue.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ApiError {
    #[error("transport is not open")]
    NotConnected,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error("venue rejected request ({code}): {message}")]
    Venue { code: String, message: String },

    #[error("malformed response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Venue error code, when the venue produced one.
    pub fn code(&self) -> Option<&str> {
        match self {
            ApiError::Venue { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }

    pub fn is_invalid_token(&self) -> bool {
        self.code() == Some(INVALID_TOKEN)
    }

    /// Failures caused by the link itself rather than by the request.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ApiError::NotConnected | ApiError::Transport(_) | ApiError::Timeout
        )
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Decode(err.to_string())
    }
}

/// Failure to establish a transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("connection attempt timed out")]
    Timeout,

    #[error("connection manager has been shut down")]
    Shutdown,
}

/// Outcome of a failed authorization attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("an authorization attempt is already in flight")]
    InFlight,

    #[error("authorization timed out")]
    Timeout,

    #[error("credential rejected by venue: {0}")]
    InvalidToken(String),

    #[error("authorization failed: {0}")]
    Rejected(ApiError),
}

impl AuthError {
    /// Transient failures leave identity state untouched and may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            AuthError::InFlight | AuthError::Timeout => true,
            AuthError::InvalidToken(_) => false,
            AuthError::Rejected(err) => err.is_transport(),
        }
    }
}

impl From<ApiError> for AuthError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Timeout => AuthError::Timeout,
            ApiError::Venue { ref code, ref message } if code == INVALID_TOKEN => {
                AuthError::InvalidToken(message.clone())
            }
            other => AuthError::Rejected(other),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("{0} stream is already subscribed")]
    AlreadyActive(StreamKind),

    #[error("subscription was torn down before it became active")]
    Stale,

    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Failure to bring a session to the ready state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("no credential to authorize with")]
    NoCredential,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl SessionError {
    /// Failures that reconnecting will not fix (bad or missing credential).
    pub fn is_unrecoverable(&self) -> bool {
        match self {
            SessionError::NoCredential => true,
            SessionError::Auth(err) => !err.is_retryable(),
            _ => false,
        }
    }
}

/// Failure of one replica attempt on one subordinate.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplicationError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("proposal/buy round trip timed out")]
    Timeout,

    #[error("computed stake {0} is too small to place")]
    StakeTooSmall(rust_decimal::Decimal),

    #[error("subordinate is not connected")]
    NotConnected,

    #[error("unexpected response: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_token_classification() {
        let err = ApiError::Venue {
            code: INVALID_TOKEN.to_string(),
            message: "The token is invalid.".to_string(),
        };
        assert!(err.is_invalid_token());
        assert!(!err.is_transport());

        assert!(!ApiError::Timeout.is_invalid_token());
        assert!(ApiError::Timeout.is_transport());
        assert_eq!(ApiError::NotConnected.code(), None);
    }

    #[test]
    fn test_auth_error_from_api() {
        let invalid = AuthError::from(ApiError::Venue {
            code: INVALID_TOKEN.to_string(),
            message: "bad".to_string(),
        });
        assert_eq!(invalid, AuthError::InvalidToken("bad".to_string()));
        assert!(!invalid.is_retryable());

        assert_eq!(AuthError::from(ApiError::Timeout), AuthError::Timeout);
        assert!(AuthError::from(ApiError::NotConnected).is_retryable());

        let other = AuthError::from(ApiError::Venue {
            code: "AuthorizationRequired".to_string(),
            message: String::new(),
        });
        assert!(!other.is_retryable());
    }
}
