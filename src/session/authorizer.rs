//! Session authorizer: authenticates a connection with a credential token.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::api::{self, AuthorizeInfo};
use crate::connection::ConnectionManager;
use crate::error::AuthError;
use crate::models::mask_token;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authorizing,
    Authorized,
    Failed { retryable: bool },
}

/// Raised when the venue rejects a credential outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialInvalid {
    pub token: String,
    pub message: String,
}

/// Last identity the venue accepted.
#[derive(Debug, Clone)]
pub struct Identity {
    pub token: String,
    pub account: AuthorizeInfo,
}

pub struct SessionAuthorizer {
    conn: Arc<ConnectionManager>,
    timeout: Duration,
    attempt: tokio::sync::Mutex<()>,
    state_tx: watch::Sender<AuthState>,
    identity: Mutex<Option<Identity>>,
    invalid_tx: broadcast::Sender<CredentialInvalid>,
}

impl SessionAuthorizer {
    pub fn new(conn: Arc<ConnectionManager>, timeout: Duration) -> Self {
        let (state_tx, _) = watch::channel(AuthState::Unauthenticated);
        let (invalid_tx, _) = broadcast::channel(16);
        Self {
            conn,
            timeout,
            attempt: tokio::sync::Mutex::new(()),
            state_tx,
            identity: Mutex::new(None),
            invalid_tx,
        }
    }

    pub fn state(&self) -> AuthState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<AuthState> {
        self.state_tx.subscribe()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.identity.lock().clone()
    }

    /// Signals for rejected credentials. What to do about them is the
    /// subscriber's decision.
    pub fn credential_invalid(&self) -> broadcast::Receiver<CredentialInvalid> {
        self.invalid_tx.subscribe()
    }

    /// Authorize the connection with `token`.
    ///
    /// Only one attempt runs at a time; a concurrent call fails with
    /// [`AuthError::InFlight`]. Failures never clear the last good identity.
    pub async fn authorize(&self, token: &str) -> Result<AuthorizeInfo, AuthError> {
        let Ok(_attempt) = self.attempt.try_lock() else {
            return Err(AuthError::InFlight);
        };
        self.state_tx.send_replace(AuthState::Authorizing);

        let result = self
            .conn
            .request_timeout(api::authorize(token), self.timeout)
            .await
            .map_err(AuthError::from)
            .and_then(|msg| api::section::<AuthorizeInfo>(&msg, "authorize").map_err(AuthError::Rejected));

        match result {
            Ok(account) => {
                info!(
                    connection = %self.conn.label(),
                    account = %account.loginid,
                    currency = %account.currency,
                    balance = %account.balance,
                    "Authorized"
                );
                *self.identity.lock() = Some(Identity {
                    token: token.to_string(),
                    account: account.clone(),
                });
                self.state_tx.send_replace(AuthState::Authorized);
                Ok(account)
            }
            Err(err) => {
                warn!(
                    connection = %self.conn.label(),
                    token = %mask_token(token),
                    error = %err,
                    "Authorization failed"
                );
                if let AuthError::InvalidToken(message) = &err {
                    let _ = self.invalid_tx.send(CredentialInvalid {
                        token: token.to_string(),
                        message: message.clone(),
                    });
                }
                self.state_tx.send_replace(AuthState::Failed {
                    retryable: err.is_retryable(),
                });
                Err(err)
            }
        }
    }

    /// The transport went away; the venue forgets authorization with it.
    /// The identity is kept for re-authorization.
    pub fn reset(&self) {
        self.state_tx.send_replace(AuthState::Unauthenticated);
    }

    /// Forget the identity (logout).
    pub fn clear(&self) {
        *self.identity.lock() = None;
        self.state_tx.send_replace(AuthState::Unauthenticated);
    }
}
