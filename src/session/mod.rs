//! Sessions: an authorized, subscribed connection to the venue.

mod accounts;
mod authorizer;
mod readiness;

pub use accounts::{AccountStore, KnownAccount};
pub use authorizer::{AuthState, CredentialInvalid, Identity, SessionAuthorizer};
pub use readiness::{ReadinessFlags, TradingReadiness};

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{self, ActiveSymbol, AuthorizeInfo, StreamKind};
use crate::config::AppConfig;
use crate::connection::{send_with_retry, ConnectionManager, RateLimiter, RetryPolicy, TransportState, FATAL_CODES};
use crate::error::{ApiError, SessionError};
use crate::events::{EventNormalizer, TradeEvent};

/// What a session subscribes to once authorized.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub streams: Vec<StreamKind>,
    pub load_symbols: bool,
}

impl SessionOptions {
    /// Master: every stream plus symbol metadata.
    pub fn master() -> Self {
        Self {
            streams: vec![StreamKind::Balance, StreamKind::Transaction, StreamKind::OpenContract],
            load_symbols: true,
        }
    }

    /// Subordinate: balance and contract streams, no symbol metadata.
    pub fn subordinate() -> Self {
        Self {
            streams: vec![StreamKind::Balance, StreamKind::Transaction, StreamKind::OpenContract],
            load_symbols: false,
        }
    }
}

/// One session on one connection.
///
/// Lifecycle: created at bootstrap, replaced on credential switch,
/// destroyed on logout. Normalized events are delivered on the receiver
/// returned by [`Session::new`].
pub struct Session {
    label: String,
    conn: Arc<ConnectionManager>,
    authorizer: SessionAuthorizer,
    readiness: TradingReadiness,
    options: SessionOptions,
    this: Weak<Session>,

    token: Mutex<Option<String>>,
    symbols: Mutex<Vec<ActiveSymbol>>,
    normalizer: Arc<Mutex<EventNormalizer>>,
    events: mpsc::UnboundedSender<TradeEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    pub fn new(
        conn: Arc<ConnectionManager>,
        config: &AppConfig,
        options: SessionOptions,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TradeEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let authorizer = SessionAuthorizer::new(Arc::clone(&conn), config.authorize_timeout);
        let session = Arc::new_cyclic(|this| Self {
            label: conn.label().to_string(),
            conn,
            authorizer,
            readiness: TradingReadiness::new(),
            options,
            this: this.clone(),
            token: Mutex::new(None),
            symbols: Mutex::new(Vec::new()),
            normalizer: Arc::new(Mutex::new(EventNormalizer::new())),
            events,
            tasks: Mutex::new(Vec::new()),
        });
        (session, rx)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.conn
    }

    pub fn authorizer(&self) -> &SessionAuthorizer {
        &self.authorizer
    }

    pub fn readiness(&self) -> &TradingReadiness {
        &self.readiness
    }

    pub fn is_ready(&self) -> bool {
        self.readiness.is_ready()
    }

    pub fn account(&self) -> Option<AuthorizeInfo> {
        self.authorizer.identity().map(|i| i.account)
    }

    pub fn token(&self) -> Option<String> {
        self.token.lock().clone()
    }

    pub fn symbols(&self) -> Vec<ActiveSymbol> {
        self.symbols.lock().clone()
    }

    /// Open the connection, authorize with `token`, subscribe and load
    /// metadata. Starts the supervisor and the health check.
    pub async fn start(&self, token: &str) -> Result<AuthorizeInfo, SessionError> {
        self.conn.init(false).await?;
        self.readiness.set_transport_open(self.conn.is_open());
        *self.token.lock() = Some(token.to_string());

        let info = self.bootstrap().await?;

        let mut tasks = self.tasks.lock();
        if tasks.is_empty() {
            tasks.push(self.spawn_supervisor());
            tasks.push(self.conn.spawn_health_check());
        }
        Ok(info)
    }

    /// Replace the credential on the same transport: tear down every
    /// subscription, authorize with `token`, and subscribe again.
    pub async fn switch_credential(&self, token: &str) -> Result<AuthorizeInfo, SessionError> {
        info!(session = %self.label, "Switching credential");
        self.readiness.set_subscriptions_active(false);
        self.conn.teardown_subscriptions().await;
        *self.token.lock() = Some(token.to_string());
        self.bootstrap().await
    }

    /// Venue call through the generic retry helper.
    pub async fn call(&self, payload: Value, policy: RetryPolicy) -> Result<Value, ApiError> {
        send_with_retry(&self.conn, &payload, FATAL_CODES, policy, None).await
    }

    /// Like [`Session::call`], with every attempt spaced by `limiter`.
    pub async fn call_paced(
        &self,
        payload: Value,
        policy: RetryPolicy,
        limiter: &RateLimiter,
    ) -> Result<Value, ApiError> {
        send_with_retry(&self.conn, &payload, FATAL_CODES, policy, Some(limiter)).await
    }

    /// Ask for the balance outright instead of waiting for a push.
    pub async fn refresh_balance(&self) -> Result<(), ApiError> {
        let msg = self.conn.request(api::balance()).await?;
        let events = self.normalizer.lock().normalize(StreamKind::Balance, &msg);
        for event in events {
            let _ = self.events.send(event);
        }
        Ok(())
    }

    /// Logout: stop background work, forget subscriptions, close.
    pub async fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.conn.close().await;
        self.authorizer.clear();
        self.readiness.set_authorized(false);
        self.readiness.set_subscriptions_active(false);
        self.readiness.set_transport_open(false);
        info!(session = %self.label, "Session closed");
    }

    /// Authorize with the current token, subscribe, load metadata.
    async fn bootstrap(&self) -> Result<AuthorizeInfo, SessionError> {
        let token = self.token().ok_or(SessionError::NoCredential)?;

        let info = self.authorizer.authorize(&token).await?;
        self.normalizer.lock().set_account(&info.loginid, &info.currency);
        self.readiness.set_authorized(true);

        for stream in self.options.streams.clone() {
            let rx = self.conn.subscribe(stream).await?;
            self.spawn_forwarder(stream, rx);
        }
        self.readiness.set_subscriptions_active(true);

        if !self.options.load_symbols {
            self.readiness.set_symbols_loaded(true);
        } else if self.symbols.lock().is_empty() {
            let msg = self.conn.request(api::active_symbols()).await?;
            let symbols: Vec<ActiveSymbol> = api::section(&msg, "active_symbols")?;
            debug!(session = %self.label, count = symbols.len(), "Symbols loaded");
            *self.symbols.lock() = symbols;
            self.readiness.set_symbols_loaded(true);
        }

        Ok(info)
    }

    fn spawn_forwarder(&self, stream: StreamKind, mut rx: mpsc::UnboundedReceiver<Value>) {
        let normalizer = Arc::clone(&self.normalizer);
        let events = self.events.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let batch = normalizer.lock().normalize(stream, &msg);
                for event in batch {
                    if events.send(event).is_err() {
                        return;
                    }
                }
            }
        });
    }

    /// Mirrors transport state into readiness and re-bootstraps on every
    /// new connection generation.
    fn spawn_supervisor(&self) -> JoinHandle<()> {
        let this = self.this.clone();
        let mut state_rx = self.conn.watch_state();
        let mut generation_rx = self.conn.watch_generation();
        let mut seen_generation = *generation_rx.borrow_and_update();
        state_rx.borrow_and_update();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let open = *state_rx.borrow_and_update() == TransportState::Open;
                        let Some(session) = this.upgrade() else { return };
                        session.readiness.set_transport_open(open);
                        if !open {
                            session.readiness.set_subscriptions_active(false);
                            session.readiness.set_authorized(false);
                            session.authorizer.reset();
                        }
                    }
                    changed = generation_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let generation = *generation_rx.borrow_and_update();
                        if generation == seen_generation {
                            continue;
                        }
                        seen_generation = generation;
                        let Some(session) = this.upgrade() else { return };
                        info!(session = %session.label, generation, "Transport reopened, restoring session");
                        if let Err(e) = session.bootstrap().await {
                            warn!(session = %session.label, error = %e, "Session restore failed");
                        }
                    }
                }
            }
        })
    }
}
