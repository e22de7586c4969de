//! Connection manager: owns one venue transport and everything multiplexed
//! over it (request correlation, push subscriptions, failover, reconnect).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::failover::FailoverList;
use super::subscriptions::SubscriptionRegistry;
use super::transport::{Connector, Frame};
use crate::api::{self, StreamKind};
use crate::config::AppConfig;
use crate::error::{ApiError, SubscriptionError, TransportError};

/// Bound on a `forget` issued during teardown.
const FORGET_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub endpoints: Vec<String>,
    pub app_id: String,
    pub health_check_interval: Duration,
    pub reconnect_debounce: Duration,
    pub max_reconnect_delay: Duration,
}

impl From<&AppConfig> for ConnectionConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            endpoints: config.endpoints.clone(),
            app_id: config.app_id.clone(),
            health_check_interval: config.health_check_interval,
            reconnect_debounce: config.reconnect_debounce,
            max_reconnect_delay: config.max_reconnect_delay,
        }
    }
}

struct Link {
    generation: u64,
    outbound: mpsc::UnboundedSender<String>,
}

enum PendingKind {
    Request,
    Subscribe {
        stream: StreamKind,
        epoch: u64,
        sink: mpsc::UnboundedSender<Value>,
    },
}

struct Pending {
    generation: u64,
    kind: PendingKind,
    tx: oneshot::Sender<Result<Value, ApiError>>,
}

/// One venue connection.
///
/// Each successful open starts a new generation. Requests and subscriptions
/// are bound to the generation they were sent on; frames from an older
/// generation are discarded.
pub struct ConnectionManager {
    label: String,
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    this: Weak<ConnectionManager>,

    /// Serializes `init` and `close`
    init_lock: tokio::sync::Mutex<()>,
    link: Mutex<Option<Link>>,
    generation: AtomicU64,
    failover: Mutex<FailoverList>,
    state_tx: watch::Sender<TransportState>,
    generation_tx: watch::Sender<u64>,

    pending: Mutex<HashMap<u64, Pending>>,
    next_req_id: AtomicU64,
    registry: Mutex<SubscriptionRegistry>,

    backoff: Mutex<ExponentialBackoff>,
    reconnect_scheduled: AtomicBool,
    shutdown: AtomicBool,
}

impl ConnectionManager {
    pub fn new(
        label: impl Into<String>,
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        let backoff = reconnect_backoff(&config);
        let failover = FailoverList::new(config.endpoints.clone());
        let (state_tx, _) = watch::channel(TransportState::Idle);
        let (generation_tx, _) = watch::channel(0);

        Arc::new_cyclic(|this| Self {
            label: label.into(),
            config,
            connector,
            this: this.clone(),
            init_lock: tokio::sync::Mutex::new(()),
            link: Mutex::new(None),
            generation: AtomicU64::new(0),
            failover: Mutex::new(failover),
            state_tx,
            generation_tx,
            pending: Mutex::new(HashMap::new()),
            next_req_id: AtomicU64::new(1),
            registry: Mutex::new(SubscriptionRegistry::new()),
            backoff: Mutex::new(backoff),
            reconnect_scheduled: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> TransportState {
        *self.state_tx.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == TransportState::Open
    }

    pub fn watch_state(&self) -> watch::Receiver<TransportState> {
        self.state_tx.subscribe()
    }

    /// Changes every time a new transport opens.
    pub fn watch_generation(&self) -> watch::Receiver<u64> {
        self.generation_tx.subscribe()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn failover_index(&self) -> usize {
        self.failover.lock().index()
    }

    pub fn active_streams(&self) -> Vec<StreamKind> {
        self.registry.lock().active_streams()
    }

    /// Ensure an open transport.
    ///
    /// Without `force` a healthy transport is reused as is. With `force`
    /// subscriptions are torn down and the transport is replaced by a new
    /// one against the current failover candidate. After [`close`](Self::close)
    /// only a forced init reopens.
    pub async fn init(&self, force: bool) -> Result<(), TransportError> {
        let _guard = self.init_lock.lock().await;

        if force {
            self.shutdown.store(false, Ordering::SeqCst);
        } else if self.shutdown.load(Ordering::SeqCst) {
            return Err(TransportError::Shutdown);
        }

        if !force && self.is_open() {
            return Ok(());
        }

        if self.link.lock().is_some() {
            self.teardown_subscriptions().await;
            self.drop_link("replaced");
        }

        self.open().await
    }

    /// Shut down for good: forget subscriptions and close the transport.
    /// No reconnect is scheduled afterwards.
    pub async fn close(&self) {
        let _guard = self.init_lock.lock().await;
        self.shutdown.store(true, Ordering::SeqCst);
        self.teardown_subscriptions().await;
        self.drop_link("closed");
        info!(connection = %self.label, "Connection closed");
    }

    /// Send a request and wait for its response.
    pub async fn request(&self, payload: Value) -> Result<Value, ApiError> {
        self.dispatch(payload, PendingKind::Request, None).await
    }

    /// Send a request, failing with [`ApiError::Timeout`] if no response
    /// arrives within `limit`. The correlation is dropped on expiry so a
    /// late response is discarded.
    pub async fn request_timeout(&self, payload: Value, limit: Duration) -> Result<Value, ApiError> {
        self.dispatch(payload, PendingKind::Request, Some(limit)).await
    }

    /// Subscribe to a push stream. The first response and every later push
    /// are delivered on the returned channel, which ends on teardown.
    pub async fn subscribe(
        &self,
        stream: StreamKind,
    ) -> Result<mpsc::UnboundedReceiver<Value>, SubscriptionError> {
        let epoch = self.registry.lock().reserve(stream)?;
        let (sink, rx) = mpsc::unbounded_channel();

        let result = self
            .dispatch(
                api::subscribe(stream),
                PendingKind::Subscribe { stream, epoch, sink },
                None,
            )
            .await;

        match result {
            Ok(_) if self.registry.lock().is_current(stream, epoch) => {
                debug!(connection = %self.label, %stream, "Subscribed");
                Ok(rx)
            }
            Ok(_) => Err(SubscriptionError::Stale),
            Err(err) => {
                self.registry.lock().release(stream, epoch);
                Err(SubscriptionError::Api(err))
            }
        }
    }

    /// Forget every subscription on the venue and close the local streams.
    ///
    /// Local dispatch stops before the first `forget` goes out.
    pub async fn teardown_subscriptions(&self) {
        let handles = self.registry.lock().take_all();
        if handles.is_empty() {
            return;
        }
        debug!(connection = %self.label, count = handles.len(), "Tearing down subscriptions");

        let ids: Vec<(StreamKind, Option<String>)> =
            handles.into_iter().map(|h| (h.stream, h.id)).collect();
        for (stream, id) in ids {
            let Some(id) = id else { continue };
            if !self.is_open() {
                break;
            }
            if let Err(e) = self.request_timeout(api::forget(&id), FORGET_TIMEOUT).await {
                debug!(connection = %self.label, %stream, error = %e, "Forget failed");
            }
        }
    }

    /// Periodic health check. A transport that is not open gets a debounced
    /// reconnect; an open one gets a keepalive ping.
    pub fn spawn_health_check(&self) -> JoinHandle<()> {
        let this = self.this.clone();
        let period = self.config.health_check_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(conn) = this.upgrade() else { return };
                if conn.shutdown.load(Ordering::SeqCst) {
                    continue;
                }
                match conn.state() {
                    TransportState::Open => conn.send_detached(api::ping()),
                    TransportState::Connecting => {}
                    state => {
                        debug!(connection = %conn.label, ?state, "Health check found transport down");
                        conn.schedule_reconnect();
                    }
                }
            }
        })
    }

    async fn open(&self) -> Result<(), TransportError> {
        let url = self.failover.lock().url(&self.config.app_id);
        self.state_tx.send_replace(TransportState::Connecting);
        info!(connection = %self.label, endpoint = %url, "Opening transport");

        match self.connector.connect(&url).await {
            Ok(handle) => {
                let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                *self.link.lock() = Some(Link {
                    generation,
                    outbound: handle.outbound,
                });
                self.failover.lock().on_open();
                self.backoff.lock().reset();
                self.state_tx.send_replace(TransportState::Open);
                self.generation_tx.send_replace(generation);

                tokio::spawn(Self::read_loop(self.this.clone(), generation, handle.inbound));
                info!(connection = %self.label, generation, "Transport open");
                Ok(())
            }
            Err(err) => {
                warn!(connection = %self.label, endpoint = %url, error = %err, "Connect failed");
                self.failover.lock().on_error();
                self.state_tx.send_replace(TransportState::Closed);
                self.schedule_reconnect();
                Err(err)
            }
        }
    }

    async fn read_loop(this: Weak<Self>, generation: u64, mut inbound: mpsc::UnboundedReceiver<Frame>) {
        while let Some(frame) = inbound.recv().await {
            let Some(conn) = this.upgrade() else { return };
            match frame {
                Frame::Text(text) => conn.handle_text(generation, &text),
                Frame::Error(reason) => {
                    conn.handle_drop(generation, true, &reason);
                    return;
                }
                Frame::Closed(reason) => {
                    conn.handle_drop(generation, false, reason.as_deref().unwrap_or("closed by peer"));
                    return;
                }
            }
        }
        if let Some(conn) = this.upgrade() {
            conn.handle_drop(generation, false, "transport ended");
        }
    }

    fn current_generation(&self) -> Option<u64> {
        self.link.lock().as_ref().map(|l| l.generation)
    }

    fn handle_text(&self, generation: u64, text: &str) {
        if self.current_generation() != Some(generation) {
            trace!(connection = %self.label, generation, "Discarding frame from replaced transport");
            return;
        }

        let msg: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(connection = %self.label, error = %e, "Unparseable frame");
                return;
            }
        };

        if let Some(req_id) = api::req_id(&msg) {
            let pending = self.pending.lock().remove(&req_id);
            if let Some(pending) = pending {
                if pending.generation == generation {
                    self.resolve(pending, msg);
                }
                return;
            }
        }

        let sink = self.registry.lock().route(&msg);
        match sink {
            Some(sink) => {
                let _ = sink.send(msg);
            }
            None => match api::subscription_id(&msg) {
                Some(id) => {
                    debug!(connection = %self.label, subscription = id, "Push for unknown subscription, forgetting");
                    let id = id.to_string();
                    self.send_detached(api::forget(&id));
                }
                None => trace!(connection = %self.label, msg_type = ?api::msg_type(&msg), "Unrouted frame"),
            },
        }
    }

    fn resolve(&self, pending: Pending, msg: Value) {
        let result = match api::error_of(&msg) {
            Some(err) => Err(err),
            None => Ok(msg),
        };

        match pending.kind {
            PendingKind::Request => {
                let _ = pending.tx.send(result);
            }
            PendingKind::Subscribe { stream, epoch, sink } => match result {
                Ok(msg) => {
                    let id = api::subscription_id(&msg).map(String::from);
                    let activated = self
                        .registry
                        .lock()
                        .activate(stream, id.clone(), epoch, sink.clone());
                    if activated {
                        let _ = sink.send(msg.clone());
                    } else if let Some(id) = id {
                        debug!(connection = %self.label, %stream, "Subscription answered after teardown, forgetting");
                        self.send_detached(api::forget(&id));
                    }
                    let _ = pending.tx.send(Ok(msg));
                }
                Err(err) => {
                    self.registry.lock().release(stream, epoch);
                    let _ = pending.tx.send(Err(err));
                }
            },
        }
    }

    fn handle_drop(&self, generation: u64, is_error: bool, reason: &str) {
        {
            let mut link = self.link.lock();
            match link.as_ref() {
                Some(l) if l.generation == generation => *link = None,
                _ => return,
            }
        }

        if is_error {
            self.failover.lock().on_error();
        }
        self.fail_pending(generation, reason);
        // The venue dropped the subscriptions along with the socket.
        drop(self.registry.lock().take_all());
        self.state_tx.send_replace(TransportState::Closed);
        warn!(connection = %self.label, generation, reason, "Transport lost");

        self.schedule_reconnect();
    }

    /// Drop the current link without counting it as a socket error.
    fn drop_link(&self, reason: &str) {
        let link = self.link.lock().take();
        if let Some(link) = link {
            self.fail_pending(link.generation, reason);
            drop(self.registry.lock().take_all());
        }
        self.state_tx.send_replace(TransportState::Closed);
    }

    fn fail_pending(&self, generation: u64, reason: &str) {
        let failed: Vec<Pending> = {
            let mut pending = self.pending.lock();
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, p)| p.generation == generation)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        for p in failed {
            let _ = p.tx.send(Err(ApiError::Transport(reason.to_string())));
        }
    }

    fn schedule_reconnect(&self) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        if self.reconnect_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }

        let delay = self
            .backoff
            .lock()
            .next_backoff()
            .unwrap_or(self.config.max_reconnect_delay)
            .max(self.config.reconnect_debounce);
        debug!(connection = %self.label, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");

        let this = self.this.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(conn) = this.upgrade() else { return };
            conn.reconnect_scheduled.store(false, Ordering::SeqCst);
            if conn.shutdown.load(Ordering::SeqCst) || conn.is_open() {
                return;
            }
            if let Err(e) = conn.init(false).await {
                debug!(connection = %conn.label, error = %e, "Reconnect attempt failed");
            }
        });
    }

    /// Send without awaiting a response.
    fn send_detached(&self, mut payload: Value) {
        let req_id = self.next_req_id.fetch_add(1, Ordering::SeqCst);
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("req_id".to_string(), Value::from(req_id));
        }
        if let Some(link) = self.link.lock().as_ref() {
            let _ = link.outbound.send(payload.to_string());
        }
    }

    async fn dispatch(
        &self,
        mut payload: Value,
        kind: PendingKind,
        limit: Option<Duration>,
    ) -> Result<Value, ApiError> {
        let req_id = self.next_req_id.fetch_add(1, Ordering::SeqCst);
        payload
            .as_object_mut()
            .ok_or_else(|| ApiError::Decode("request is not a JSON object".to_string()))?
            .insert("req_id".to_string(), Value::from(req_id));

        let (tx, rx) = oneshot::channel();
        {
            let link = self.link.lock();
            let link = link.as_ref().ok_or(ApiError::NotConnected)?;
            self.pending.lock().insert(
                req_id,
                Pending {
                    generation: link.generation,
                    kind,
                    tx,
                },
            );
            if link.outbound.send(payload.to_string()).is_err() {
                self.pending.lock().remove(&req_id);
                return Err(ApiError::Transport("outbound channel closed".to_string()));
            }
        }

        let reply = match limit {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.pending.lock().remove(&req_id);
                    return Err(ApiError::Timeout);
                }
            },
            None => rx.await,
        };
        reply.unwrap_or_else(|_| Err(ApiError::Transport("request abandoned".to_string())))
    }
}

fn reconnect_backoff(config: &ConnectionConfig) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(config.reconnect_debounce)
        .with_max_interval(config.max_reconnect_delay)
        .with_multiplier(2.0)
        .with_randomization_factor(0.2)
        .with_max_elapsed_time(None)
        .build()
}
