//! Replication engine: mirrors master purchases onto subordinate accounts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{compute_stake, DedupWindow, ReplicationSettings, Subordinate, SubordinateStatus};
use crate::api::{self, BuyReceipt, ProposalQuote};
use crate::config::AppConfig;
use crate::connection::{ConnectionManager, Connector, RateLimiter};
use crate::db::Database;
use crate::error::{ApiError, ReplicationError};
use crate::events::{TradeEvent, TradeEventBus};
use crate::models::{mask_token, ContractOrder, ContractPurchase};
use crate::notify::{Notification, NotificationSink, Topic};

/// Result of one replica attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaOutcome {
    Placed {
        subordinate: String,
        stake: Decimal,
        contract_id: u64,
        transaction_id: u64,
    },
    Skipped {
        subordinate: String,
        reason: String,
    },
    Failed {
        subordinate: String,
        error: String,
    },
}

impl ReplicaOutcome {
    pub fn subordinate(&self) -> &str {
        match self {
            ReplicaOutcome::Placed { subordinate, .. }
            | ReplicaOutcome::Skipped { subordinate, .. }
            | ReplicaOutcome::Failed { subordinate, .. } => subordinate,
        }
    }
}

/// Replication engine state.
pub struct ReplicationEngine {
    config: AppConfig,
    db: Arc<Database>,
    connector: Arc<dyn Connector>,
    notifier: Arc<dyn NotificationSink>,

    // Shared with every other proposal sender in the process
    limiter: Arc<RateLimiter>,

    settings: RwLock<ReplicationSettings>,
    subordinates: Arc<tokio::sync::RwLock<Vec<Arc<Subordinate>>>>,

    // Master keys replicated recently
    dedup: Mutex<DedupWindow>,
}

impl ReplicationEngine {
    /// Create the engine with persisted settings (defaults when none).
    pub async fn load(
        config: AppConfig,
        db: Arc<Database>,
        connector: Arc<dyn Connector>,
        limiter: Arc<RateLimiter>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        let settings = db.load_replication_settings().await?.unwrap_or_default();
        let dedup = DedupWindow::new(config.dedup_window);

        Ok(Self {
            config,
            db,
            connector,
            notifier,
            limiter,
            settings: RwLock::new(settings),
            subordinates: Arc::new(tokio::sync::RwLock::new(Vec::new())),
            dedup: Mutex::new(dedup),
        })
    }

    pub fn settings(&self) -> ReplicationSettings {
        self.settings.read().clone()
    }

    pub async fn set_enabled(&self, enabled: bool) -> Result<()> {
        let settings = ReplicationSettings {
            enabled,
            ..self.settings()
        };
        self.update_settings(settings).await
    }

    /// Validate, persist and apply new settings.
    pub async fn update_settings(&self, settings: ReplicationSettings) -> Result<()> {
        settings.validate()?;
        self.db.save_replication_settings(&settings).await?;
        info!(
            enabled = settings.enabled,
            max_stake_percent = %settings.max_stake_percent,
            multiplier = %settings.stake_multiplier,
            daily_loss_limit = %settings.daily_loss_limit,
            target = %settings.copy_target,
            "Replication settings updated"
        );
        *self.settings.write() = settings;
        Ok(())
    }

    pub async fn statuses(&self) -> Vec<SubordinateStatus> {
        self.subordinates.read().await.iter().map(|s| s.status()).collect()
    }

    /// Reconnect every persisted subordinate, staggered like a live
    /// fan-out. Tokens failing with an unrecoverable auth error are dropped.
    /// Returns the number of connected subordinates.
    pub async fn restore(&self) -> Result<usize> {
        let stored = self.db.get_subordinates().await?;
        if stored.is_empty() {
            return Ok(0);
        }
        info!(count = stored.len(), "Restoring subordinates");

        let attempts = stored.iter().enumerate().map(|(index, record)| async move {
            tokio::time::sleep(self.config.stagger * index as u32).await;
            let result = Subordinate::connect(
                &record.token,
                &self.config,
                Arc::clone(&self.connector),
                Arc::clone(&self.db),
            )
            .await;
            (record, result)
        });

        let mut connected = 0;
        for (record, result) in join_all(attempts).await {
            let masked = mask_token(&record.token);
            match result {
                Ok(sub) => {
                    if let Err(e) = self.db.add_subordinate(&record.token, Some(&sub.loginid())).await {
                        warn!(error = %e, "Failed to update subordinate record");
                    }
                    self.watch_credential(&sub);
                    self.subordinates.write().await.push(sub);
                    connected += 1;
                }
                Err(e) if e.is_unrecoverable() => {
                    self.db.remove_subordinate(&record.token).await?;
                    self.notifier.notify(Notification::error(
                        Topic::Replication,
                        format!("Subordinate {masked} removed: {e}"),
                    ));
                }
                Err(e) => {
                    self.notifier.notify(Notification::warning(
                        Topic::Replication,
                        format!("Subordinate {masked} could not reconnect: {e}"),
                    ));
                }
            }
        }
        Ok(connected)
    }

    /// Connect a new subordinate and persist its token.
    ///
    /// A token rejected as invalid is never stored. A transient failure
    /// stores the token so the next restore tries again.
    pub async fn add_subordinate(&self, token: &str) -> Result<SubordinateStatus> {
        if self.subordinates.read().await.iter().any(|s| s.token() == token) {
            bail!("Subordinate {} is already connected", mask_token(token));
        }

        let sub = match Subordinate::connect(
            token,
            &self.config,
            Arc::clone(&self.connector),
            Arc::clone(&self.db),
        )
        .await
        {
            Ok(sub) => sub,
            Err(e) if e.is_unrecoverable() => {
                self.notifier.notify(Notification::error(
                    Topic::Replication,
                    format!("Subordinate {} rejected: {e}", mask_token(token)),
                ));
                return Err(e).context("Subordinate credential rejected");
            }
            Err(e) => {
                self.db.add_subordinate(token, None).await?;
                self.notifier.notify(Notification::warning(
                    Topic::Replication,
                    format!("Subordinate {} saved but not connected: {e}", mask_token(token)),
                ));
                return Err(e).context("Subordinate saved but not connected");
            }
        };

        self.db.add_subordinate(token, Some(&sub.loginid())).await?;
        let status = sub.status();
        self.watch_credential(&sub);
        self.subordinates.write().await.push(sub);
        self.notifier.notify(Notification::info(
            Topic::Replication,
            format!("Subordinate {} added ({})", status.loginid, status.token),
        ));
        Ok(status)
    }

    /// Disconnect and forget a subordinate by token or account id.
    pub async fn remove_subordinate(&self, token_or_loginid: &str) -> Result<bool> {
        let removed = {
            let mut subs = self.subordinates.write().await;
            let (gone, kept): (Vec<_>, Vec<_>) =
                subs.drain(..).partition(|s| s.matches(token_or_loginid));
            *subs = kept;
            gone
        };
        for sub in &removed {
            sub.disconnect().await;
            self.db.remove_subordinate(sub.token()).await?;
        }
        let deleted = self.db.remove_subordinate(token_or_loginid).await?;

        let found = !removed.is_empty() || deleted;
        if found {
            info!(subordinate = %token_or_loginid, "Subordinate removed");
        }
        Ok(found)
    }

    /// Remove `sub` for good once the venue rejects its credential, the
    /// same way an unrecoverable failure is handled on restore.
    fn watch_credential(&self, sub: &Arc<Subordinate>) {
        let mut invalid = sub.session().authorizer().credential_invalid();
        let weak = Arc::downgrade(sub);
        let subordinates = Arc::clone(&self.subordinates);
        let db = Arc::clone(&self.db);
        let notifier = Arc::clone(&self.notifier);

        tokio::spawn(async move {
            let signal = loop {
                match invalid.recv().await {
                    Ok(signal) => break signal,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return,
                }
            };
            // Already removed by hand.
            let Some(sub) = weak.upgrade() else { return };
            let masked = mask_token(sub.token());

            subordinates.write().await.retain(|s| !Arc::ptr_eq(s, &sub));
            if let Err(e) = db.remove_subordinate(sub.token()).await {
                warn!(subordinate = %masked, error = %e, "Failed to delete subordinate record");
            }
            sub.disconnect().await;

            warn!(subordinate = %sub.loginid(), token = %masked, "Subordinate credential rejected, removed");
            notifier.notify(Notification::error(
                Topic::Replication,
                format!(
                    "Subordinate {} ({masked}) removed: {}",
                    sub.loginid(),
                    signal.message
                ),
            ));
        });
    }

    /// Disconnect every subordinate (persisted records are kept).
    pub async fn shutdown(&self) {
        let subs: Vec<_> = self.subordinates.write().await.drain(..).collect();
        for sub in subs {
            sub.disconnect().await;
        }
    }

    /// Replicate one master purchase.
    ///
    /// Duplicates within the dedup window are dropped silently. Each
    /// eligible subordinate starts `index * stagger` after the first, and a
    /// failure on one never affects the others.
    pub async fn on_master_trade(&self, purchase: &ContractPurchase) -> Vec<ReplicaOutcome> {
        let settings = self.settings();
        if !settings.enabled {
            debug!(contract_id = purchase.contract_id, "Replication disabled, ignoring trade");
            return Vec::new();
        }

        let key = purchase.dedup_key();
        if !self.dedup.lock().check_and_insert(&key, Instant::now()) {
            debug!(key = %key, "Duplicate master trade dropped");
            return Vec::new();
        }

        let subs: Vec<Arc<Subordinate>> = self.subordinates.read().await.clone();
        let mut outcomes = Vec::new();
        let mut eligible = Vec::new();
        for sub in subs {
            if !sub.is_ready() || !settings.copy_target.accepts(sub.is_virtual()) {
                continue;
            }
            if settings.has_loss_limit() && sub.daily_loss() >= settings.daily_loss_limit {
                let reason = format!("daily loss limit {} reached", settings.daily_loss_limit);
                self.record(&key, &sub.loginid(), Decimal::ZERO, "skipped", None, Some(&reason))
                    .await;
                outcomes.push(ReplicaOutcome::Skipped {
                    subordinate: sub.loginid(),
                    reason,
                });
                continue;
            }
            eligible.push(sub);
        }

        info!(
            key = %key,
            symbol = %purchase.order.symbol,
            amount = %purchase.order.amount,
            subordinates = eligible.len(),
            "Replicating master trade"
        );

        let replicas = eligible.into_iter().enumerate().map(|(index, sub)| {
            let settings = &settings;
            let key = &key;
            async move {
                tokio::time::sleep(self.config.stagger * index as u32).await;
                self.replicate_to(&sub, purchase, settings, key).await
            }
        });
        outcomes.extend(join_all(replicas).await);
        outcomes
    }

    /// Consume master purchases from the bus until it closes.
    pub fn spawn(self: &Arc<Self>, bus: &TradeEventBus) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(TradeEvent::Buy(purchase)) => {
                        // A stalled fan-out must not hold back later trades.
                        let engine = Arc::clone(&engine);
                        tokio::spawn(async move {
                            engine.on_master_trade(&purchase).await;
                        });
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Replication fell behind the trade bus");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    async fn replicate_to(
        &self,
        sub: &Subordinate,
        purchase: &ContractPurchase,
        settings: &ReplicationSettings,
        key: &str,
    ) -> ReplicaOutcome {
        let loginid = sub.loginid();
        let stake = compute_stake(
            purchase.order.amount,
            sub.balance(),
            settings.stake_multiplier,
            settings.max_stake_percent,
        );

        let result = if stake <= Decimal::ZERO {
            Err(ReplicationError::StakeTooSmall(stake))
        } else {
            let order = purchase.order.with_amount(stake);
            self.place(sub, &order).await
        };

        match result {
            Ok(receipt) => {
                sub.apply_purchase(receipt.buy_price);
                self.record(
                    key,
                    &loginid,
                    stake,
                    "placed",
                    Some((receipt.contract_id, receipt.transaction_id)),
                    None,
                )
                .await;
                self.notifier.notify(Notification::info(
                    Topic::Replication,
                    format!("Replicated to {loginid}: stake {stake}, contract {}", receipt.contract_id),
                ));
                ReplicaOutcome::Placed {
                    subordinate: loginid,
                    stake,
                    contract_id: receipt.contract_id,
                    transaction_id: receipt.transaction_id,
                }
            }
            Err(ReplicationError::StakeTooSmall(stake)) => {
                let reason = ReplicationError::StakeTooSmall(stake).to_string();
                self.record(key, &loginid, stake, "skipped", None, Some(&reason)).await;
                debug!(subordinate = %loginid, reason = %reason, "Replica skipped");
                ReplicaOutcome::Skipped {
                    subordinate: loginid,
                    reason,
                }
            }
            Err(e) => {
                let error = e.to_string();
                self.record(key, &loginid, stake, "failed", None, Some(&error)).await;
                self.notifier.notify(Notification::warning(
                    Topic::Replication,
                    format!("Replica to {loginid} failed: {error}"),
                ));
                ReplicaOutcome::Failed {
                    subordinate: loginid,
                    error,
                }
            }
        }
    }

    /// Proposal then buy at the quoted price, both legs bounded by the
    /// proposal timeout and tagged with one correlation id.
    async fn place(&self, sub: &Subordinate, order: &ContractOrder) -> Result<BuyReceipt, ReplicationError> {
        if !sub.is_ready() {
            return Err(ReplicationError::NotConnected);
        }
        let conn: &ConnectionManager = sub.session().connection();
        let currency = sub.currency();
        let correlation_id = Uuid::new_v4().to_string();
        let limit = self.config.proposal_timeout;

        self.limiter.acquire().await;
        let msg = leg(conn, api::proposal(order, &currency, &correlation_id), limit).await?;
        check_correlation(&msg, &correlation_id)?;
        let quote: ProposalQuote = api::section(&msg, "proposal")?;

        let msg = leg(conn, api::buy(&quote.id, quote.ask_price, &correlation_id), limit).await?;
        check_correlation(&msg, &correlation_id)?;
        let receipt: BuyReceipt = api::section(&msg, "buy")?;

        debug!(
            connection = %conn.label(),
            correlation_id = %correlation_id,
            contract_id = receipt.contract_id,
            "Replica bought"
        );
        Ok(receipt)
    }

    async fn record(
        &self,
        key: &str,
        subordinate: &str,
        stake: Decimal,
        status: &str,
        ids: Option<(u64, u64)>,
        error: Option<&str>,
    ) {
        if let Err(e) = self
            .db
            .log_replica(
                key,
                subordinate,
                stake,
                status,
                ids.map(|(contract, _)| contract),
                ids.map(|(_, tx)| tx),
                error,
            )
            .await
        {
            warn!(error = %e, "Failed to record replica");
        }
    }
}

async fn leg(conn: &ConnectionManager, payload: Value, limit: Duration) -> Result<Value, ReplicationError> {
    conn.request_timeout(payload, limit).await.map_err(|e| match e {
        ApiError::Timeout => ReplicationError::Timeout,
        ApiError::NotConnected => ReplicationError::NotConnected,
        other => ReplicationError::Api(other),
    })
}

/// The venue echoes `passthrough`; a mismatch means the answer belongs to
/// some other round trip.
fn check_correlation(msg: &Value, expected: &str) -> Result<(), ReplicationError> {
    match msg
        .get("passthrough")
        .and_then(|p| p.get("correlation_id"))
        .and_then(Value::as_str)
    {
        Some(id) if id != expected => Err(ReplicationError::Decode(format!(
            "correlation id {id} does not match {expected}"
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::BroadcastSink;
    use crate::replication::CopyTarget;
    use crate::connection::Frame;
    use crate::testing::{MockVenue, Script, ScriptedAccount};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    const SUB_RICH: &str = "tok-sub-rich-01";
    const SUB_POOR: &str = "tok-sub-poor-02";
    const SUB_DEMO: &str = "tok-sub-demo-03";

    fn config() -> AppConfig {
        AppConfig {
            endpoints: vec!["wss://primary.test/ws".to_string()],
            ..AppConfig::default()
        }
    }

    fn script() -> Script {
        Script::with_accounts(vec![
            ScriptedAccount::new(SUB_RICH, "CR500", dec!(500), false),
            ScriptedAccount::new(SUB_POOR, "CR50", dec!(50), false),
            ScriptedAccount::new(SUB_DEMO, "VRTC900", dec!(10000), true),
        ])
    }

    fn purchase(transaction_id: u64, amount: Decimal) -> ContractPurchase {
        ContractPurchase {
            account: "CR1".to_string(),
            contract_id: transaction_id + 1,
            transaction_id: Some(transaction_id),
            order: ContractOrder {
                symbol: "R_100".to_string(),
                contract_type: "CALL".to_string(),
                amount,
                duration: 5,
                duration_unit: "t".to_string(),
                barrier: None,
            },
            currency: "USD".to_string(),
            timestamp: Utc::now(),
        }
    }

    async fn engine(venue: &MockVenue) -> (Arc<ReplicationEngine>, Arc<Database>, BroadcastSink) {
        engine_with(venue, config()).await
    }

    async fn engine_with(
        venue: &MockVenue,
        config: AppConfig,
    ) -> (Arc<ReplicationEngine>, Arc<Database>, BroadcastSink) {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let sink = BroadcastSink::new(64);
        let engine = ReplicationEngine::load(
            config.clone(),
            Arc::clone(&db),
            venue.connector(),
            Arc::new(RateLimiter::new(config.min_request_interval)),
            Arc::new(sink.clone()),
        )
        .await
        .unwrap();
        engine.set_enabled(true).await.unwrap();
        (Arc::new(engine), db, sink)
    }

    fn proposal_amounts(venue: &MockVenue) -> Vec<f64> {
        venue
            .sent_of("proposal")
            .iter()
            .filter_map(|r| r.payload["amount"].as_f64())
            .collect()
    }

    #[tokio::test]
    async fn test_fan_out_scales_caps_and_staggers() {
        let venue = MockVenue::scripted(script());
        let (engine, db, _sink) = engine(&venue).await;
        engine.add_subordinate(SUB_RICH).await.unwrap();
        engine.add_subordinate(SUB_POOR).await.unwrap();

        let outcomes = engine.on_master_trade(&purchase(7001, dec!(10))).await;

        let stakes: Vec<Decimal> = outcomes
            .iter()
            .filter_map(|o| match o {
                ReplicaOutcome::Placed { stake, .. } => Some(*stake),
                _ => None,
            })
            .collect();
        assert_eq!(stakes, vec![dec!(10), dec!(2.5)]);
        assert_eq!(proposal_amounts(&venue), vec![10.0, 2.5]);

        let proposals = venue.sent_of("proposal");
        assert!(proposals[1].at - proposals[0].at >= Duration::from_millis(800));
        // Each answer carries back the correlation id it was sent with.
        assert_ne!(
            proposals[0].payload["passthrough"]["correlation_id"],
            proposals[1].payload["passthrough"]["correlation_id"]
        );

        let stats = db.get_replication_stats().await.unwrap();
        assert_eq!(stats.placed, 2);
    }

    #[tokio::test]
    async fn test_duplicate_trades_replicate_once() {
        let venue = MockVenue::scripted(script());
        let (engine, _db, _sink) = engine(&venue).await;
        engine.add_subordinate(SUB_RICH).await.unwrap();

        let first = engine.on_master_trade(&purchase(7001, dec!(10))).await;
        let again = engine.on_master_trade(&purchase(7001, dec!(10))).await;
        let other = engine.on_master_trade(&purchase(7002, dec!(10))).await;

        assert_eq!(first.len(), 1);
        assert!(again.is_empty());
        assert_eq!(other.len(), 1);
        assert_eq!(venue.sent_of("proposal").len(), 2);
    }

    #[tokio::test]
    async fn test_copy_target_excludes_virtual() {
        let venue = MockVenue::scripted(script());
        let (engine, _db, _sink) = engine(&venue).await;
        engine.add_subordinate(SUB_RICH).await.unwrap();
        engine.add_subordinate(SUB_DEMO).await.unwrap();
        engine
            .update_settings(ReplicationSettings {
                enabled: true,
                copy_target: CopyTarget::RealOnly,
                ..ReplicationSettings::default()
            })
            .await
            .unwrap();

        let outcomes = engine.on_master_trade(&purchase(7001, dec!(10))).await;

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].subordinate(), "CR500");
    }

    #[tokio::test]
    async fn test_one_failure_does_not_block_others() {
        let venue = MockVenue::scripted(script());
        let (engine, db, sink) = engine(&venue).await;
        let mut notes = sink.subscribe();
        engine.add_subordinate(SUB_RICH).await.unwrap();
        engine.add_subordinate(SUB_POOR).await.unwrap();

        // Tiny master stake: the poor account's share rounds to zero.
        let outcomes = engine.on_master_trade(&purchase(7001, dec!(0.001))).await;
        assert!(outcomes.iter().all(|o| matches!(o, ReplicaOutcome::Skipped { .. })));

        // Drop the rich subordinate's link; the poor one still trades.
        engine.subordinates.read().await[0]
            .session()
            .connection()
            .close()
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        let outcomes = engine.on_master_trade(&purchase(7002, dec!(10))).await;

        assert_eq!(outcomes.len(), 1);
        assert!(matches!(&outcomes[0], ReplicaOutcome::Placed { subordinate, .. } if subordinate == "CR50"));
        let stats = db.get_replication_stats().await.unwrap();
        assert_eq!(stats.skipped, 2);
        assert_eq!(stats.placed, 1);
        while let Ok(n) = notes.try_recv() {
            assert_eq!(n.topic, Topic::Replication);
        }
    }

    #[tokio::test]
    async fn test_silent_venue_times_out_the_replica() {
        let mut script = script();
        script.silent = vec!["proposal"];
        let venue = MockVenue::scripted(script);
        let config = AppConfig {
            proposal_timeout: Duration::from_millis(300),
            ..config()
        };
        let (engine, db, _sink) = engine_with(&venue, config).await;
        engine.add_subordinate(SUB_RICH).await.unwrap();

        let outcomes = engine.on_master_trade(&purchase(7001, dec!(10))).await;

        assert!(matches!(&outcomes[0], ReplicaOutcome::Failed { error, .. } if error.contains("timed out")));
        assert_eq!(db.get_replication_stats().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_stalled_trade_does_not_block_the_next() {
        let mut script = script();
        script.silent = vec!["proposal"];
        let venue = MockVenue::scripted(script);
        let config = AppConfig {
            proposal_timeout: Duration::from_secs(10),
            min_request_interval: Duration::from_millis(100),
            ..config()
        };
        let (engine, _db, _sink) = engine_with(&venue, config).await;
        engine.add_subordinate(SUB_RICH).await.unwrap();
        let bus = TradeEventBus::new(16);
        let consumer = engine.spawn(&bus);

        bus.publish(TradeEvent::Buy(purchase(7001, dec!(10))));
        bus.publish(TradeEvent::Buy(purchase(7002, dec!(10))));
        tokio::time::sleep(Duration::from_millis(600)).await;

        // Both proposals are out while the first still waits for a reply.
        assert_eq!(venue.sent_of("proposal").len(), 2);
        consumer.abort();
    }

    #[tokio::test]
    async fn test_disabled_engine_ignores_trades() {
        let venue = MockVenue::scripted(script());
        let (engine, _db, _sink) = engine(&venue).await;
        engine.add_subordinate(SUB_RICH).await.unwrap();
        engine.set_enabled(false).await.unwrap();

        assert!(engine.on_master_trade(&purchase(7001, dec!(10))).await.is_empty());
        assert!(venue.sent_of("proposal").is_empty());
    }

    #[tokio::test]
    async fn test_invalid_subordinate_is_not_persisted() {
        let venue = MockVenue::scripted(script());
        let (engine, db, _sink) = engine(&venue).await;

        assert!(engine.add_subordinate("tok-not-known-9").await.is_err());
        assert!(db.get_subordinates().await.unwrap().is_empty());
        assert!(engine.statuses().await.is_empty());
    }

    #[tokio::test]
    async fn test_restore_reconnects_staggered_and_drops_revoked() {
        let script = script();
        let revoked = Arc::clone(&script.revoked);
        let venue = MockVenue::scripted(script);
        let (engine, db, _sink) = engine(&venue).await;
        db.add_subordinate(SUB_RICH, None).await.unwrap();
        db.add_subordinate(SUB_POOR, None).await.unwrap();
        db.add_subordinate(SUB_DEMO, None).await.unwrap();
        revoked.lock().insert(SUB_DEMO.to_string());

        let connected = engine.restore().await.unwrap();

        assert_eq!(connected, 2);
        let authorizes = venue.sent_of("authorize");
        assert_eq!(authorizes.len(), 3);
        let mut times: Vec<_> = authorizes.iter().map(|r| r.at).collect();
        times.sort();
        assert!(times[1] - times[0] >= Duration::from_millis(800));
        assert!(times[2] - times[1] >= Duration::from_millis(800));

        let stored: Vec<String> = db
            .get_subordinates()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.token)
            .collect();
        assert!(!stored.contains(&SUB_DEMO.to_string()));
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn test_revoked_subordinate_is_dropped_while_running() {
        let script = script();
        let revoked = Arc::clone(&script.revoked);
        let venue = MockVenue::scripted(script);
        let config = AppConfig {
            reconnect_debounce: Duration::from_millis(50),
            ..config()
        };
        let (engine, db, sink) = engine_with(&venue, config).await;
        let mut notes = sink.subscribe();
        engine.add_subordinate(SUB_RICH).await.unwrap();
        engine.add_subordinate(SUB_POOR).await.unwrap();

        // The venue revokes the token; the next re-authorization after a
        // reconnect is rejected.
        revoked.lock().insert(SUB_RICH.to_string());
        venue.inject_on(0, Frame::Error("reset".to_string()));
        tokio::time::sleep(Duration::from_secs(1)).await;

        let statuses = engine.statuses().await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].loginid, "CR50");
        let stored: Vec<String> = db
            .get_subordinates()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.token)
            .collect();
        assert_eq!(stored, vec![SUB_POOR.to_string()]);

        let removed = std::iter::from_fn(|| notes.try_recv().ok())
            .find(|n| n.severity == crate::notify::Severity::Error)
            .unwrap();
        assert!(removed.message.contains("CR500"));

        // Replication carries on with the remaining account.
        let outcomes = engine.on_master_trade(&purchase(7001, dec!(10))).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].subordinate(), "CR50");
    }

    #[tokio::test]
    async fn test_remove_subordinate_by_loginid() {
        let venue = MockVenue::scripted(script());
        let (engine, db, _sink) = engine(&venue).await;
        engine.add_subordinate(SUB_RICH).await.unwrap();

        assert!(engine.remove_subordinate("CR500").await.unwrap());
        assert!(engine.statuses().await.is_empty());
        assert!(db.get_subordinates().await.unwrap().is_empty());
        assert!(!engine.remove_subordinate("CR500").await.unwrap());
    }
}
