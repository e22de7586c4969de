//! Bot runner: wires the master session, trade bus, replication engine and
//! trade executor together.
//!
//! Handles:
//! - Bootstrapping the master session from the persisted active credential
//! - Merging session pushes and local purchases into the trade bus
//! - Restoring and driving replication to subordinates
//! - Reacting to rejected credentials (pinned ones are kept)
//! - Mirroring balances into the account store

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::connection::{ConnectionConfig, ConnectionManager, Connector, RateLimiter, WsConnector};
use crate::db::{Database, ReplicationStats};
use crate::events::{TradeEvent, TradeEventBus};
use crate::hook::{Mode, VirtualHookConfig};
use crate::models::{mask_token, ContractOrder, ContractPurchase, Settlement};
use crate::notify::{Notification, NotificationSink, Topic, TracingSink};
use crate::replication::ReplicationEngine;
use crate::session::{AccountStore, Session, SessionOptions};
use crate::trading::TradeExecutor;

/// Bot configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Connection, session and replication tuning
    pub app: AppConfig,

    /// Database URL
    pub database_url: String,

    /// Virtual hook thresholds for trades placed by this process
    pub hook: VirtualHookConfig,

    /// How long `run_trades` waits for each contract to settle
    pub settlement_timeout: Duration,

    /// Capacity of the trade event bus
    pub bus_capacity: usize,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            app: AppConfig::default(),
            database_url: "sqlite:tradesync.db?mode=rwc".to_string(),
            hook: VirtualHookConfig::default(),
            settlement_timeout: Duration::from_secs(600),
            bus_capacity: 1024,
        }
    }
}

/// Outcome of one contract placed by `run_trades`.
#[derive(Debug, Clone)]
pub struct TradeResult {
    pub purchase: ContractPurchase,
    pub settlement: Option<Settlement>,
}

/// Main bot runner.
pub struct Bot {
    config: BotConfig,
    db: Arc<Database>,
    store: Arc<AccountStore>,
    notifier: Arc<dyn NotificationSink>,
    bus: TradeEventBus,

    session: Arc<Session>,
    engine: Arc<ReplicationEngine>,
    executor: Option<Arc<TradeExecutor>>,

    // Master session pushes, handed to the bus on initialize
    session_events: Option<mpsc::UnboundedReceiver<TradeEvent>>,
    limiter: Arc<RateLimiter>,

    tasks: Vec<JoinHandle<()>>,

    // Shutdown signal
    shutdown: Arc<AtomicBool>,
}

impl Bot {
    /// Create a bot talking to the real venue.
    pub async fn new(config: BotConfig) -> Result<Self> {
        let db = Database::new(&config.database_url).await?;
        let connector = Arc::new(WsConnector::new(config.app.connect_timeout));
        Self::with_parts(config, Arc::new(db), connector, Arc::new(TracingSink)).await
    }

    /// Create a bot from explicit collaborators.
    pub async fn with_parts(
        config: BotConfig,
        db: Arc<Database>,
        connector: Arc<dyn Connector>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        let store = Arc::new(AccountStore::load(Arc::clone(&db)).await?);
        let limiter = Arc::new(RateLimiter::new(config.app.min_request_interval));
        let bus = TradeEventBus::new(config.bus_capacity);

        let conn = ConnectionManager::new(
            "master",
            ConnectionConfig::from(&config.app),
            Arc::clone(&connector),
        );
        let (session, session_events) = Session::new(conn, &config.app, SessionOptions::master());

        let engine = ReplicationEngine::load(
            config.app.clone(),
            Arc::clone(&db),
            connector,
            Arc::clone(&limiter),
            Arc::clone(&notifier),
        )
        .await?;

        Ok(Self {
            config,
            db,
            store,
            notifier,
            bus,
            session,
            engine: Arc::new(engine),
            executor: None,
            session_events: Some(session_events),
            limiter,
            tasks: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Get shutdown signal for external control.
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn bus(&self) -> &TradeEventBus {
        &self.bus
    }

    pub fn engine(&self) -> &Arc<ReplicationEngine> {
        &self.engine
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Bring the master session up with the active credential and start
    /// every background consumer.
    pub async fn initialize(&mut self) -> Result<()> {
        info!("Initializing bot...");

        let Some(token) = self.store.active_token() else {
            bail!("No active credential. Run `tradesync login <token>` first.");
        };

        let info = match self.session.start(&token).await {
            Ok(info) => info,
            Err(e) => {
                if e.is_unrecoverable() {
                    let cleared = self.store.handle_invalid_credential(&token).await?;
                    self.notifier.notify(Notification::error(
                        Topic::Authorization,
                        format!("Credential {} rejected: {e}", mask_token(&token)),
                    ));
                    if cleared {
                        warn!("Active credential cleared");
                    }
                }
                return Err(e).context("Failed to start master session");
            }
        };
        let pinned = self.store.is_pinned(&token);
        self.store.record_login(&token, &info, pinned).await?;
        self.store.set_active(&info.loginid).await?;

        let (executor, announced) = TradeExecutor::new(
            Arc::clone(&self.session),
            Arc::clone(&self.store),
            Arc::clone(&self.notifier),
            Arc::clone(&self.limiter),
            self.config.hook.clone(),
            &self.config.app,
        );
        let executor = Arc::new(executor);

        // Subscribers first, so nothing published by the bus is missed.
        self.tasks.push(self.engine.spawn(&self.bus));
        self.tasks.push(executor.spawn_settlement_listener(&self.bus));
        self.tasks.push(self.spawn_balance_mirror());
        self.tasks.push(self.spawn_credential_guard());
        if let Some(events) = self.session_events.take() {
            self.tasks.push(self.bus.attach(events, announced));
        }
        self.executor = Some(executor);

        let restored = self.engine.restore().await?;

        info!(
            account = %info.loginid,
            currency = %info.currency,
            balance = %info.balance,
            is_virtual = info.is_virtual,
            subordinates = restored,
            replication = self.engine.settings().enabled,
            "Bot initialized"
        );
        Ok(())
    }

    /// Main run loop: keeps the bot alive until Ctrl+C.
    pub async fn run(&mut self) -> Result<()> {
        info!("Starting bot run loop");

        let mut status_interval = interval(self.config.app.health_check_interval);

        // Register shutdown handler
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        let mut poll = interval(Duration::from_millis(250));
        while !self.shutdown.load(Ordering::SeqCst) {
            tokio::select! {
                _ = status_interval.tick() => {
                    let stats = self.get_stats().await;
                    debug!(
                        ready = stats.ready,
                        subordinates = stats.subordinates,
                        replicas = stats.replication.total,
                        "Bot status"
                    );
                }
                _ = poll.tick() => {}
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Place `count` contracts one after another, each waiting for its
    /// settlement before the next is placed.
    pub async fn run_trades(&mut self, order: &ContractOrder, count: u32) -> Result<Vec<TradeResult>> {
        let Some(executor) = self.executor.clone() else {
            bail!("Bot is not initialized");
        };

        let mut results = Vec::new();
        for n in 1..=count {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let mut events = self.bus.subscribe();
            let purchase = match executor.purchase(order).await {
                Ok(purchase) => purchase,
                Err(e) => {
                    error!(trade = n, error = %e, "Purchase failed");
                    self.notifier.notify(Notification::error(
                        Topic::Trade,
                        format!("Trade {n}/{count} failed: {e}"),
                    ));
                    if e.is_invalid_token() {
                        break;
                    }
                    continue;
                }
            };

            let settlement = tokio::time::timeout(
                self.config.settlement_timeout,
                executor.wait_for_settlement(&mut events, purchase.contract_id),
            )
            .await
            .ok()
            .flatten();

            match &settlement {
                Some(s) => info!(
                    trade = n,
                    contract_id = s.contract_id,
                    outcome = s.outcome.as_str(),
                    profit = %s.profit,
                    "Trade settled"
                ),
                None => warn!(trade = n, contract_id = purchase.contract_id, "No settlement received"),
            }
            results.push(TradeResult { purchase, settlement });
        }
        Ok(results)
    }

    /// Graceful shutdown.
    pub async fn shutdown(&mut self) {
        info!("Shutting down bot...");
        self.engine.shutdown().await;
        self.session.close().await;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("Bot shutdown complete");
    }

    /// Get current stats.
    pub async fn get_stats(&self) -> BotStats {
        let account = self.session.account();
        let replication = self.db.get_replication_stats().await.unwrap_or_default();
        let subordinates = self.engine.statuses().await;

        BotStats {
            account: account.as_ref().map(|a| a.loginid.clone()),
            balance: self
                .store
                .active_account()
                .map(|a| a.snapshot.balance)
                .or(account.as_ref().map(|a| a.balance)),
            currency: account.map(|a| a.currency).unwrap_or_default(),
            mode: self.executor.as_ref().map(|e| e.mode()),
            ready: self.session.is_ready(),
            replication_enabled: self.engine.settings().enabled,
            subordinates: subordinates.len(),
            subordinates_ready: subordinates.iter().filter(|s| s.ready).count(),
            replication,
            is_running: !self.shutdown.load(Ordering::SeqCst),
        }
    }

    /// Keeps the account store's balances in line with the venue.
    fn spawn_balance_mirror(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let mut rx = self.bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(TradeEvent::Balance(update)) => {
                        if let Err(e) = store.update_balance(&update.account, update.balance).await {
                            warn!(error = %e, "Failed to store balance");
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Logs out on a rejected credential unless it is pinned. Logging out
    /// closes the master session so the dead token is not re-sent.
    fn spawn_credential_guard(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let session = Arc::clone(&self.session);
        let notifier = Arc::clone(&self.notifier);
        let mut rx = self.session.authorizer().credential_invalid();
        tokio::spawn(async move {
            loop {
                let signal = match rx.recv().await {
                    Ok(signal) => signal,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                };
                let masked = mask_token(&signal.token);
                match store.handle_invalid_credential(&signal.token).await {
                    Ok(true) => {
                        session.close().await;
                        notifier.notify(Notification::error(
                            Topic::Authorization,
                            format!("Credential {masked} rejected ({}), logged out", signal.message),
                        ));
                    }
                    Ok(false) => notifier.notify(Notification::warning(
                        Topic::Authorization,
                        format!("Credential {masked} rejected ({}), session data kept", signal.message),
                    )),
                    Err(e) => error!(error = %e, "Failed to handle rejected credential"),
                }
            }
        })
    }
}

/// Bot statistics.
#[derive(Debug, Clone)]
pub struct BotStats {
    pub account: Option<String>,
    pub balance: Option<Decimal>,
    pub currency: String,
    pub mode: Option<Mode>,
    pub ready: bool,
    pub replication_enabled: bool,
    pub subordinates: usize,
    pub subordinates_ready: usize,
    pub replication: ReplicationStats,
    pub is_running: bool,
}

impl std::fmt::Display for BotStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Bot Statistics ===")?;
        writeln!(f, "Account:         {}", self.account.as_deref().unwrap_or("-"))?;
        match self.balance {
            Some(balance) => writeln!(f, "Balance:         {:.2} {}", balance, self.currency)?,
            None => writeln!(f, "Balance:         -")?,
        }
        if let Some(mode) = self.mode {
            writeln!(f, "Mode:            {}", mode)?;
        }
        writeln!(f, "Trading Ready:   {}", if self.ready { "Yes" } else { "No" })?;
        writeln!(f, "Replication:     {}", if self.replication_enabled { "Enabled" } else { "Disabled" })?;
        writeln!(f, "Subordinates:    {} ({} ready)", self.subordinates, self.subordinates_ready)?;
        writeln!(f, "Replicas:        {} (Placed: {}, Failed: {}, Skipped: {})",
            self.replication.total, self.replication.placed, self.replication.failed, self.replication.skipped)?;
        writeln!(f, "Replica P&L:     {:.2} over {} settled", self.replication.net_profit, self.replication.settled)?;
        writeln!(f, "Status:          {}", if self.is_running { "Running" } else { "Stopped" })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::AuthorizeInfo;
    use crate::connection::Frame;
    use crate::notify::BroadcastSink;
    use crate::testing::{MockVenue, Script, ScriptedAccount};
    use rust_decimal_macros::dec;

    const MASTER: &str = "tok-master-001";
    const SUB: &str = "tok-sub-000002";

    fn config() -> BotConfig {
        BotConfig {
            app: AppConfig {
                endpoints: vec!["wss://primary.test/ws".to_string()],
                ..AppConfig::default()
            },
            ..BotConfig::default()
        }
    }

    fn venue() -> MockVenue {
        MockVenue::scripted(Script::with_accounts(vec![
            ScriptedAccount::new(MASTER, "CR1", dec!(1000), false),
            ScriptedAccount::new(SUB, "CR2", dec!(500), false),
        ]))
    }

    async fn logged_in_db() -> Arc<Database> {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let store = AccountStore::load(Arc::clone(&db)).await.unwrap();
        let info = AuthorizeInfo {
            loginid: "CR1".to_string(),
            currency: "USD".to_string(),
            balance: dec!(1000),
            is_virtual: false,
            account_list: Vec::new(),
        };
        store.record_login(MASTER, &info, false).await.unwrap();
        store.set_active("CR1").await.unwrap();
        db
    }

    #[tokio::test]
    async fn test_initialize_requires_credential() {
        let venue = venue();
        let db = Arc::new(Database::in_memory().await.unwrap());
        let mut bot = Bot::with_parts(config(), db, venue.connector(), Arc::new(BroadcastSink::new(8)))
            .await
            .unwrap();

        tokio_test::assert_err!(bot.initialize().await);
        assert_eq!(venue.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_rejected_master_credential_logs_out() {
        let script = Script::with_accounts(vec![ScriptedAccount::new(MASTER, "CR1", dec!(1000), false)]);
        let revoked = Arc::clone(&script.revoked);
        let venue = MockVenue::scripted(script);
        let db = logged_in_db().await;
        let mut app_config = config();
        app_config.app.reconnect_debounce = Duration::from_millis(50);
        let sink = BroadcastSink::new(64);
        let mut notes = sink.subscribe();
        let mut bot = Bot::with_parts(app_config, Arc::clone(&db), venue.connector(), Arc::new(sink))
            .await
            .unwrap();
        tokio_test::assert_ok!(bot.initialize().await);
        assert!(bot.session().is_ready());

        revoked.lock().insert(MASTER.to_string());
        venue.inject_on(0, Frame::Error("reset".to_string()));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(!bot.session().is_ready());
        assert!(bot.session().account().is_none());
        let store = AccountStore::load(Arc::clone(&db)).await.unwrap();
        assert!(store.active_token().is_none());

        // Closed for good: no further reconnects or authorize attempts.
        let connects = venue.connect_count();
        let authorizes = venue.sent_of("authorize").len();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(venue.connect_count(), connects);
        assert_eq!(venue.sent_of("authorize").len(), authorizes);

        let mut logged_out = false;
        while let Ok(note) = notes.try_recv() {
            if note.topic == Topic::Authorization && note.message.contains("logged out") {
                logged_out = true;
            }
        }
        assert!(logged_out);

        bot.shutdown().await;
    }

    #[tokio::test]
    async fn test_master_purchase_replicates_to_subordinate() {
        let venue = venue();
        let db = logged_in_db().await;
        db.add_subordinate(SUB, None).await.unwrap();
        let mut bot = Bot::with_parts(config(), db, venue.connector(), Arc::new(BroadcastSink::new(64)))
            .await
            .unwrap();
        tokio_test::assert_ok!(bot.engine().set_enabled(true).await);
        tokio_test::assert_ok!(bot.initialize().await);
        assert!(bot.session().is_ready());

        let order = ContractOrder {
            symbol: "R_100".to_string(),
            contract_type: "CALL".to_string(),
            amount: dec!(10),
            duration: 5,
            duration_unit: "t".to_string(),
            barrier: None,
        };
        bot.config.settlement_timeout = Duration::from_secs(1);
        let results = bot.run_trades(&order, 1).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].settlement.is_none());
        tokio::time::sleep(Duration::from_secs(2)).await;

        // Master socket first, subordinate second.
        let replicated: Vec<_> = venue
            .sent_of("buy")
            .into_iter()
            .filter(|r| r.connection == 1)
            .collect();
        assert_eq!(replicated.len(), 1);
        let stats = bot.get_stats().await;
        assert_eq!(stats.replication.placed, 1);
        assert_eq!(stats.subordinates_ready, 1);
        assert_eq!(stats.account.as_deref(), Some("CR1"));

        bot.shutdown().await;
    }
}
