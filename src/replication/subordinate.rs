//! A subordinate account: its own session, balance cache and loss tally.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::connection::{ConnectionConfig, ConnectionManager, Connector, TransportState};
use crate::db::Database;
use crate::error::SessionError;
use crate::events::TradeEvent;
use crate::models::{mask_token, BalanceCache};
use crate::session::{Session, SessionOptions};

/// Display and eligibility view of a subordinate.
#[derive(Debug, Clone)]
pub struct SubordinateStatus {
    /// Masked credential
    pub token: String,
    pub loginid: String,
    pub currency: String,
    pub balance: Decimal,
    pub confirmed_balance: Decimal,
    pub is_virtual: bool,
    pub connection: TransportState,
    pub ready: bool,
    pub daily_loss: Decimal,
}

#[derive(Debug)]
struct Ledger {
    loginid: String,
    currency: String,
    is_virtual: bool,
    balance: BalanceCache,
    loss_day: NaiveDate,
    daily_loss: Decimal,
}

impl Ledger {
    /// Add a realized result to today's tally, starting over on a new day.
    fn record_result(&mut self, profit: Decimal, today: NaiveDate) {
        if today != self.loss_day {
            self.loss_day = today;
            self.daily_loss = Decimal::ZERO;
        }
        if profit < Decimal::ZERO {
            self.daily_loss += -profit;
        }
    }

    fn loss_on(&self, today: NaiveDate) -> Decimal {
        if today == self.loss_day {
            self.daily_loss
        } else {
            Decimal::ZERO
        }
    }
}

pub struct Subordinate {
    token: String,
    session: Arc<Session>,
    ledger: Arc<Mutex<Ledger>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Subordinate {
    /// Open a dedicated connection for `token` and bring its session up.
    /// The session is closed again when start-up fails.
    pub async fn connect(
        token: &str,
        config: &AppConfig,
        connector: Arc<dyn Connector>,
        db: Arc<Database>,
    ) -> Result<Arc<Self>, SessionError> {
        let label = format!("sub-{}", mask_token(token));
        let conn = ConnectionManager::new(&label, ConnectionConfig::from(config), connector);
        let (session, events) = Session::new(conn, config, SessionOptions::subordinate());

        let info = match session.start(token).await {
            Ok(info) => info,
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        };

        let ledger = Arc::new(Mutex::new(Ledger {
            loginid: info.loginid.clone(),
            currency: info.currency.clone(),
            is_virtual: info.is_virtual,
            balance: BalanceCache::new(info.balance),
            loss_day: Utc::now().date_naive(),
            daily_loss: Decimal::ZERO,
        }));

        let sub = Arc::new(Self {
            token: token.to_string(),
            session,
            ledger,
            tasks: Mutex::new(Vec::new()),
        });

        let event_task = sub.spawn_event_task(events, db);
        let watchdog = sub.spawn_balance_watchdog(config.balance_confirm_timeout);
        sub.tasks.lock().extend([event_task, watchdog]);

        info!(
            subordinate = %info.loginid,
            currency = %info.currency,
            balance = %info.balance,
            is_virtual = info.is_virtual,
            "Subordinate connected"
        );
        Ok(sub)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn loginid(&self) -> String {
        self.ledger.lock().loginid.clone()
    }

    pub fn currency(&self) -> String {
        self.ledger.lock().currency.clone()
    }

    pub fn is_virtual(&self) -> bool {
        self.ledger.lock().is_virtual
    }

    /// Connected, authorized and subscribed.
    pub fn is_ready(&self) -> bool {
        self.session.connection().is_open() && self.session.is_ready()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Balance including unconfirmed speculation.
    pub fn balance(&self) -> Decimal {
        self.ledger.lock().balance.current()
    }

    pub fn daily_loss(&self) -> Decimal {
        self.ledger.lock().loss_on(Utc::now().date_naive())
    }

    /// True when `token` or the account id names this subordinate.
    pub fn matches(&self, token_or_loginid: &str) -> bool {
        self.token == token_or_loginid || self.ledger.lock().loginid == token_or_loginid
    }

    /// Speculative balance change after a replica purchase.
    pub fn apply_purchase(&self, cost: Decimal) {
        self.ledger.lock().balance.apply_speculative(-cost);
    }

    pub fn status(&self) -> SubordinateStatus {
        let ledger = self.ledger.lock();
        SubordinateStatus {
            token: mask_token(&self.token),
            loginid: ledger.loginid.clone(),
            currency: ledger.currency.clone(),
            balance: ledger.balance.current(),
            confirmed_balance: ledger.balance.confirmed(),
            is_virtual: ledger.is_virtual,
            connection: self.session.connection().state(),
            ready: self.session.is_ready(),
            daily_loss: ledger.loss_on(Utc::now().date_naive()),
        }
    }

    pub async fn disconnect(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.session.close().await;
        info!(subordinate = %self.loginid(), "Subordinate disconnected");
    }

    fn spawn_event_task(
        &self,
        mut events: mpsc::UnboundedReceiver<TradeEvent>,
        db: Arc<Database>,
    ) -> JoinHandle<()> {
        let ledger = Arc::clone(&self.ledger);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TradeEvent::Balance(update) => {
                        ledger.lock().balance.confirm(update.balance);
                    }
                    TradeEvent::Sell(settlement) => {
                        ledger
                            .lock()
                            .record_result(settlement.profit, settlement.timestamp.date_naive());
                        match db
                            .settle_replica(&settlement.account, settlement.contract_id, settlement.profit)
                            .await
                        {
                            Ok(true) => debug!(
                                subordinate = %settlement.account,
                                contract_id = settlement.contract_id,
                                profit = %settlement.profit,
                                "Replica settled"
                            ),
                            Ok(false) => {}
                            Err(e) => warn!(error = %e, "Failed to record replica settlement"),
                        }
                    }
                    TradeEvent::Buy(_) => {}
                }
            }
        })
    }

    /// Re-requests the balance when speculation has gone unconfirmed for
    /// longer than `confirm_within`.
    fn spawn_balance_watchdog(&self, confirm_within: Duration) -> JoinHandle<()> {
        let ledger = Arc::clone(&self.ledger);
        let session = Arc::downgrade(&self.session);
        let period = (confirm_within / 2).max(Duration::from_millis(500));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !ledger.lock().balance.is_stale(confirm_within) {
                    continue;
                }
                let Some(session) = session.upgrade() else { return };
                debug!(session = %session.label(), "Balance unconfirmed, re-requesting");
                if let Err(e) = session.refresh_balance().await {
                    warn!(session = %session.label(), error = %e, "Balance refresh failed");
                }
            }
        })
    }
}
