//! Trade executor: places contracts on the active account, driving the
//! virtual hook around every purchase.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::{self, BuyReceipt, ProposalQuote};
use crate::config::AppConfig;
use crate::connection::{RateLimiter, RetryPolicy};
use crate::error::ApiError;
use crate::events::{TradeEvent, TradeEventBus};
use crate::hook::{select_counterpart, Counterpart, Mode, VirtualHook, VirtualHookConfig};
use crate::models::{ContractOrder, ContractPurchase, Settlement};
use crate::notify::{Notification, NotificationSink, Topic};
use crate::session::{AccountStore, Session};

/// Places trades for the master session.
///
/// Purchases are announced on the auxiliary channel returned by
/// [`TradeExecutor::new`], which the trade event bus merges with the
/// session's own pushes.
pub struct TradeExecutor {
    session: Arc<Session>,
    store: Arc<AccountStore>,
    notifier: Arc<dyn NotificationSink>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,

    hook: Mutex<VirtualHook>,

    // Mode each open contract was placed in
    contract_modes: Mutex<HashMap<u64, Mode>>,

    announce: mpsc::UnboundedSender<TradeEvent>,
}

impl TradeExecutor {
    pub fn new(
        session: Arc<Session>,
        store: Arc<AccountStore>,
        notifier: Arc<dyn NotificationSink>,
        limiter: Arc<RateLimiter>,
        hook_config: VirtualHookConfig,
        config: &AppConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TradeEvent>) {
        let is_virtual = session
            .account()
            .map(|a| a.is_virtual)
            .or_else(|| store.active_account().map(|a| a.snapshot.is_virtual))
            .unwrap_or(true);
        let (announce, rx) = mpsc::unbounded_channel();
        let retry = RetryPolicy::bounded(config.purchase_retry_budget)
            .with_attempt_timeout(config.proposal_timeout);

        let executor = Self {
            session,
            store,
            notifier,
            limiter,
            retry,
            hook: Mutex::new(VirtualHook::new(hook_config, Mode::of_account(is_virtual))),
            contract_modes: Mutex::new(HashMap::new()),
            announce,
        };
        (executor, rx)
    }

    pub fn mode(&self) -> Mode {
        self.hook.lock().mode()
    }

    pub fn hook(&self) -> VirtualHook {
        self.hook.lock().clone()
    }

    /// Place `order` on the active account.
    ///
    /// The virtual hook is evaluated first; a due switch changes the
    /// credential and the active account before the purchase goes out.
    pub async fn purchase(&self, order: &ContractOrder) -> Result<ContractPurchase, ApiError> {
        let due = self.hook.lock().evaluate();
        if let Some(target) = due {
            self.switch_mode(target).await;
        }

        let account = self.session.account().ok_or(ApiError::NotConnected)?;
        let correlation_id = Uuid::new_v4().to_string();

        let msg = self
            .session
            .call_paced(
                api::proposal(order, &account.currency, &correlation_id),
                self.retry,
                &self.limiter,
            )
            .await?;
        let quote: ProposalQuote = api::section(&msg, "proposal")?;

        let msg = self
            .session
            .call(api::buy(&quote.id, quote.ask_price, &correlation_id), self.retry)
            .await?;
        let receipt: BuyReceipt = api::section(&msg, "buy")?;

        let mode = self.hook.lock().mode();
        self.contract_modes.lock().insert(receipt.contract_id, mode);

        let purchase = ContractPurchase {
            account: account.loginid.clone(),
            contract_id: receipt.contract_id,
            transaction_id: Some(receipt.transaction_id),
            order: order.clone(),
            currency: account.currency.clone(),
            timestamp: receipt
                .start_time
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
                .unwrap_or_else(Utc::now),
        };

        info!(
            account = %purchase.account,
            mode = %mode,
            contract_id = purchase.contract_id,
            symbol = %order.symbol,
            contract_type = %order.contract_type,
            price = %receipt.buy_price,
            "Contract purchased"
        );
        self.notifier.notify(Notification::info(
            Topic::Trade,
            format!(
                "Bought {} {} for {} {} on {}",
                order.contract_type, order.symbol, receipt.buy_price, purchase.currency, purchase.account
            ),
        ));
        let _ = self.announce.send(TradeEvent::Buy(purchase.clone()));

        Ok(purchase)
    }

    /// Feed a settlement to the virtual hook. Contracts not placed here, or
    /// already handled, are ignored. Returns whether the hook counted it.
    pub fn on_settlement(&self, settlement: &Settlement) -> bool {
        let Some(placed_in) = self.contract_modes.lock().remove(&settlement.contract_id) else {
            return false;
        };
        let mut hook = self.hook.lock();
        let applied = hook.on_settlement(placed_in, settlement.outcome);
        debug!(
            contract_id = settlement.contract_id,
            outcome = settlement.outcome.as_str(),
            losses = hook.consecutive_losses(),
            real_trades = hook.real_trade_count(),
            applied,
            "Settlement applied to virtual hook"
        );
        applied
    }

    /// Wait for the settlement of `contract_id` on `events`.
    pub async fn wait_for_settlement(
        &self,
        events: &mut broadcast::Receiver<TradeEvent>,
        contract_id: u64,
    ) -> Option<Settlement> {
        loop {
            match events.recv().await {
                Ok(TradeEvent::Sell(settlement)) if settlement.contract_id == contract_id => {
                    self.on_settlement(&settlement);
                    return Some(settlement);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Settlement listener lagged"),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Apply every settlement seen on the bus.
    pub fn spawn_settlement_listener(self: &Arc<Self>, bus: &TradeEventBus) -> JoinHandle<()> {
        let executor = Arc::clone(self);
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(TradeEvent::Sell(settlement)) => {
                        executor.on_settlement(&settlement);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Settlement listener lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Switch the session to the counterpart account of `target`. Any
    /// failure leaves trading on the current account and is reported.
    async fn switch_mode(&self, target: Mode) {
        let accounts = self.store.accounts();
        let configured = self.hook.lock().config().counterpart_for(target).map(String::from);

        let account = match select_counterpart(&accounts, target, configured.as_deref()) {
            Counterpart::Found(account) => account,
            Counterpart::Missing => {
                self.notifier.notify(Notification::warning(
                    Topic::VirtualHook,
                    format!("No {target} account to switch to, trading continues on the current account"),
                ));
                return;
            }
            Counterpart::Ambiguous(ids) => {
                self.notifier.notify(Notification::warning(
                    Topic::VirtualHook,
                    format!(
                        "Several {target} accounts ({}), configure a counterpart; trading continues on the current account",
                        ids.join(", ")
                    ),
                ));
                return;
            }
        };

        let previous = self.session.token();
        match self.session.switch_credential(&account.token).await {
            Ok(info) => {
                if let Err(e) = self.activate(&info.loginid).await {
                    warn!(error = %e, "Failed to persist active account");
                }
                self.hook.lock().commit_switch(target);
                self.notifier.notify(Notification::info(
                    Topic::VirtualHook,
                    format!("Switched to {target} account {}", info.loginid),
                ));
            }
            Err(e) => {
                self.notifier.notify(Notification::error(
                    Topic::VirtualHook,
                    format!("Switch to {target} account {} failed: {e}", account.snapshot.loginid),
                ));
                if let Some(token) = previous {
                    if let Err(e) = self.session.switch_credential(&token).await {
                        warn!(error = %e, "Failed to restore previous credential");
                    }
                }
            }
        }
    }

    async fn activate(&self, loginid: &str) -> Result<()> {
        self.store.set_active(loginid).await
    }
}
