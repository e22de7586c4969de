//! Trade event bus: typed events normalized from venue pushes, and the
//! fan-in that merges session pushes with locally announced purchases.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::api::{self, BalancePush, OpenContract, StreamKind, TransactionPush};
use crate::models::{ContractOrder, ContractPurchase, Outcome, Settlement};

/// Contract ids remembered per kind; older ones may be re-emitted.
const SEEN_CAPACITY: usize = 2048;

#[derive(Debug, Clone, PartialEq)]
pub struct BalanceUpdate {
    pub account: String,
    pub currency: String,
    pub balance: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TradeEvent {
    Buy(ContractPurchase),
    Sell(Settlement),
    Balance(BalanceUpdate),
}

impl TradeEvent {
    pub fn account(&self) -> &str {
        match self {
            TradeEvent::Buy(p) => &p.account,
            TradeEvent::Sell(s) => &s.account,
            TradeEvent::Balance(b) => &b.account,
        }
    }
}

/// Insertion-ordered set that forgets its oldest entries.
#[derive(Debug)]
struct BoundedSet<T> {
    items: HashSet<T>,
    order: VecDeque<T>,
    capacity: usize,
}

impl<T: Eq + Hash + Clone> BoundedSet<T> {
    fn new(capacity: usize) -> Self {
        Self {
            items: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Returns true when `item` was not present.
    fn insert(&mut self, item: T) -> bool {
        if !self.items.insert(item.clone()) {
            return false;
        }
        self.order.push_back(item);
        if self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.items.remove(&old);
            }
        }
        true
    }

    fn clear(&mut self) {
        self.items.clear();
        self.order.clear();
    }
}

/// Turns raw pushes of one session into [`TradeEvent`]s.
///
/// A contract yields one `Buy` the first time it is seen open and one
/// `Sell` when it is reported sold.
#[derive(Debug)]
pub struct EventNormalizer {
    account: String,
    currency: String,
    opened: BoundedSet<u64>,
    sold: BoundedSet<u64>,
}

impl Default for EventNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl EventNormalizer {
    pub fn new() -> Self {
        Self {
            account: String::new(),
            currency: String::new(),
            opened: BoundedSet::new(SEEN_CAPACITY),
            sold: BoundedSet::new(SEEN_CAPACITY),
        }
    }

    /// Attribute subsequent events to `account`.
    pub fn set_account(&mut self, account: &str, currency: &str) {
        if self.account != account {
            self.opened.clear();
            self.sold.clear();
        }
        self.account = account.to_string();
        self.currency = currency.to_string();
    }

    pub fn normalize(&mut self, stream: StreamKind, msg: &Value) -> Vec<TradeEvent> {
        if api::error_of(msg).is_some() {
            return Vec::new();
        }
        match stream {
            StreamKind::Balance => self.balance(msg).into_iter().collect(),
            StreamKind::Transaction => self.transaction(msg).into_iter().collect(),
            StreamKind::OpenContract => self.open_contract(msg),
        }
    }

    fn balance(&self, msg: &Value) -> Option<TradeEvent> {
        let push: BalancePush = api::section(msg, "balance").ok()?;
        Some(TradeEvent::Balance(BalanceUpdate {
            account: if push.loginid.is_empty() {
                self.account.clone()
            } else {
                push.loginid
            },
            currency: if push.currency.is_empty() {
                self.currency.clone()
            } else {
                push.currency
            },
            balance: push.balance,
        }))
    }

    fn transaction(&self, msg: &Value) -> Option<TradeEvent> {
        let push: TransactionPush = api::section(msg, "transaction").ok()?;
        let balance = push.balance?;
        Some(TradeEvent::Balance(BalanceUpdate {
            account: self.account.clone(),
            currency: push.currency.unwrap_or_else(|| self.currency.clone()),
            balance,
        }))
    }

    fn open_contract(&mut self, msg: &Value) -> Vec<TradeEvent> {
        let poc: OpenContract = match api::section(msg, "proposal_open_contract") {
            Ok(poc) => poc,
            Err(e) => {
                debug!(error = %e, "Ignoring unreadable open-contract push");
                return Vec::new();
            }
        };
        let Some(contract_id) = poc.contract_id else {
            return Vec::new();
        };

        let mut events = Vec::new();
        let ids = poc.transaction_ids;

        // A contract first seen already sold was bought before we listened.
        if self.opened.insert(contract_id) && !poc.is_sold {
            let (duration, duration_unit) = match (poc.tick_count, poc.date_start, poc.date_expiry) {
                (Some(ticks), _, _) => (ticks, "t"),
                (None, Some(start), Some(expiry)) if expiry > start => {
                    let span = expiry.saturating_sub(start);
                    (u32::try_from(span).unwrap_or(u32::MAX), "s")
                }
                _ => (0, "s"),
            };
            events.push(TradeEvent::Buy(ContractPurchase {
                account: self.account.clone(),
                contract_id,
                transaction_id: ids.and_then(|t| t.buy),
                order: ContractOrder {
                    symbol: poc.underlying.clone(),
                    contract_type: poc.contract_type.clone(),
                    amount: poc.buy_price,
                    duration,
                    duration_unit: duration_unit.to_string(),
                    barrier: poc.barrier.clone(),
                },
                currency: if poc.currency.is_empty() {
                    self.currency.clone()
                } else {
                    poc.currency.clone()
                },
                timestamp: timestamp(poc.purchase_time.or(poc.date_start)),
            }));
        }

        if poc.is_sold && self.sold.insert(contract_id) {
            events.push(TradeEvent::Sell(Settlement {
                account: self.account.clone(),
                contract_id,
                sell_transaction_id: ids.and_then(|t| t.sell),
                outcome: match poc.status.as_deref() {
                    Some("won") => Outcome::Won,
                    Some("lost") => Outcome::Lost,
                    _ => Outcome::from_profit(poc.profit),
                },
                profit: poc.profit,
                timestamp: Utc::now(),
            }));
        }

        events
    }
}

fn timestamp(epoch: Option<i64>) -> DateTime<Utc> {
    epoch
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .unwrap_or_else(Utc::now)
}

/// Broadcast bus of the master's trade events.
#[derive(Debug, Clone)]
pub struct TradeEventBus {
    tx: broadcast::Sender<TradeEvent>,
}

impl TradeEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TradeEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: TradeEvent) {
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    /// Merge two independent sources into the bus until both have ended.
    /// Order is preserved within each source only.
    pub fn attach(
        &self,
        mut primary: mpsc::UnboundedReceiver<TradeEvent>,
        mut auxiliary: mpsc::UnboundedReceiver<TradeEvent>,
    ) -> JoinHandle<()> {
        let bus = self.clone();
        tokio::spawn(async move {
            let mut primary_open = true;
            let mut auxiliary_open = true;
            while primary_open || auxiliary_open {
                tokio::select! {
                    event = primary.recv(), if primary_open => match event {
                        Some(event) => bus.publish(event),
                        None => primary_open = false,
                    },
                    event = auxiliary.recv(), if auxiliary_open => match event {
                        Some(event) => bus.publish(event),
                        None => auxiliary_open = false,
                    },
                }
            }
            warn!("Trade event sources ended");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn normalizer() -> EventNormalizer {
        let mut n = EventNormalizer::new();
        n.set_account("CR100", "USD");
        n
    }

    fn poc(contract_id: u64, is_sold: bool, profit: f64) -> Value {
        json!({
            "msg_type": "proposal_open_contract",
            "subscription": {"id": "poc-1"},
            "proposal_open_contract": {
                "contract_id": contract_id,
                "contract_type": "CALL",
                "underlying": "R_100",
                "buy_price": 10,
                "currency": "USD",
                "tick_count": 5,
                "date_start": 1_700_000_000,
                "purchase_time": 1_700_000_000,
                "is_sold": is_sold as u8,
                "status": if is_sold { if profit > 0.0 { "won" } else { "lost" } } else { "open" },
                "profit": profit,
                "transaction_ids": {"buy": contract_id * 2, "sell": contract_id * 2 + 1}
            }
        })
    }

    #[test]
    fn test_duration_from_dates_saturates() {
        let mut n = normalizer();
        let msg = |contract_id: u64, expiry: i64| {
            json!({
                "msg_type": "proposal_open_contract",
                "proposal_open_contract": {
                    "contract_id": contract_id,
                    "contract_type": "CALL",
                    "underlying": "R_100",
                    "buy_price": 10,
                    "currency": "USD",
                    "date_start": 1_700_000_000,
                    "date_expiry": expiry,
                    "is_sold": 0
                }
            })
        };

        let events = n.normalize(StreamKind::OpenContract, &msg(1, 1_700_000_060));
        let TradeEvent::Buy(buy) = &events[0] else {
            panic!("expected buy");
        };
        assert_eq!(buy.order.duration, 60);
        assert_eq!(buy.order.duration_unit, "s");

        let events = n.normalize(StreamKind::OpenContract, &msg(2, i64::MAX));
        let TradeEvent::Buy(buy) = &events[0] else {
            panic!("expected buy");
        };
        assert_eq!(buy.order.duration, u32::MAX);
    }

    #[test]
    fn test_open_contract_yields_buy_once_then_sell_once() {
        let mut n = normalizer();

        let first = n.normalize(StreamKind::OpenContract, &poc(7, false, 0.0));
        assert_eq!(first.len(), 1);
        let TradeEvent::Buy(buy) = &first[0] else {
            panic!("expected buy");
        };
        assert_eq!(buy.account, "CR100");
        assert_eq!(buy.transaction_id, Some(14));
        assert_eq!(buy.order.amount, dec!(10));
        assert_eq!(buy.order.duration, 5);
        assert_eq!(buy.order.duration_unit, "t");

        assert!(n.normalize(StreamKind::OpenContract, &poc(7, false, 0.0)).is_empty());

        let sold = n.normalize(StreamKind::OpenContract, &poc(7, true, -10.0));
        assert_eq!(sold.len(), 1);
        let TradeEvent::Sell(s) = &sold[0] else {
            panic!("expected sell");
        };
        assert_eq!(s.outcome, Outcome::Lost);
        assert_eq!(s.sell_transaction_id, Some(15));

        assert!(n.normalize(StreamKind::OpenContract, &poc(7, true, -10.0)).is_empty());
    }

    #[test]
    fn test_first_sighting_already_sold_is_not_a_buy() {
        let mut n = normalizer();
        let events = n.normalize(StreamKind::OpenContract, &poc(9, true, 8.5));
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], TradeEvent::Sell(s) if s.outcome == Outcome::Won));
    }

    #[test]
    fn test_balance_sources() {
        let mut n = normalizer();
        let from_balance = n.normalize(
            StreamKind::Balance,
            &json!({"msg_type": "balance", "balance": {"balance": 95.5, "currency": "USD", "loginid": "CR100"}}),
        );
        assert_eq!(
            from_balance,
            vec![TradeEvent::Balance(BalanceUpdate {
                account: "CR100".into(),
                currency: "USD".into(),
                balance: dec!(95.5),
            })]
        );

        let from_tx = n.normalize(
            StreamKind::Transaction,
            &json!({"msg_type": "transaction", "transaction": {"action": "buy", "amount": -10, "balance": 85.5}}),
        );
        assert!(matches!(&from_tx[0], TradeEvent::Balance(b) if b.balance == dec!(85.5)));

        // Subscription acknowledgement without data.
        assert!(n
            .normalize(StreamKind::Transaction, &json!({"msg_type": "transaction", "transaction": {}}))
            .is_empty());
    }

    #[test]
    fn test_bounded_set_forgets_oldest() {
        let mut set = BoundedSet::new(2);
        assert!(set.insert(1));
        assert!(set.insert(2));
        assert!(!set.insert(2));
        assert!(set.insert(3));
        assert!(set.insert(1));
    }

    #[tokio::test]
    async fn test_fan_in_merges_both_sources() {
        let bus = TradeEventBus::new(16);
        let mut rx = bus.subscribe();
        let (primary_tx, primary_rx) = mpsc::unbounded_channel();
        let (aux_tx, aux_rx) = mpsc::unbounded_channel();
        let task = bus.attach(primary_rx, aux_rx);

        let balance = |account: &str| {
            TradeEvent::Balance(BalanceUpdate {
                account: account.to_string(),
                currency: "USD".to_string(),
                balance: dec!(1),
            })
        };
        primary_tx.send(balance("from-session")).unwrap();
        aux_tx.send(balance("from-executor")).unwrap();
        drop(primary_tx);
        drop(aux_tx);
        task.await.unwrap();

        let mut accounts = vec![
            rx.recv().await.unwrap().account().to_string(),
            rx.recv().await.unwrap().account().to_string(),
        ];
        accounts.sort();
        assert_eq!(accounts, vec!["from-executor", "from-session"]);
    }
}
