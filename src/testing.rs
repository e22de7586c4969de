//! Scripted venue used by the async tests.
//!
//! `MockVenue` implements [`Connector`]: every socket it opens is answered by
//! a handler closure built per connection. Requests are recorded together
//! with the (tokio) instant they were sent, so tests running on paused time
//! can assert on spacing.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::connection::{Connector, Frame, TransportHandle};
use crate::error::TransportError;

pub type Handler = Box<dyn FnMut(&Value) -> Vec<Value> + Send>;

const REQUEST_KEYS: &[&str] = &[
    "authorize",
    "active_symbols",
    "forget",
    "ping",
    "balance",
    "transaction",
    "proposal_open_contract",
    "proposal",
    "buy",
];

/// Operation named by a request payload.
pub fn request_key(payload: &Value) -> Option<&'static str> {
    REQUEST_KEYS
        .iter()
        .copied()
        .find(|key| payload.get(*key).is_some())
}

#[derive(Debug, Clone)]
pub struct SentRequest {
    pub at: Instant,
    /// Index of the socket, in connect order
    pub connection: usize,
    pub payload: Value,
}

impl SentRequest {
    pub fn key(&self) -> Option<&'static str> {
        request_key(&self.payload)
    }
}

struct Inner {
    factory: Box<dyn Fn() -> Handler + Send + Sync>,
    sent: Mutex<Vec<SentRequest>>,
    connects: Mutex<Vec<String>>,
    fail_next: AtomicUsize,
    live: Mutex<Vec<mpsc::UnboundedSender<Frame>>>,
}

#[derive(Clone)]
pub struct MockVenue {
    inner: Arc<Inner>,
}

impl MockVenue {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Handler + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                factory: Box::new(factory),
                sent: Mutex::new(Vec::new()),
                connects: Mutex::new(Vec::new()),
                fail_next: AtomicUsize::new(0),
                live: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn fail_next_connects(&self, n: usize) {
        self.inner.fail_next.store(n, Ordering::SeqCst);
    }

    /// Connect attempts, including refused ones.
    pub fn connect_count(&self) -> usize {
        self.inner.connects.lock().len()
    }

    pub fn connect_urls(&self) -> Vec<String> {
        self.inner.connects.lock().clone()
    }

    pub fn sent(&self) -> Vec<SentRequest> {
        self.inner.sent.lock().clone()
    }

    pub fn sent_of(&self, key: &str) -> Vec<SentRequest> {
        self.inner
            .sent
            .lock()
            .iter()
            .filter(|r| r.key() == Some(key))
            .cloned()
            .collect()
    }

    /// Deliver a frame on the most recently opened socket.
    pub fn inject(&self, frame: Frame) {
        if let Some(tx) = self.inner.live.lock().last() {
            let _ = tx.send(frame);
        }
    }

    /// Deliver a frame on the `index`-th socket opened.
    pub fn inject_on(&self, index: usize, frame: Frame) {
        if let Some(tx) = self.inner.live.lock().get(index) {
            let _ = tx.send(frame);
        }
    }

    pub fn push(&self, msg: Value) {
        self.inject(Frame::Text(msg.to_string()));
    }

    /// Venue that knows `script.accounts` and answers the protocol subset
    /// used by sessions and replication.
    pub fn scripted(script: Script) -> Self {
        let script = Arc::new(script);
        let counter = Arc::new(AtomicU64::new(0));
        Self::new(move || {
            let mut conn = ScriptedConnection {
                script: Arc::clone(&script),
                counter: Arc::clone(&counter),
                account: None,
                seen: HashMap::new(),
            };
            Box::new(move |req: &Value| conn.answer(req))
        })
    }
}

struct MockConnector {
    inner: Arc<Inner>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<TransportHandle, TransportError> {
        self.inner.connects.lock().push(url.to_string());
        if self
            .inner
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::Connect(format!("refused {url}")));
        }

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();
        let connection = {
            let mut live = self.inner.live.lock();
            live.push(in_tx.clone());
            live.len() - 1
        };

        let mut handler = (self.inner.factory)();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                let Ok(request) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                inner.sent.lock().push(SentRequest {
                    at: Instant::now(),
                    connection,
                    payload: request.clone(),
                });
                for mut reply in handler(&request) {
                    if let (Some(obj), Some(id)) = (reply.as_object_mut(), request.get("req_id")) {
                        obj.entry("req_id").or_insert_with(|| id.clone());
                    }
                    if in_tx.send(Frame::Text(reply.to_string())).is_err() {
                        return;
                    }
                }
            }
        });

        Ok(TransportHandle {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ScriptedAccount {
    pub token: String,
    pub loginid: String,
    pub currency: String,
    pub balance: Decimal,
    pub is_virtual: bool,
}

impl ScriptedAccount {
    pub fn new(token: &str, loginid: &str, balance: Decimal, is_virtual: bool) -> Self {
        Self {
            token: token.to_string(),
            loginid: loginid.to_string(),
            currency: "USD".to_string(),
            balance,
            is_virtual,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Script {
    pub accounts: Vec<ScriptedAccount>,
    /// Request keys that are never answered
    pub silent: Vec<&'static str>,
    /// Request keys answered with the given error code
    pub reject: Vec<(&'static str, &'static str)>,
    /// Tokens rejected as invalid from now on
    pub revoked: Arc<Mutex<HashSet<String>>>,
    /// Request keys answered with `RateLimit` for the first n requests on
    /// each connection
    pub throttled: Vec<(&'static str, usize)>,
}

impl Script {
    pub fn with_accounts(accounts: Vec<ScriptedAccount>) -> Self {
        Self {
            accounts,
            ..Self::default()
        }
    }
}

struct ScriptedConnection {
    script: Arc<Script>,
    counter: Arc<AtomicU64>,
    account: Option<ScriptedAccount>,
    seen: HashMap<&'static str, usize>,
}

fn num(d: Decimal) -> Value {
    json!(d.to_f64().unwrap_or_default())
}

fn venue_error(key: &str, code: &str) -> Value {
    json!({ "msg_type": key, "error": { "code": code, "message": format!("{code} (scripted)") } })
}

impl ScriptedConnection {
    fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn answer(&mut self, req: &Value) -> Vec<Value> {
        let Some(key) = request_key(req) else {
            return Vec::new();
        };
        if self.script.silent.contains(&key) {
            return Vec::new();
        }
        if let Some((_, code)) = self.script.reject.iter().find(|(k, _)| *k == key) {
            return vec![venue_error(key, code)];
        }
        let seen = self.seen.entry(key).or_insert(0);
        *seen += 1;
        if let Some((_, n)) = self.script.throttled.iter().find(|(k, _)| *k == key) {
            if *seen <= *n {
                return vec![venue_error(key, "RateLimit")];
            }
        }

        let subscribe = req.get("subscribe").is_some();
        let needs_auth = !matches!(key, "authorize" | "active_symbols" | "forget" | "ping");
        if needs_auth && self.account.is_none() {
            return vec![venue_error(key, "AuthorizationRequired")];
        }

        let reply = match key {
            "authorize" => {
                let token = req["authorize"].as_str().unwrap_or_default();
                if self.script.revoked.lock().contains(token) {
                    return vec![venue_error(key, "InvalidToken")];
                }
                let Some(account) = self.script.accounts.iter().find(|a| a.token == token) else {
                    return vec![venue_error(key, "InvalidToken")];
                };
                self.account = Some(account.clone());
                let list: Vec<Value> = self
                    .script
                    .accounts
                    .iter()
                    .map(|a| json!({ "loginid": a.loginid, "currency": a.currency, "is_virtual": a.is_virtual as u8 }))
                    .collect();
                json!({
                    "msg_type": "authorize",
                    "authorize": {
                        "loginid": account.loginid,
                        "currency": account.currency,
                        "balance": num(account.balance),
                        "is_virtual": account.is_virtual as u8,
                        "account_list": list,
                    }
                })
            }
            "active_symbols" => json!({
                "msg_type": "active_symbols",
                "active_symbols": [
                    { "symbol": "R_100", "display_name": "Volatility 100 Index", "market": "synthetic_index", "exchange_is_open": 1 }
                ]
            }),
            "forget" => json!({ "msg_type": "forget", "forget": 1 }),
            "ping" => json!({ "msg_type": "ping", "ping": "pong" }),
            "balance" => {
                let account = self.account.clone().unwrap_or_else(|| self.script.accounts[0].clone());
                let mut msg = json!({
                    "msg_type": "balance",
                    "balance": { "balance": num(account.balance), "currency": account.currency, "loginid": account.loginid }
                });
                if subscribe {
                    msg["subscription"] = json!({ "id": format!("bal-{}", self.next()) });
                }
                msg
            }
            "transaction" | "proposal_open_contract" => json!({
                "msg_type": key,
                key: {},
                "subscription": { "id": format!("{key}-{}", self.next()) }
            }),
            "proposal" => {
                let amount = req["amount"].as_f64().unwrap_or_default();
                json!({
                    "msg_type": "proposal",
                    "proposal": {
                        "id": format!("prop-{}", self.next()),
                        "ask_price": amount,
                        "payout": amount * 1.95,
                        "longcode": "scripted contract"
                    },
                    "passthrough": req["passthrough"].clone()
                })
            }
            "buy" => {
                let price = req["price"].as_f64().unwrap_or_default();
                let balance = self
                    .account
                    .as_ref()
                    .and_then(|a| a.balance.to_f64())
                    .unwrap_or_default();
                let id = self.next();
                json!({
                    "msg_type": "buy",
                    "buy": {
                        "contract_id": 1000 + id,
                        "transaction_id": 5000 + id,
                        "buy_price": price,
                        "balance_after": balance - price,
                        "longcode": "scripted contract",
                        "start_time": 1_700_000_000 + id
                    },
                    "passthrough": req["passthrough"].clone()
                })
            }
            _ => return Vec::new(),
        };
        vec![reply]
    }
}
