//! Request builders. Every builder returns a JSON object; the connection
//! manager stamps `req_id` onto it before sending.

use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};

use crate::models::ContractOrder;

/// Push streams a session can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamKind {
    Balance,
    Transaction,
    OpenContract,
}

impl StreamKind {
    /// Request/response key of the stream.
    pub fn key(&self) -> &'static str {
        match self {
            StreamKind::Balance => "balance",
            StreamKind::Transaction => "transaction",
            StreamKind::OpenContract => "proposal_open_contract",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "balance" => Some(StreamKind::Balance),
            "transaction" => Some(StreamKind::Transaction),
            "proposal_open_contract" => Some(StreamKind::OpenContract),
            _ => None,
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Serialize)]
struct ProposalRequest<'a> {
    proposal: u8,
    #[serde(with = "rust_decimal::serde::float")]
    amount: Decimal,
    basis: &'static str,
    contract_type: &'a str,
    currency: &'a str,
    duration: u32,
    duration_unit: &'a str,
    symbol: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    barrier: Option<&'a str>,
    passthrough: Value,
}

#[derive(Debug, Serialize)]
struct BuyRequest<'a> {
    buy: &'a str,
    #[serde(with = "rust_decimal::serde::float")]
    price: Decimal,
    passthrough: Value,
}

pub fn authorize(token: &str) -> Value {
    json!({ "authorize": token })
}

pub fn active_symbols() -> Value {
    json!({ "active_symbols": "brief", "product_type": "basic" })
}

pub fn subscribe(stream: StreamKind) -> Value {
    json!({ stream.key(): 1, "subscribe": 1 })
}

pub fn forget(subscription_id: &str) -> Value {
    json!({ "forget": subscription_id })
}

/// One-off balance query, used when a push was missed.
pub fn balance() -> Value {
    json!({ "balance": 1 })
}

pub fn ping() -> Value {
    json!({ "ping": 1 })
}

/// Price quote for `order` in `currency`, tagged with a correlation id.
pub fn proposal(order: &ContractOrder, currency: &str, correlation_id: &str) -> Value {
    let request = ProposalRequest {
        proposal: 1,
        amount: order.amount,
        basis: "stake",
        contract_type: &order.contract_type,
        currency,
        duration: order.duration,
        duration_unit: &order.duration_unit,
        symbol: &order.symbol,
        barrier: order.barrier.as_deref(),
        passthrough: json!({ "correlation_id": correlation_id }),
    };
    serde_json::to_value(request).unwrap_or(Value::Null)
}

/// Purchase a quoted proposal at its ask price.
pub fn buy(proposal_id: &str, price: Decimal, correlation_id: &str) -> Value {
    let request = BuyRequest {
        buy: proposal_id,
        price,
        passthrough: json!({ "correlation_id": correlation_id }),
    };
    serde_json::to_value(request).unwrap_or(Value::Null)
}
