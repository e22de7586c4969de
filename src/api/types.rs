//! Wire shapes of the venue's JSON protocol.
//!
//! Responses are plain JSON objects: the payload lives under a key named
//! after the request (`authorize`, `proposal`, `buy`, ...), failures under
//! `error`, and stream pushes carry `subscription.id`.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::error::ApiError;

/// `error` section of a failed response.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    #[serde(default)]
    pub message: String,
}

/// `authorize` section.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizeInfo {
    pub loginid: String,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub balance: Decimal,
    #[serde(default, deserialize_with = "flag")]
    pub is_virtual: bool,
    #[serde(default)]
    pub account_list: Vec<AccountListEntry>,
}

/// One entry of the account list returned with `authorize`.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountListEntry {
    pub loginid: String,
    #[serde(default)]
    pub currency: String,
    #[serde(default, deserialize_with = "flag")]
    pub is_virtual: bool,
}

/// `proposal` section: a price quote that can be bought by id.
#[derive(Debug, Clone, Deserialize)]
pub struct ProposalQuote {
    pub id: String,
    pub ask_price: Decimal,
    #[serde(default)]
    pub payout: Decimal,
    #[serde(default)]
    pub longcode: String,
}

/// `buy` section.
#[derive(Debug, Clone, Deserialize)]
pub struct BuyReceipt {
    pub contract_id: u64,
    pub transaction_id: u64,
    pub buy_price: Decimal,
    #[serde(default)]
    pub balance_after: Option<Decimal>,
    #[serde(default)]
    pub longcode: String,
    #[serde(default)]
    pub start_time: Option<i64>,
}

/// `balance` section, either a one-off answer or a stream push.
#[derive(Debug, Clone, Deserialize)]
pub struct BalancePush {
    pub balance: Decimal,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub loginid: String,
}

/// `transaction` stream push.
#[derive(Debug, Clone, Deserialize)]
pub struct TransactionPush {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub balance: Option<Decimal>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub contract_id: Option<u64>,
    #[serde(default)]
    pub transaction_id: Option<u64>,
    #[serde(default)]
    pub transaction_time: Option<i64>,
}

/// `proposal_open_contract` stream push.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenContract {
    #[serde(default)]
    pub contract_id: Option<u64>,
    #[serde(default)]
    pub contract_type: String,
    #[serde(default)]
    pub underlying: String,
    #[serde(default)]
    pub buy_price: Decimal,
    #[serde(default)]
    pub currency: String,
    #[serde(default)]
    pub date_start: Option<i64>,
    #[serde(default)]
    pub date_expiry: Option<i64>,
    #[serde(default)]
    pub purchase_time: Option<i64>,
    #[serde(default)]
    pub tick_count: Option<u32>,
    #[serde(default)]
    pub barrier: Option<String>,
    #[serde(default, deserialize_with = "flag")]
    pub is_sold: bool,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub profit: Decimal,
    #[serde(default)]
    pub transaction_ids: Option<TransactionIds>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TransactionIds {
    #[serde(default)]
    pub buy: Option<u64>,
    #[serde(default)]
    pub sell: Option<u64>,
}

/// One entry of `active_symbols`.
#[derive(Debug, Clone, Deserialize)]
pub struct ActiveSymbol {
    pub symbol: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub market: String,
    #[serde(default, deserialize_with = "flag")]
    pub exchange_is_open: bool,
}

/// The venue encodes booleans as 0/1 integers; accept both forms.
fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Bool(b) => b,
        Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        Value::String(s) => s == "1" || s.eq_ignore_ascii_case("true"),
        _ => false,
    })
}

/// Extract the venue error carried by a response, if any.
pub fn error_of(msg: &Value) -> Option<ApiError> {
    let body = msg.get("error")?;
    match serde_json::from_value::<ErrorBody>(body.clone()) {
        Ok(err) => Some(ApiError::Venue {
            code: err.code,
            message: err.message,
        }),
        Err(e) => Some(ApiError::Decode(format!("unreadable error body: {e}"))),
    }
}

/// Deserialize the payload section named `key`.
pub fn section<T: serde::de::DeserializeOwned>(msg: &Value, key: &str) -> Result<T, ApiError> {
    let body = msg
        .get(key)
        .ok_or_else(|| ApiError::Decode(format!("response has no `{key}` section")))?;
    serde_json::from_value(body.clone()).map_err(|e| ApiError::Decode(format!("{key}: {e}")))
}

pub fn req_id(msg: &Value) -> Option<u64> {
    msg.get("req_id").and_then(Value::as_u64)
}

pub fn msg_type(msg: &Value) -> Option<&str> {
    msg.get("msg_type").and_then(Value::as_str)
}

pub fn subscription_id(msg: &Value) -> Option<&str> {
    msg.get("subscription")
        .and_then(|s| s.get("id"))
        .and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_authorize_flags_and_accounts() {
        let msg = json!({
            "msg_type": "authorize",
            "req_id": 3,
            "authorize": {
                "loginid": "VRTC100",
                "currency": "USD",
                "balance": 10000.5,
                "is_virtual": 1,
                "account_list": [
                    {"loginid": "VRTC100", "currency": "USD", "is_virtual": 1},
                    {"loginid": "CR200", "currency": "USD", "is_virtual": 0}
                ]
            }
        });

        let info: AuthorizeInfo = section(&msg, "authorize").unwrap();
        assert!(info.is_virtual);
        assert_eq!(info.balance, dec!(10000.5));
        assert_eq!(info.account_list.len(), 2);
        assert!(!info.account_list[1].is_virtual);
        assert_eq!(req_id(&msg), Some(3));
        assert_eq!(msg_type(&msg), Some("authorize"));
    }

    #[test]
    fn test_error_extraction() {
        let msg = json!({
            "msg_type": "authorize",
            "error": {"code": "InvalidToken", "message": "The token is invalid."}
        });
        let err = error_of(&msg).unwrap();
        assert!(err.is_invalid_token());

        assert!(error_of(&json!({"ping": "pong"})).is_none());
    }

    #[test]
    fn test_open_contract_push() {
        let msg = json!({
            "msg_type": "proposal_open_contract",
            "subscription": {"id": "abc"},
            "proposal_open_contract": {
                "contract_id": 77,
                "contract_type": "CALL",
                "underlying": "R_100",
                "buy_price": 10,
                "currency": "USD",
                "is_sold": 1,
                "status": "lost",
                "profit": -10,
                "transaction_ids": {"buy": 501, "sell": 502}
            }
        });

        let poc: OpenContract = section(&msg, "proposal_open_contract").unwrap();
        assert!(poc.is_sold);
        assert_eq!(poc.profit, dec!(-10));
        assert_eq!(poc.transaction_ids.unwrap().sell, Some(502));
        assert_eq!(subscription_id(&msg), Some("abc"));
    }

    #[test]
    fn test_missing_section_is_decode_error() {
        let err = section::<ProposalQuote>(&json!({"msg_type": "proposal"}), "proposal").unwrap_err();
        assert!(matches!(err, ApiError::Decode(_)));
    }
}
