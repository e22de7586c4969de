//! Contract model: what gets bought, and how it ended.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Parameters of a contract purchase, independent of the account placing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractOrder {
    /// Underlying symbol (e.g. "R_100")
    pub symbol: String,

    /// Venue contract type (e.g. "CALL", "PUT", "DIGITEVEN")
    pub contract_type: String,

    /// Stake in account currency
    pub amount: Decimal,

    /// Contract duration, in `duration_unit`
    pub duration: u32,

    /// "t" ticks, "s" seconds, "m" minutes, "h" hours, "d" days
    pub duration_unit: String,

    /// Optional barrier for barrier contracts
    #[serde(default)]
    pub barrier: Option<String>,
}

impl ContractOrder {
    /// Same contract with a different stake.
    pub fn with_amount(&self, amount: Decimal) -> Self {
        Self {
            amount,
            ..self.clone()
        }
    }
}

/// Terminal state of a settled contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Won,
    Lost,
}

impl Outcome {
    /// Classify by realized profit; break-even counts as a loss.
    pub fn from_profit(profit: Decimal) -> Self {
        if profit > Decimal::ZERO {
            Outcome::Won
        } else {
            Outcome::Lost
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Won => "won",
            Outcome::Lost => "lost",
        }
    }
}

/// A purchase observed on some account.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractPurchase {
    /// Account that bought the contract
    pub account: String,

    pub contract_id: u64,

    /// Buy transaction id; absent when the source did not report one
    pub transaction_id: Option<u64>,

    pub order: ContractOrder,

    pub currency: String,

    pub timestamp: DateTime<Utc>,
}

impl ContractPurchase {
    /// Key used to recognise the same purchase arriving from several sources.
    pub fn dedup_key(&self) -> String {
        match self.transaction_id {
            Some(tx) => format!("tx:{tx}"),
            None => format!("contract:{}", self.contract_id),
        }
    }
}

/// A contract reaching its terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub account: String,
    pub contract_id: u64,
    pub sell_transaction_id: Option<u64>,
    pub outcome: Outcome,
    pub profit: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_dedup_key_prefers_transaction_id() {
        let order = ContractOrder {
            symbol: "R_100".to_string(),
            contract_type: "CALL".to_string(),
            amount: dec!(10),
            duration: 5,
            duration_unit: "t".to_string(),
            barrier: None,
        };
        let mut purchase = ContractPurchase {
            account: "CR1".to_string(),
            contract_id: 9,
            transaction_id: Some(42),
            order,
            currency: "USD".to_string(),
            timestamp: Utc::now(),
        };
        assert_eq!(purchase.dedup_key(), "tx:42");

        purchase.transaction_id = None;
        assert_eq!(purchase.dedup_key(), "contract:9");
    }

    #[test]
    fn test_outcome_from_profit() {
        assert_eq!(Outcome::from_profit(dec!(9.5)), Outcome::Won);
        assert_eq!(Outcome::from_profit(dec!(-10)), Outcome::Lost);
        assert_eq!(Outcome::from_profit(Decimal::ZERO), Outcome::Lost);
    }
}
