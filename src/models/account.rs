//! Account identity and balance bookkeeping.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};

/// Render a credential for display: first 4 chars, mask, last 2 chars.
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 6 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{head}****{tail}")
}

/// Snapshot of an account as last reported by the venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub loginid: String,
    pub currency: String,
    pub balance: Decimal,
    pub is_virtual: bool,
}

/// Balance with a two-phase update: speculative deltas are applied on top of
/// the last confirmed value and discarded once the venue confirms.
#[derive(Debug, Clone, Default)]
pub struct BalanceCache {
    confirmed: Decimal,
    speculative: Decimal,
    confirmed_at: Option<DateTime<Utc>>,
    pending_since: Option<Instant>,
}

impl BalanceCache {
    pub fn new(confirmed: Decimal) -> Self {
        Self {
            confirmed,
            speculative: Decimal::ZERO,
            confirmed_at: Some(Utc::now()),
            pending_since: None,
        }
    }

    /// Value to display: confirmed balance plus outstanding speculation.
    pub fn current(&self) -> Decimal {
        self.confirmed + self.speculative
    }

    /// Last value the venue confirmed.
    pub fn confirmed(&self) -> Decimal {
        self.confirmed
    }

    pub fn confirmed_at(&self) -> Option<DateTime<Utc>> {
        self.confirmed_at
    }

    pub fn apply_speculative(&mut self, delta: Decimal) {
        self.speculative += delta;
        self.pending_since.get_or_insert_with(Instant::now);
    }

    /// Overwrite with the authoritative value. Never summed with speculation.
    pub fn confirm(&mut self, balance: Decimal) {
        self.confirmed = balance;
        self.speculative = Decimal::ZERO;
        self.confirmed_at = Some(Utc::now());
        self.pending_since = None;
    }

    pub fn has_pending(&self) -> bool {
        self.pending_since.is_some()
    }

    /// True when speculation has waited longer than `max_wait` for confirmation.
    pub fn is_stale(&self, max_wait: Duration) -> bool {
        self.pending_since
            .map(|since| since.elapsed() >= max_wait)
            .unwrap_or(false)
    }
}
