//! Virtual hook: swaps the trading account between a virtual and a real
//! account based on loss and trade streaks.
//!
//! The switch is decided when a purchase is about to be placed; counters
//! move only when a contract placed in the current mode settles:
//! - VIRTUAL: a loss increments `consecutive_losses`, a win resets it
//! - REAL: every settlement increments `real_trade_count`
//!
//! State is process-lifetime only.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::models::Outcome;
use crate::session::KnownAccount;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Virtual,
    Real,
}

impl Mode {
    pub fn of_account(is_virtual: bool) -> Self {
        if is_virtual {
            Mode::Virtual
        } else {
            Mode::Real
        }
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, Mode::Virtual)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Virtual => "VIRTUAL",
            Mode::Real => "REAL",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How many real trades run before returning to virtual.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RealTradesCondition {
    Immediately,
    After(u32),
}

impl RealTradesCondition {
    pub fn threshold(&self) -> u32 {
        match self {
            RealTradesCondition::Immediately => 1,
            RealTradesCondition::After(n) => (*n).max(1),
        }
    }
}

impl FromStr for RealTradesCondition {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("immediately") {
            return Ok(Self::Immediately);
        }
        match s.parse::<u32>() {
            Ok(n) if n > 0 => Ok(Self::After(n)),
            _ => bail!("Real trades condition must be a positive number or \"immediately\", got {s}"),
        }
    }
}

impl fmt::Display for RealTradesCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RealTradesCondition::Immediately => f.write_str("immediately"),
            RealTradesCondition::After(n) => write!(f, "{n}"),
        }
    }
}

/// Virtual hook thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualHookConfig {
    pub enabled: bool,

    /// Consecutive virtual losses before switching to real
    pub virtual_trades_condition: u32,

    /// Real trades before switching back to virtual
    pub real_trades_condition: RealTradesCondition,

    /// Login id of the virtual account to switch to; picked automatically
    /// when unset
    #[serde(default)]
    pub virtual_counterpart: Option<String>,

    /// Login id of the real account to switch to
    #[serde(default)]
    pub real_counterpart: Option<String>,
}

impl Default for VirtualHookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            virtual_trades_condition: 2,
            real_trades_condition: RealTradesCondition::Immediately,
            virtual_counterpart: None,
            real_counterpart: None,
        }
    }
}

impl VirtualHookConfig {
    pub fn counterpart_for(&self, mode: Mode) -> Option<&str> {
        match mode {
            Mode::Virtual => self.virtual_counterpart.as_deref(),
            Mode::Real => self.real_counterpart.as_deref(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VirtualHook {
    config: VirtualHookConfig,
    mode: Mode,
    consecutive_losses: u32,
    real_trade_count: u32,
}

impl VirtualHook {
    pub fn new(config: VirtualHookConfig, mode: Mode) -> Self {
        Self {
            config,
            mode,
            consecutive_losses: 0,
            real_trade_count: 0,
        }
    }

    pub fn config(&self) -> &VirtualHookConfig {
        &self.config
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn consecutive_losses(&self) -> u32 {
        self.consecutive_losses
    }

    pub fn real_trade_count(&self) -> u32 {
        self.real_trade_count
    }

    /// Mode the next purchase should be placed in, if different from the
    /// current one.
    pub fn evaluate(&self) -> Option<Mode> {
        if !self.config.enabled {
            return None;
        }
        match self.mode {
            Mode::Virtual if self.consecutive_losses >= self.config.virtual_trades_condition => {
                Some(Mode::Real)
            }
            Mode::Real if self.real_trade_count >= self.config.real_trades_condition.threshold() => {
                Some(Mode::Virtual)
            }
            _ => None,
        }
    }

    /// Record a completed switch. Counters start over.
    pub fn commit_switch(&mut self, mode: Mode) {
        info!(from = %self.mode, to = %mode, "Virtual hook switched mode");
        self.mode = mode;
        self.consecutive_losses = 0;
        self.real_trade_count = 0;
    }

    /// Apply a settlement of a contract placed in `placed_in`. Ignored
    /// unless that is the current mode. Returns whether it was applied.
    pub fn on_settlement(&mut self, placed_in: Mode, outcome: Outcome) -> bool {
        if placed_in != self.mode {
            debug!(placed_in = %placed_in, mode = %self.mode, "Settlement from another mode ignored");
            return false;
        }
        match (self.mode, outcome) {
            (Mode::Virtual, Outcome::Lost) => self.consecutive_losses += 1,
            (Mode::Virtual, Outcome::Won) => self.consecutive_losses = 0,
            (Mode::Real, _) => self.real_trade_count += 1,
        }
        true
    }
}

/// Result of looking for the account to switch to.
#[derive(Debug, Clone)]
pub enum Counterpart {
    Found(KnownAccount),
    Missing,
    Ambiguous(Vec<String>),
}

/// Pick the account of kind `target`. A configured login id wins; otherwise
/// exactly one known account of that kind must exist.
pub fn select_counterpart(accounts: &[KnownAccount], target: Mode, configured: Option<&str>) -> Counterpart {
    let mut candidates: Vec<&KnownAccount> = accounts
        .iter()
        .filter(|a| Mode::of_account(a.snapshot.is_virtual) == target)
        .collect();

    if let Some(loginid) = configured {
        candidates.retain(|a| a.snapshot.loginid == loginid);
    }

    match candidates.as_slice() {
        [] => Counterpart::Missing,
        [only] => Counterpart::Found((*only).clone()),
        many => Counterpart::Ambiguous(many.iter().map(|a| a.snapshot.loginid.clone()).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AccountSnapshot;
    use rust_decimal_macros::dec;

    fn hook(virtual_condition: u32, real: RealTradesCondition) -> VirtualHook {
        VirtualHook::new(
            VirtualHookConfig {
                enabled: true,
                virtual_trades_condition: virtual_condition,
                real_trades_condition: real,
                ..VirtualHookConfig::default()
            },
            Mode::Virtual,
        )
    }

    fn account(loginid: &str, is_virtual: bool) -> KnownAccount {
        KnownAccount {
            token: format!("tok-{loginid}"),
            snapshot: AccountSnapshot {
                loginid: loginid.to_string(),
                currency: "USD".to_string(),
                balance: dec!(100),
                is_virtual,
            },
            pinned: false,
        }
    }

    #[test]
    fn test_two_losses_flip_to_real() {
        let mut hook = hook(2, RealTradesCondition::Immediately);

        assert_eq!(hook.evaluate(), None);
        hook.on_settlement(Mode::Virtual, Outcome::Lost);
        assert_eq!(hook.evaluate(), None);
        hook.on_settlement(Mode::Virtual, Outcome::Lost);
        assert_eq!(hook.evaluate(), Some(Mode::Real));
    }

    #[test]
    fn test_win_before_second_loss_resets() {
        let mut hook = hook(2, RealTradesCondition::Immediately);

        hook.on_settlement(Mode::Virtual, Outcome::Lost);
        hook.on_settlement(Mode::Virtual, Outcome::Won);
        assert_eq!(hook.consecutive_losses(), 0);
        hook.on_settlement(Mode::Virtual, Outcome::Lost);

        assert_eq!(hook.evaluate(), None);
        assert_eq!(hook.mode(), Mode::Virtual);
    }

    #[test]
    fn test_real_mode_counts_every_settlement() {
        let mut hook = hook(1, RealTradesCondition::After(2));
        hook.commit_switch(Mode::Real);

        hook.on_settlement(Mode::Real, Outcome::Won);
        assert_eq!(hook.evaluate(), None);
        hook.on_settlement(Mode::Real, Outcome::Lost);
        assert_eq!(hook.real_trade_count(), 2);
        assert_eq!(hook.evaluate(), Some(Mode::Virtual));

        hook.commit_switch(Mode::Virtual);
        assert_eq!(hook.real_trade_count(), 0);
        assert_eq!(hook.consecutive_losses(), 0);
    }

    #[test]
    fn test_settlements_from_other_mode_are_ignored() {
        let mut hook = hook(2, RealTradesCondition::Immediately);
        hook.commit_switch(Mode::Real);

        // A virtual contract settling after the switch.
        assert!(!hook.on_settlement(Mode::Virtual, Outcome::Lost));
        assert_eq!(hook.real_trade_count(), 0);
        assert_eq!(hook.consecutive_losses(), 0);
    }

    #[test]
    fn test_disabled_hook_never_switches() {
        let mut hook = VirtualHook::new(VirtualHookConfig::default(), Mode::Virtual);
        for _ in 0..5 {
            hook.on_settlement(Mode::Virtual, Outcome::Lost);
        }
        assert_eq!(hook.evaluate(), None);
    }

    #[test]
    fn test_real_trades_condition_parsing() {
        assert_eq!("immediately".parse::<RealTradesCondition>().unwrap().threshold(), 1);
        assert_eq!("3".parse::<RealTradesCondition>().unwrap(), RealTradesCondition::After(3));
        assert!("0".parse::<RealTradesCondition>().is_err());
        assert!("soon".parse::<RealTradesCondition>().is_err());
    }

    #[test]
    fn test_counterpart_selection() {
        let accounts = vec![account("VRTC1", true), account("CR1", false), account("CR2", false)];

        match select_counterpart(&accounts, Mode::Virtual, None) {
            Counterpart::Found(a) => assert_eq!(a.snapshot.loginid, "VRTC1"),
            other => panic!("unexpected {other:?}"),
        }
        match select_counterpart(&accounts, Mode::Real, None) {
            Counterpart::Ambiguous(ids) => assert_eq!(ids, vec!["CR1", "CR2"]),
            other => panic!("unexpected {other:?}"),
        }
        match select_counterpart(&accounts, Mode::Real, Some("CR2")) {
            Counterpart::Found(a) => assert_eq!(a.token, "tok-CR2"),
            other => panic!("unexpected {other:?}"),
        }
        // A configured id of the wrong kind does not match.
        assert!(matches!(
            select_counterpart(&accounts, Mode::Real, Some("VRTC1")),
            Counterpart::Missing
        ));
        assert!(matches!(
            select_counterpart(&accounts[..1], Mode::Real, None),
            Counterpart::Missing
        ));
    }
}
