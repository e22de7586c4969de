//! Replication settings.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Which subordinate accounts receive replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyTarget {
    #[default]
    All,
    RealOnly,
    VirtualOnly,
}

impl CopyTarget {
    pub fn accepts(&self, is_virtual: bool) -> bool {
        match self {
            CopyTarget::All => true,
            CopyTarget::RealOnly => !is_virtual,
            CopyTarget::VirtualOnly => is_virtual,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CopyTarget::All => "all",
            CopyTarget::RealOnly => "real",
            CopyTarget::VirtualOnly => "virtual",
        }
    }
}

impl FromStr for CopyTarget {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "all" => Ok(Self::All),
            "real" | "real_only" => Ok(Self::RealOnly),
            "virtual" | "virtual_only" | "demo" => Ok(Self::VirtualOnly),
            other => bail!("Unknown copy target: {other}"),
        }
    }
}

impl fmt::Display for CopyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Risk limits and switches of the replication engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationSettings {
    /// Master switch for copying
    pub enabled: bool,

    /// Cap on a replica stake as a percentage of the subordinate balance
    pub max_stake_percent: Decimal,

    /// Factor applied to the master stake
    pub stake_multiplier: Decimal,

    /// Realized loss per subordinate and UTC day after which copying to it
    /// stops; zero disables the limit
    pub daily_loss_limit: Decimal,

    /// Which subordinates are eligible
    pub copy_target: CopyTarget,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_stake_percent: dec!(5),  // 5% of subordinate balance
            stake_multiplier: dec!(1),   // Same stake as master
            daily_loss_limit: dec!(0),   // Unlimited
            copy_target: CopyTarget::All,
        }
    }
}

impl ReplicationSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_stake_percent <= Decimal::ZERO || self.max_stake_percent > dec!(100) {
            bail!("max_stake_percent must be in (0, 100], got {}", self.max_stake_percent);
        }
        if self.stake_multiplier <= Decimal::ZERO {
            bail!("stake_multiplier must be positive, got {}", self.stake_multiplier);
        }
        if self.daily_loss_limit < Decimal::ZERO {
            bail!("daily_loss_limit cannot be negative");
        }
        Ok(())
    }

    pub fn has_loss_limit(&self) -> bool {
        self.daily_loss_limit > Decimal::ZERO
    }
}
