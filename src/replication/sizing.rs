//! Replica stake sizing.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

/// Stake for one subordinate:
/// `min(master_amount * multiplier, balance * max_stake_percent / 100)`,
/// floored at zero and truncated to cents so rounding can never push it
/// past the cap.
///
/// # Arguments
/// * `master_amount` - Stake of the master trade
/// * `balance` - Subordinate balance
/// * `multiplier` - Stake multiplier setting
/// * `max_stake_percent` - Cap as a percentage of `balance`
pub fn compute_stake(
    master_amount: Decimal,
    balance: Decimal,
    multiplier: Decimal,
    max_stake_percent: Decimal,
) -> Decimal {
    let scaled = master_amount * multiplier;
    let cap = balance * max_stake_percent / dec!(100);

    scaled
        .min(cap)
        .max(Decimal::ZERO)
        .round_dp_with_strategy(2, RoundingStrategy::ToZero)
}
