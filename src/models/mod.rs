//! Data models for accounts, contracts and settlements.

mod account;
mod contract;

pub use account::{mask_token, AccountSnapshot, BalanceCache};
pub use contract::{ContractOrder, ContractPurchase, Outcome, Settlement};
