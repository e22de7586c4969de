//! Trade replication: master purchases mirrored onto subordinate accounts
//! under risk limits.

mod dedup;
mod engine;
mod settings;
mod sizing;
mod subordinate;

pub use dedup::DedupWindow;
pub use engine::{ReplicaOutcome, ReplicationEngine};
pub use settings::{CopyTarget, ReplicationSettings};
pub use sizing::compute_stake;
pub use subordinate::{Subordinate, SubordinateStatus};
