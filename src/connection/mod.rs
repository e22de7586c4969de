//! Venue connectivity: transports, failover, subscriptions, pacing and retry.

mod failover;
mod manager;
mod rate_limiter;
mod retry;
mod subscriptions;
mod transport;

pub use failover::FailoverList;
pub use manager::{ConnectionConfig, ConnectionManager, TransportState};
pub use rate_limiter::RateLimiter;
pub use retry::{classify, send_with_retry, RetryPolicy, FATAL_CODES};
pub use subscriptions::{SubscriptionHandle, SubscriptionRegistry};
pub use transport::{Connector, Frame, TransportHandle, WsConnector};
