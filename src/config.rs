//! Runtime configuration loaded from the environment (and `.env`).

use std::time::Duration;

use anyhow::{Context, Result};

/// Default venue endpoints, primary first.
pub const DEFAULT_ENDPOINTS: &[&str] = &[
    "wss://ws.derivws.com/websockets/v3",
    "wss://ws.binaryws.com/websockets/v3",
];

/// Application configuration for connections, sessions and replication.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Failover list of WebSocket endpoints, primary first
    pub endpoints: Vec<String>,

    /// Application id appended to every endpoint URL
    pub app_id: String,

    /// Timeout for establishing a transport
    pub connect_timeout: Duration,

    /// Race timeout for a single authorize call
    pub authorize_timeout: Duration,

    /// Interval of the transport health check (and keepalive ping)
    pub health_check_interval: Duration,

    /// Minimum delay before a scheduled reconnect
    pub reconnect_debounce: Duration,

    /// Upper bound of the reconnect backoff
    pub max_reconnect_delay: Duration,

    /// Delay between consecutive subordinates during fan-out and restore
    pub stagger: Duration,

    /// Minimum spacing between outgoing proposal requests, system-wide
    pub min_request_interval: Duration,

    /// How long a replicated transaction id is remembered
    pub dedup_window: Duration,

    /// Bound on each leg of a proposal/buy round trip
    pub proposal_timeout: Duration,

    /// How long a speculative balance may wait for a venue confirmation
    pub balance_confirm_timeout: Duration,

    /// Total retry budget of the purchase path
    pub purchase_retry_budget: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            endpoints: DEFAULT_ENDPOINTS.iter().map(|s| s.to_string()).collect(),
            app_id: "1089".to_string(),
            connect_timeout: Duration::from_secs(10),
            authorize_timeout: Duration::from_secs(15),
            health_check_interval: Duration::from_secs(30),
            reconnect_debounce: Duration::from_millis(1000),
            max_reconnect_delay: Duration::from_secs(30),
            stagger: Duration::from_millis(800),
            min_request_interval: Duration::from_millis(600),
            dedup_window: Duration::from_secs(300),
            proposal_timeout: Duration::from_secs(20),
            balance_confirm_timeout: Duration::from_secs(10),
            purchase_retry_budget: Duration::from_secs(30),
        }
    }
}

impl AppConfig {
    /// Build from environment variables, falling back to defaults:
    /// - TRADESYNC_ENDPOINTS (comma-separated)
    /// - TRADESYNC_APP_ID
    /// - TRADESYNC_AUTHORIZE_TIMEOUT_SECS
    /// - TRADESYNC_HEALTH_CHECK_SECS
    /// - TRADESYNC_RECONNECT_DEBOUNCE_MS
    /// - TRADESYNC_STAGGER_MS
    /// - TRADESYNC_MIN_REQUEST_INTERVAL_MS
    /// - TRADESYNC_DEDUP_WINDOW_SECS
    /// - TRADESYNC_PROPOSAL_TIMEOUT_SECS
    /// - TRADESYNC_BALANCE_CONFIRM_SECS
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let mut config = Self::default();

        if let Ok(v) = std::env::var("TRADESYNC_ENDPOINTS") {
            let endpoints: Vec<String> = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if endpoints.is_empty() {
                anyhow::bail!("TRADESYNC_ENDPOINTS is set but lists no endpoint");
            }
            config.endpoints = endpoints;
        }
        if let Ok(v) = std::env::var("TRADESYNC_APP_ID") {
            config.app_id = v;
        }

        config.authorize_timeout =
            secs_var("TRADESYNC_AUTHORIZE_TIMEOUT_SECS", config.authorize_timeout)?;
        config.health_check_interval =
            secs_var("TRADESYNC_HEALTH_CHECK_SECS", config.health_check_interval)?;
        config.reconnect_debounce =
            millis_var("TRADESYNC_RECONNECT_DEBOUNCE_MS", config.reconnect_debounce)?;
        config.stagger = millis_var("TRADESYNC_STAGGER_MS", config.stagger)?;
        config.min_request_interval =
            millis_var("TRADESYNC_MIN_REQUEST_INTERVAL_MS", config.min_request_interval)?;
        config.dedup_window = secs_var("TRADESYNC_DEDUP_WINDOW_SECS", config.dedup_window)?;
        config.proposal_timeout =
            secs_var("TRADESYNC_PROPOSAL_TIMEOUT_SECS", config.proposal_timeout)?;
        config.balance_confirm_timeout =
            secs_var("TRADESYNC_BALANCE_CONFIRM_SECS", config.balance_confirm_timeout)?;

        Ok(config)
    }
}

fn secs_var(name: &str, default: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Ok(v) => Ok(Duration::from_secs(
            v.parse().with_context(|| format!("Invalid {name}"))?,
        )),
        Err(_) => Ok(default),
    }
}

fn millis_var(name: &str, default: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Ok(v) => Ok(Duration::from_millis(
            v.parse().with_context(|| format!("Invalid {name}"))?,
        )),
        Err(_) => Ok(default),
    }
}
