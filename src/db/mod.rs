//! Database persistence for sessions and replication.
//!
//! Stores everything needed to resume after restart:
//! - Active credential and account
//! - Known accounts (token map plus last snapshot)
//! - Replication settings and the subordinate list
//! - Replication log (one row per replica attempt)

use std::str::FromStr;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::replication::{CopyTarget, ReplicationSettings};

/// Key of the active credential token in `app_state`.
pub const ACTIVE_TOKEN_KEY: &str = "active_token";
/// Key of the active account id in `app_state`.
pub const ACTIVE_LOGINID_KEY: &str = "active_loginid";

/// Database connection pool.
pub struct Database {
    pool: SqlitePool,
}

/// Stored account record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredAccount {
    pub loginid: String,
    pub token: String,
    pub currency: String,
    pub balance: String,
    pub is_virtual: bool,
    pub pinned: bool,
    pub updated_at: String,
}

impl StoredAccount {
    pub fn balance(&self) -> Decimal {
        Decimal::from_str(&self.balance).unwrap_or_default()
    }
}

/// Stored subordinate. Only the reconnectable token is kept.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredSubordinate {
    pub token: String,
    pub loginid: Option<String>,
    pub added_at: String,
}

/// One replica attempt.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredReplica {
    pub id: i64,
    pub master_key: String,
    pub subordinate: String,
    pub stake: String,
    pub status: String,
    pub contract_id: Option<i64>,
    pub transaction_id: Option<i64>,
    pub profit: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub settled_at: Option<String>,
}

/// Aggregated replication log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplicationStats {
    pub total: i64,
    pub placed: i64,
    pub failed: i64,
    pub skipped: i64,
    pub settled: i64,
    pub net_profit: Decimal,
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Private in-memory database (single connection so all queries see
    /// the same memory). The connection is never reaped, since closing it
    /// would drop the data.
    ///
    /// SQLite work runs on a worker thread that a paused tokio clock does
    /// not wait for: open and query it on real time.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        // Key/value application state
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS app_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Known accounts
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                loginid TEXT PRIMARY KEY,
                token TEXT NOT NULL,
                currency TEXT NOT NULL DEFAULT '',
                balance TEXT NOT NULL DEFAULT '0',
                is_virtual INTEGER NOT NULL DEFAULT 0,
                pinned INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Replication settings (single row)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replication_settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                enabled INTEGER NOT NULL DEFAULT 0,
                max_stake_percent TEXT NOT NULL,
                stake_multiplier TEXT NOT NULL,
                daily_loss_limit TEXT NOT NULL,
                copy_target TEXT NOT NULL DEFAULT 'all',
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Subordinate accounts
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subordinates (
                token TEXT PRIMARY KEY,
                loginid TEXT,
                added_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Replica attempts
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replication_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                master_key TEXT NOT NULL,
                subordinate TEXT NOT NULL,
                stake TEXT NOT NULL,
                status TEXT NOT NULL,
                contract_id INTEGER,
                transaction_id INTEGER,
                profit TEXT,
                error TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                settled_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_replication_contract ON replication_log(subordinate, contract_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== App State ====================

    pub async fn get_state(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM app_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set_state(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO app_state (key, value, updated_at)
            VALUES (?, ?, datetime('now'))
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = datetime('now')
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_state(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM app_state WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ==================== Accounts ====================

    /// Save or update an account. The pinned flag is sticky once set.
    pub async fn save_account(
        &self,
        loginid: &str,
        token: &str,
        currency: &str,
        balance: Decimal,
        is_virtual: bool,
        pinned: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts (loginid, token, currency, balance, is_virtual, pinned, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, datetime('now'))
            ON CONFLICT(loginid) DO UPDATE SET
                token = excluded.token,
                currency = excluded.currency,
                balance = excluded.balance,
                is_virtual = excluded.is_virtual,
                pinned = MAX(accounts.pinned, excluded.pinned),
                updated_at = datetime('now')
            "#,
        )
        .bind(loginid)
        .bind(token)
        .bind(currency)
        .bind(balance.to_string())
        .bind(is_virtual)
        .bind(pinned)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_accounts(&self) -> Result<Vec<StoredAccount>> {
        sqlx::query_as::<_, StoredAccount>("SELECT * FROM accounts ORDER BY loginid")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch accounts")
    }

    pub async fn update_account_balance(&self, loginid: &str, balance: Decimal) -> Result<()> {
        sqlx::query("UPDATE accounts SET balance = ?, updated_at = datetime('now') WHERE loginid = ?")
            .bind(balance.to_string())
            .bind(loginid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn clear_accounts(&self) -> Result<()> {
        sqlx::query("DELETE FROM accounts").execute(&self.pool).await?;
        Ok(())
    }

    // ==================== Replication Settings ====================

    pub async fn load_replication_settings(&self) -> Result<Option<ReplicationSettings>> {
        let row: Option<(bool, String, String, String, String)> = sqlx::query_as(
            r#"
            SELECT enabled, max_stake_percent, stake_multiplier, daily_loss_limit, copy_target
            FROM replication_settings WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some((enabled, percent, multiplier, limit, target)) = row else {
            return Ok(None);
        };

        Ok(Some(ReplicationSettings {
            enabled,
            max_stake_percent: Decimal::from_str(&percent).context("Corrupt max_stake_percent")?,
            stake_multiplier: Decimal::from_str(&multiplier).context("Corrupt stake_multiplier")?,
            daily_loss_limit: Decimal::from_str(&limit).context("Corrupt daily_loss_limit")?,
            copy_target: CopyTarget::from_str(&target)?,
        }))
    }

    pub async fn save_replication_settings(&self, settings: &ReplicationSettings) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO replication_settings
                (id, enabled, max_stake_percent, stake_multiplier, daily_loss_limit, copy_target, updated_at)
            VALUES (1, ?, ?, ?, ?, ?, datetime('now'))
            ON CONFLICT(id) DO UPDATE SET
                enabled = excluded.enabled,
                max_stake_percent = excluded.max_stake_percent,
                stake_multiplier = excluded.stake_multiplier,
                daily_loss_limit = excluded.daily_loss_limit,
                copy_target = excluded.copy_target,
                updated_at = datetime('now')
            "#,
        )
        .bind(settings.enabled)
        .bind(settings.max_stake_percent.to_string())
        .bind(settings.stake_multiplier.to_string())
        .bind(settings.daily_loss_limit.to_string())
        .bind(settings.copy_target.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== Subordinates ====================

    pub async fn add_subordinate(&self, token: &str, loginid: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO subordinates (token, loginid)
            VALUES (?, ?)
            ON CONFLICT(token) DO UPDATE SET
                loginid = COALESCE(excluded.loginid, subordinates.loginid)
            "#,
        )
        .bind(token)
        .bind(loginid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Remove by token or by account id. Returns whether a row was removed.
    pub async fn remove_subordinate(&self, token_or_loginid: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM subordinates WHERE token = ? OR loginid = ?")
            .bind(token_or_loginid)
            .bind(token_or_loginid)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_subordinates(&self) -> Result<Vec<StoredSubordinate>> {
        sqlx::query_as::<_, StoredSubordinate>("SELECT * FROM subordinates ORDER BY added_at, token")
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch subordinates")
    }

    // ==================== Replication Log ====================

    /// Record a replica attempt.
    #[allow(clippy::too_many_arguments)]
    pub async fn log_replica(
        &self,
        master_key: &str,
        subordinate: &str,
        stake: Decimal,
        status: &str,
        contract_id: Option<u64>,
        transaction_id: Option<u64>,
        error: Option<&str>,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO replication_log
                (master_key, subordinate, stake, status, contract_id, transaction_id, error)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(master_key)
        .bind(subordinate)
        .bind(stake.to_string())
        .bind(status)
        .bind(contract_id.map(|v| v as i64))
        .bind(transaction_id.map(|v| v as i64))
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Attach the realized profit to a placed replica.
    pub async fn settle_replica(&self, subordinate: &str, contract_id: u64, profit: Decimal) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE replication_log SET
                profit = ?,
                settled_at = datetime('now')
            WHERE subordinate = ? AND contract_id = ? AND settled_at IS NULL
            "#,
        )
        .bind(profit.to_string())
        .bind(subordinate)
        .bind(contract_id as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn recent_replicas(&self, limit: i64) -> Result<Vec<StoredReplica>> {
        sqlx::query_as::<_, StoredReplica>("SELECT * FROM replication_log ORDER BY id DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch replication log")
    }

    pub async fn get_replication_stats(&self) -> Result<ReplicationStats> {
        let counts: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM replication_log GROUP BY status")
                .fetch_all(&self.pool)
                .await?;

        let mut stats = ReplicationStats::default();
        for (status, count) in counts {
            stats.total += count;
            match status.as_str() {
                "placed" => stats.placed = count,
                "failed" => stats.failed = count,
                "skipped" => stats.skipped = count,
                _ => {}
            }
        }

        let profits: Vec<(String,)> =
            sqlx::query_as("SELECT profit FROM replication_log WHERE profit IS NOT NULL")
                .fetch_all(&self.pool)
                .await?;
        stats.settled = profits.len() as i64;
        stats.net_profit = profits
            .iter()
            .filter_map(|(p,)| Decimal::from_str(p).ok())
            .sum();

        Ok(stats)
    }
}
