//! tradesync: trade replication across brokerage accounts
//!
//! Mirrors contracts bought on a master account onto subordinate accounts
//! with per-account risk limits, and can flip the master between a virtual
//! and a real account on loss streaks.

mod api;
mod bot;
mod config;
mod connection;
mod db;
mod error;
mod events;
mod hook;
mod models;
mod notify;
mod replication;
mod session;
mod trading;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::bot::{Bot, BotConfig};
use crate::config::AppConfig;
use crate::connection::{ConnectionConfig, ConnectionManager, RateLimiter, WsConnector};
use crate::db::Database;
use crate::hook::{RealTradesCondition, VirtualHookConfig};
use crate::models::{mask_token, ContractOrder};
use crate::notify::TracingSink;
use crate::replication::{CopyTarget, ReplicationEngine};
use crate::session::{AccountStore, Session, SessionOptions};

/// Trade replication CLI.
#[derive(Parser)]
#[command(name = "tradesync")]
#[command(about = "Replicate trades from a master account onto subordinate accounts", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, default_value = "sqlite:./tradesync.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the master session and replicate until Ctrl+C
    Run,

    /// Place contracts on the master account
    Trade {
        /// Underlying symbol
        #[arg(short, long)]
        symbol: String,

        /// Contract type (CALL, PUT, ...)
        #[arg(short = 't', long, default_value = "CALL")]
        contract_type: String,

        /// Stake per contract
        #[arg(short, long)]
        amount: Decimal,

        /// Contract duration
        #[arg(long, default_value = "5")]
        duration: u32,

        /// Duration unit (t, s, m, h, d)
        #[arg(long, default_value = "t")]
        duration_unit: String,

        /// Barrier, for contract types that take one
        #[arg(long)]
        barrier: Option<String>,

        /// Number of sequential contracts
        #[arg(short, long, default_value = "1")]
        count: u32,

        /// Switch between virtual and real accounts on loss streaks
        #[arg(long)]
        virtual_hook: bool,

        /// Consecutive virtual losses before switching to real
        #[arg(long, default_value = "2")]
        virtual_trades: u32,

        /// Real trades before switching back ("immediately" or a number)
        #[arg(long, default_value = "immediately")]
        real_trades: String,

        /// Login id of the virtual account to switch to
        #[arg(long)]
        virtual_account: Option<String>,

        /// Login id of the real account to switch to
        #[arg(long)]
        real_account: Option<String>,

        /// Seconds to wait for each contract to settle
        #[arg(long, default_value = "600")]
        settle_timeout: u64,
    },

    /// Authorize a token and make it the active master credential
    Login {
        /// API token
        token: String,

        /// Keep the stored session when the venue rejects this token
        #[arg(long)]
        pin: bool,
    },

    /// Forget the active master credential
    Logout,

    /// List known accounts
    Accounts,

    /// Manage subordinate accounts
    Sub {
        #[command(subcommand)]
        action: SubCommands,
    },

    /// Replication settings
    Copy {
        #[command(subcommand)]
        action: CopyCommands,
    },

    /// Show replication settings, subordinates and statistics
    Status,

    /// Show effective configuration
    Config,
}

#[derive(Subcommand)]
enum SubCommands {
    /// Connect a subordinate and store its token
    Add {
        /// Subordinate API token
        token: String,
    },

    /// Remove a subordinate
    Remove {
        /// Token or login id
        account: String,
    },

    /// List stored subordinates
    List,
}

#[derive(Subcommand)]
enum CopyCommands {
    /// Enable replication
    Enable,

    /// Disable replication
    Disable,

    /// Update risk settings
    Config {
        /// Stake cap as a percentage of subordinate balance
        #[arg(long)]
        max_stake_percent: Option<Decimal>,

        /// Multiplier applied to the master stake
        #[arg(long)]
        multiplier: Option<Decimal>,

        /// Daily loss limit per subordinate (0 = unlimited)
        #[arg(long)]
        daily_loss_limit: Option<Decimal>,

        /// Which subordinates receive trades (all, real, virtual)
        #[arg(long)]
        target: Option<CopyTarget>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let app = AppConfig::from_env()?;

    match cli.command {
        Commands::Run => {
            let bot_config = BotConfig {
                app,
                database_url: cli.database.clone(),
                ..BotConfig::default()
            };

            let mut bot = Bot::new(bot_config).await?;
            bot.initialize().await?;

            let stats = bot.get_stats().await;
            println!("\n=== tradesync ===");
            println!("Account:      {}", stats.account.as_deref().unwrap_or("-"));
            println!("Replication:  {}", if stats.replication_enabled { "Enabled" } else { "Disabled" });
            println!("Subordinates: {} ({} ready)", stats.subordinates, stats.subordinates_ready);
            println!("\nPress Ctrl+C to stop.\n");

            if let Err(e) = bot.run().await {
                tracing::error!(error = %e, "Bot error");
            }

            let stats = bot.get_stats().await;
            println!("\n{}", stats);
        }

        Commands::Trade {
            symbol,
            contract_type,
            amount,
            duration,
            duration_unit,
            barrier,
            count,
            virtual_hook,
            virtual_trades,
            real_trades,
            virtual_account,
            real_account,
            settle_timeout,
        } => {
            if amount <= Decimal::ZERO {
                bail!("Amount must be positive");
            }
            if virtual_trades == 0 {
                bail!("--virtual-trades must be at least 1");
            }
            let real_trades_condition: RealTradesCondition = real_trades.parse()?;

            let bot_config = BotConfig {
                app,
                database_url: cli.database.clone(),
                hook: VirtualHookConfig {
                    enabled: virtual_hook,
                    virtual_trades_condition: virtual_trades,
                    real_trades_condition,
                    virtual_counterpart: virtual_account,
                    real_counterpart: real_account,
                },
                settlement_timeout: std::time::Duration::from_secs(settle_timeout),
                ..BotConfig::default()
            };
            let order = ContractOrder {
                symbol,
                contract_type,
                amount,
                duration,
                duration_unit,
                barrier,
            };

            let mut bot = Bot::new(bot_config).await?;
            bot.initialize().await?;
            info!(count = count, symbol = %order.symbol, amount = %order.amount, "Placing trades");

            let results = bot.run_trades(&order, count).await?;

            println!(
                "\n{:<4} {:>14} {:>10} {:>8} {:>10}",
                "#", "CONTRACT", "STAKE", "RESULT", "PROFIT"
            );
            println!("{}", "-".repeat(50));
            for (i, result) in results.iter().enumerate() {
                let (outcome, profit) = match &result.settlement {
                    Some(s) => (s.outcome.as_str(), format!("{:.2}", s.profit)),
                    None => ("open", "-".to_string()),
                };
                println!(
                    "{:<4} {:>14} {:>10.2} {:>8} {:>10}",
                    i + 1,
                    result.purchase.contract_id,
                    result.purchase.order.amount,
                    outcome,
                    profit
                );
            }

            bot.shutdown().await;
            println!("\n{}", bot.get_stats().await);
        }

        Commands::Login { token, pin } => {
            let db = Arc::new(Database::new(&cli.database).await?);
            let store = AccountStore::load(Arc::clone(&db)).await?;

            let connector = Arc::new(WsConnector::new(app.connect_timeout));
            let conn = ConnectionManager::new("login", ConnectionConfig::from(&app), connector);
            let (session, _events) = Session::new(conn, &app, SessionOptions::master());

            let result = session.start(&token).await;
            session.close().await;
            let info = result.context("Login failed")?;

            store.record_login(&token, &info, pin).await?;
            store.set_active(&info.loginid).await?;

            println!("Logged in as {} ({})", info.loginid, mask_token(&token));
            println!("Balance:  {:.2} {}", info.balance, info.currency);
            println!("Type:     {}", if info.is_virtual { "Virtual" } else { "Real" });
            if pin {
                println!("Pinned:   session data is kept if the venue rejects this token");
            }
            if info.account_list.len() > 1 {
                println!("\nLinked accounts:");
                for entry in &info.account_list {
                    println!(
                        "  {:<12} {:<5} {}",
                        entry.loginid,
                        entry.currency,
                        if entry.is_virtual { "virtual" } else { "real" }
                    );
                }
            }
        }

        Commands::Logout => {
            let db = Arc::new(Database::new(&cli.database).await?);
            let store = AccountStore::load(db).await?;
            match store.active_loginid() {
                Some(loginid) => {
                    store.clear_session().await?;
                    println!("Logged out of {}", loginid);
                }
                None => println!("Not logged in."),
            }
        }

        Commands::Accounts => {
            let db = Arc::new(Database::new(&cli.database).await?);
            let store = AccountStore::load(db).await?;
            let accounts = store.accounts();

            if accounts.is_empty() {
                println!("No known accounts. Use 'tradesync login <token>' to add one.");
                return Ok(());
            }

            let active = store.active_loginid();
            println!(
                "\n{:<2} {:<14} {:<12} {:<8} {:>14} {:<7}",
                "", "LOGIN ID", "TOKEN", "TYPE", "BALANCE", "PINNED"
            );
            println!("{}", "-".repeat(62));
            for account in accounts {
                let snapshot = &account.snapshot;
                println!(
                    "{:<2} {:<14} {:<12} {:<8} {:>10.2} {:<3} {:<7}",
                    if active.as_deref() == Some(snapshot.loginid.as_str()) { "*" } else { "" },
                    snapshot.loginid,
                    mask_token(&account.token),
                    if snapshot.is_virtual { "virtual" } else { "real" },
                    snapshot.balance,
                    snapshot.currency,
                    if account.pinned { "yes" } else { "" }
                );
            }
        }

        Commands::Sub { action } => {
            let db = Arc::new(Database::new(&cli.database).await?);
            match action {
                SubCommands::Add { token } => {
                    let engine = replication_engine(app, Arc::clone(&db)).await?;
                    let result = engine.add_subordinate(&token).await;
                    engine.shutdown().await;
                    let status = result?;
                    println!(
                        "Added subordinate {} ({}, {:.2} {})",
                        status.loginid, status.token, status.balance, status.currency
                    );
                }
                SubCommands::Remove { account } => {
                    if db.remove_subordinate(&account).await? {
                        println!("Removed subordinate: {}", account);
                    } else {
                        println!("No subordinate matches {}", account);
                    }
                }
                SubCommands::List => {
                    let subordinates = db.get_subordinates().await?;
                    if subordinates.is_empty() {
                        println!("No subordinates. Use 'tradesync sub add <token>' to add one.");
                        return Ok(());
                    }
                    println!("\n{:<14} {:<12} {:<25}", "LOGIN ID", "TOKEN", "ADDED");
                    println!("{}", "-".repeat(52));
                    for sub in subordinates {
                        println!(
                            "{:<14} {:<12} {:<25}",
                            sub.loginid.as_deref().unwrap_or("(pending)"),
                            mask_token(&sub.token),
                            sub.added_at
                        );
                    }
                }
            }
        }

        Commands::Copy { action } => {
            let db = Database::new(&cli.database).await?;
            let mut settings = db.load_replication_settings().await?.unwrap_or_default();
            match action {
                CopyCommands::Enable => settings.enabled = true,
                CopyCommands::Disable => settings.enabled = false,
                CopyCommands::Config {
                    max_stake_percent,
                    multiplier,
                    daily_loss_limit,
                    target,
                } => {
                    if let Some(v) = max_stake_percent {
                        settings.max_stake_percent = v;
                    }
                    if let Some(v) = multiplier {
                        settings.stake_multiplier = v;
                    }
                    if let Some(v) = daily_loss_limit {
                        settings.daily_loss_limit = v;
                    }
                    if let Some(v) = target {
                        settings.copy_target = v;
                    }
                }
            }
            settings.validate()?;
            db.save_replication_settings(&settings).await?;

            println!("Replication:       {}", if settings.enabled { "Enabled" } else { "Disabled" });
            println!("Max Stake:         {}% of balance", settings.max_stake_percent);
            println!("Stake Multiplier:  {}x", settings.stake_multiplier);
            if settings.has_loss_limit() {
                println!("Daily Loss Limit:  {}", settings.daily_loss_limit);
            } else {
                println!("Daily Loss Limit:  unlimited");
            }
            println!("Copy Target:       {}", settings.copy_target);
        }

        Commands::Status => {
            let db = Arc::new(Database::new(&cli.database).await?);
            let store = AccountStore::load(Arc::clone(&db)).await?;
            let settings = db.load_replication_settings().await?.unwrap_or_default();
            let subordinates = db.get_subordinates().await?;
            let stats = db.get_replication_stats().await?;

            println!("\n=== Master ===");
            match store.active_account() {
                Some(account) => {
                    println!("Account:          {}", account.snapshot.loginid);
                    println!("Token:            {}", mask_token(&account.token));
                    println!(
                        "Balance:          {:.2} {}",
                        account.snapshot.balance, account.snapshot.currency
                    );
                }
                None => println!("Not logged in. Use 'tradesync login <token>'."),
            }

            println!("\n=== Replication ===");
            println!("Enabled:          {}", if settings.enabled { "Yes" } else { "No" });
            println!("Max Stake:        {}%", settings.max_stake_percent);
            println!("Multiplier:       {}x", settings.stake_multiplier);
            println!("Copy Target:      {}", settings.copy_target);
            println!("Subordinates:     {}", subordinates.len());

            println!("\n=== Replicas ===");
            println!("Total:            {}", stats.total);
            println!("Placed:           {}", stats.placed);
            println!("Failed:           {}", stats.failed);
            println!("Skipped:          {}", stats.skipped);
            println!("Settled:          {}", stats.settled);
            println!("Net Profit:       {:.2}", stats.net_profit);

            let recent = db.recent_replicas(10).await?;
            if !recent.is_empty() {
                println!("\n=== Recent Replicas ===");
                for replica in &recent {
                    println!(
                        "  {:<19} {:<12} {:>8} {:<8} {}",
                        truncate(&replica.created_at, 19),
                        replica.subordinate,
                        replica.stake,
                        replica.status,
                        replica
                            .error
                            .as_deref()
                            .map(|e| truncate(e, 40))
                            .or_else(|| replica.profit.clone())
                            .unwrap_or_default()
                    );
                }
            }
        }

        Commands::Config => {
            println!("\n=== Connection ===\n");
            println!("Endpoints:");
            for (i, endpoint) in app.endpoints.iter().enumerate() {
                println!("  {}. {}", i + 1, endpoint);
            }
            println!("App ID:               {}", app.app_id);
            println!("Connect Timeout:      {:?}", app.connect_timeout);
            println!("Health Check:         {:?}", app.health_check_interval);
            println!("Reconnect Debounce:   {:?}", app.reconnect_debounce);
            println!("Max Reconnect Delay:  {:?}", app.max_reconnect_delay);

            println!("\n=== Session ===\n");
            println!("Authorize Timeout:    {:?}", app.authorize_timeout);
            println!("Proposal Timeout:     {:?}", app.proposal_timeout);
            println!("Purchase Retry:       {:?}", app.purchase_retry_budget);

            println!("\n=== Replication ===\n");
            println!("Stagger:              {:?}", app.stagger);
            println!("Min Request Interval: {:?}", app.min_request_interval);
            println!("Dedup Window:         {:?}", app.dedup_window);
            println!("Balance Confirm:      {:?}", app.balance_confirm_timeout);
        }
    }

    Ok(())
}

async fn replication_engine(app: AppConfig, db: Arc<Database>) -> Result<ReplicationEngine> {
    let connector = Arc::new(WsConnector::new(app.connect_timeout));
    let limiter = Arc::new(RateLimiter::new(app.min_request_interval));
    ReplicationEngine::load(app, db, connector, limiter, Arc::new(TracingSink)).await
}

/// Truncate a string to max length.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
