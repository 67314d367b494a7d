//! Terminal trade queue worker
//!
//! Replays queued trade and close instructions on trading-terminal
//! accounts, and mirrors leader positions onto follower accounts.

mod api;
mod db;
mod models;
mod trading;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::{BridgeClient, OrderFilling, PaperTerminal, TradingTerminal};
use crate::db::Database;
use crate::models::{OrderSide, PendingClose, PendingTrade};
use crate::trading::{AccountBook, WorkerConfig};
use crate::worker::{MirrorWorker, QueueWorker};

/// Trade queue worker CLI.
#[derive(Parser)]
#[command(name = "tradeq")]
#[command(about = "Replay queued trades on terminal accounts and mirror leader positions", long_about = None)]
struct Cli {
    /// Database URL
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:./trade_queue.db?mode=rwc")]
    database: String,

    /// Accounts file (JSON array of accounts)
    #[arg(short, long, env = "ACCOUNTS_FILE", default_value = "accounts.json")]
    accounts: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process the trade and close queues
    Run {
        /// Polling interval in seconds
        #[arg(short, long, default_value = "1", value_parser = clap::value_parser!(u64).range(1..))]
        interval: u64,

        /// Re-read the accounts file on every iteration
        #[arg(long)]
        reload_accounts: bool,

        /// Filling policy for opening orders (fok, ioc)
        #[arg(long, default_value = "fok")]
        filling: OrderFilling,

        /// Send orders to an in-memory paper terminal
        #[arg(long)]
        dry_run: bool,
    },

    /// Copy leader positions onto followers
    Mirror {
        /// Polling interval in seconds
        #[arg(short, long, default_value = "2", value_parser = clap::value_parser!(u64).range(1..))]
        interval: u64,

        /// Re-read the accounts file on every cycle
        #[arg(long)]
        reload_accounts: bool,

        /// Only log leader closes instead of closing follower positions
        #[arg(long)]
        no_replicate_closes: bool,

        /// Treat positions open at startup as already copied
        #[arg(long)]
        seed_on_start: bool,

        /// Send orders to an in-memory paper terminal
        #[arg(long)]
        dry_run: bool,
    },

    /// Queue a trade instruction
    Enqueue {
        /// Instrument symbol
        #[arg(short, long)]
        instrument: String,

        /// Lot size
        #[arg(short, long)]
        quantity: Decimal,

        /// Order side (buy, sell)
        #[arg(short, long)]
        side: String,

        /// Stop loss price (0 for none)
        #[arg(long, default_value = "0")]
        sl: f64,

        /// Take profit price (0 for none)
        #[arg(long, default_value = "0")]
        tp: f64,

        /// Route to this leader and every follower
        #[arg(long)]
        leader: Option<u64>,

        /// Route to this account only
        #[arg(long)]
        account: Option<u64>,

        /// Trade id (random if omitted)
        #[arg(long)]
        id: Option<String>,
    },

    /// Queue a close instruction
    Close {
        /// Close a queued trade by id, reusing its ticket and terms
        #[arg(short, long)]
        trade: Option<String>,

        /// Position ticket
        #[arg(long)]
        ticket: Option<String>,

        /// Instrument symbol
        #[arg(short, long)]
        instrument: Option<String>,

        /// Lot size
        #[arg(short, long)]
        quantity: Option<Decimal>,

        /// Side of the position being closed (buy, sell)
        #[arg(short, long)]
        side: Option<String>,
    },

    /// List configured accounts
    Accounts,

    /// Show queue status and recent executions
    Status {
        /// Number of executions to show
        #[arg(short, long, default_value = "10")]
        limit: i64,
    },

    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
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

    match cli.command {
        Commands::Run {
            interval,
            reload_accounts,
            filling,
            dry_run,
        } => {
            let accounts = AccountBook::load(&cli.accounts)?;
            if accounts.is_empty() {
                warn!(path = %cli.accounts.display(), "No accounts configured");
            }

            let db = Database::new(&cli.database).await?;
            let config = WorkerConfig {
                poll_interval: Duration::from_secs(interval),
                reload_accounts,
                open_filling: filling,
                ..Default::default()
            };

            println!("\n=== Trade Queue Worker ===");
            println!("Database:         {}", cli.database);
            println!("Accounts:         {}", accounts.len());
            println!("Polling interval: {}s", interval);
            println!("Mode: {}", if dry_run { "DRY RUN (paper terminal)" } else { "LIVE TRADING" });
            println!("\nPress Ctrl+C to stop.\n");

            let mut worker = QueueWorker::new(db, accounts, terminal(dry_run)?, config);
            worker.run().await?;

            println!("\n{}", worker.stats());
        }

        Commands::Mirror {
            interval,
            reload_accounts,
            no_replicate_closes,
            seed_on_start,
            dry_run,
        } => {
            let accounts = AccountBook::load(&cli.accounts)?;
            let config = WorkerConfig {
                poll_interval: Duration::from_secs(interval),
                reload_accounts,
                replicate_closes: !no_replicate_closes,
                seed_on_start,
                ..WorkerConfig::mirror()
            };

            println!("\n=== Position Mirror ===");
            println!("Leaders:          {}", accounts.leaders().count());
            println!("Followers:        {}", accounts.followers().count());
            println!("Polling interval: {}s", interval);
            println!("Replicate closes: {}", config.replicate_closes);
            println!("Mode: {}", if dry_run { "DRY RUN (paper terminal)" } else { "LIVE TRADING" });
            println!("\nPress Ctrl+C to stop.\n");

            let mut worker = MirrorWorker::new(accounts, terminal(dry_run)?, config);
            worker.run().await?;

            let totals = worker.totals();
            println!("\n=== Mirror Statistics ===");
            println!("Leader trades opened: {}", totals.opened);
            println!("Leader trades closed: {}", totals.closed);
            println!("Copies:               {} placed, {} failed", totals.copies_placed, totals.copies_failed);
            println!("Follower closes:      {} ({} failed)", totals.follower_positions_closed, totals.close_failures);
        }

        Commands::Enqueue {
            instrument,
            quantity,
            side,
            sl,
            tp,
            leader,
            account,
            id,
        } => {
            let Some(order_side) = OrderSide::parse(&side) else {
                bail!("Unknown side {:?}, expected buy or sell", side);
            };

            let db = Database::new(&cli.database).await?;
            let trade = PendingTrade {
                trade_id: id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                instrument,
                quantity,
                side: order_side.as_str().to_string(),
                sl,
                tp,
                leader_login: leader,
                account_login: account,
            };
            db.enqueue_trade(&trade).await?;

            info!(trade_id = %trade.trade_id, "Trade queued");
            println!(
                "Queued {} {} {} ({})",
                trade.side, trade.quantity, trade.instrument, trade.trade_id
            );
        }

        Commands::Close {
            trade,
            ticket,
            instrument,
            quantity,
            side,
        } => {
            let db = Database::new(&cli.database).await?;
            let close_id = uuid::Uuid::new_v4().to_string();

            let close = match (trade, ticket, instrument, quantity, side) {
                (Some(trade_id), _, _, _, _) => db.request_trade_close(&close_id, &trade_id).await?,
                (None, Some(ticket), Some(instrument), Some(quantity), Some(side)) => {
                    let Some(position_side) = OrderSide::parse(&side) else {
                        bail!("Unknown side {:?}, expected buy or sell", side);
                    };
                    let close = PendingClose {
                        close_id,
                        trade_id: None,
                        ticket,
                        instrument,
                        quantity,
                        side: position_side.as_str().to_string(),
                    };
                    db.enqueue_close(&close).await?;
                    close
                }
                _ => {
                    println!("Specify --trade <id>, or --ticket, --instrument, --quantity and --side.");
                    println!("\nExamples:");
                    println!("  tradeq close --trade 3f2a...");
                    println!("  tradeq close --ticket 123456 --instrument EURUSD --quantity 0.1 --side buy");
                    return Ok(());
                }
            };

            info!(close_id = %close.close_id, ticket = %close.ticket, "Close queued");
            println!("Queued close of ticket {} on {} ({})", close.ticket, close.instrument, close.close_id);
        }

        Commands::Accounts => {
            let accounts = AccountBook::load(&cli.accounts)?;

            if accounts.is_empty() {
                println!("No accounts in {}.", cli.accounts.display());
                return Ok(());
            }

            println!("\n{:<12} {:<10} {:<24} {}", "LOGIN", "ROLE", "SERVER", "PATH");
            println!("{}", "-".repeat(76));

            for account in accounts.all() {
                println!(
                    "{:<12} {:<10} {:<24} {}",
                    account.login,
                    account.role.as_str(),
                    truncate(&account.server, 22),
                    account.path
                );
            }
        }

        Commands::Status { limit } => {
            let db = Database::new(&cli.database).await?;
            let stats = db.get_queue_stats().await?;
            let executions = db.recent_executions(limit).await?;

            println!("\n=== Trade Queue ===");
            println!("Pending:          {}", stats.pending_trades);
            println!("Executed:         {}", stats.executed_trades);
            println!("Closed:           {}", stats.closed_trades);

            println!("\n=== Close Requests ===");
            println!("Pending:          {}", stats.pending_closes);
            println!("Closed:           {}", stats.closed_closes);

            println!("\n=== Executions ===");
            println!("Done:             {}", stats.executions_done);
            println!("Failed:           {}", stats.executions_failed);

            if !executions.is_empty() {
                println!("\n=== Recent Executions ===");
                for e in &executions {
                    println!(
                        "  {} {} login {} ticket {} {}",
                        e.executed_at,
                        truncate(&e.trade_id, 20),
                        e.account_login,
                        e.ticket.as_deref().unwrap_or("-"),
                        e.error_message
                            .as_deref()
                            .map(|m| format!("({})", m))
                            .unwrap_or_else(|| e.status.clone())
                    );
                }
            }
        }

        Commands::Config => {
            let queue = WorkerConfig::default();
            let mirror = WorkerConfig::mirror();
            let bridge = BridgeClient::from_env()?;

            println!("\n=== Worker Configuration ===\n");
            println!("Sources:");
            println!("  Database:             {}", cli.database);
            println!("  Accounts File:        {}", cli.accounts.display());
            println!("  Terminal Bridge:      {}", bridge.base_url());

            println!("\nOrders:");
            println!("  Deviation:            {} points", queue.deviation);
            println!("  Min Volume:           {}", queue.min_volume);
            println!("  Volume Decimals:      {}", queue.volume_decimals);
            println!("  Opening Filling:      {:?}", queue.open_filling);
            println!("  Copy/Close Filling:   {:?}", queue.copy_filling);

            println!("\nPolling:");
            println!("  Queue Interval:       {}s", queue.poll_interval.as_secs());
            println!("  Mirror Interval:      {}s", mirror.poll_interval.as_secs());
            println!("  Replicate Closes:     {}", mirror.replicate_closes);
            println!("  Seed On Start:        {}", mirror.seed_on_start);
        }
    }

    Ok(())
}

/// Pick the terminal back-end.
fn terminal(dry_run: bool) -> Result<Arc<dyn TradingTerminal>> {
    if dry_run {
        info!("Dry run: orders go to the paper terminal");
        return Ok(Arc::new(PaperTerminal::permissive()));
    }

    let client = BridgeClient::from_env()?;
    info!(url = %client.base_url(), "Terminal bridge client initialized");
    Ok(Arc::new(client))
}

/// Truncate a string with ellipsis if too long.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_mirror_flags() {
        let cli = Cli::parse_from([
            "tradeq",
            "--accounts",
            "team.json",
            "mirror",
            "--no-replicate-closes",
            "--seed-on-start",
        ]);
        assert_eq!(cli.accounts, PathBuf::from("team.json"));
        match cli.command {
            Commands::Mirror {
                interval,
                no_replicate_closes,
                seed_on_start,
                dry_run,
                ..
            } => {
                assert_eq!(interval, 2);
                assert!(no_replicate_closes);
                assert!(seed_on_start);
                assert!(!dry_run);
            }
            _ => panic!("expected mirror"),
        }
    }

    #[test]
    fn test_parse_enqueue() {
        let cli = Cli::parse_from([
            "tradeq", "enqueue", "-i", "XAUUSD", "-q", "0.05", "-s", "SELL", "--account", "7",
        ]);
        match cli.command {
            Commands::Enqueue {
                quantity,
                account,
                leader,
                ..
            } => {
                assert_eq!(quantity, Decimal::new(5, 2));
                assert_eq!(account, Some(7));
                assert_eq!(leader, None);
            }
            _ => panic!("expected enqueue"),
        }
    }

    #[test]
    fn test_zero_interval_rejected() {
        assert!(Cli::try_parse_from(["tradeq", "run", "--interval", "0"]).is_err());
        assert!(Cli::try_parse_from(["tradeq", "mirror", "-i", "0"]).is_err());
        assert!(Cli::try_parse_from(["tradeq", "run", "--interval", "5"]).is_ok());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a-very-long-trade-id", 10), "a-very-...");
    }
}
