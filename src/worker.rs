//! Worker runners: the poll loops behind `run` and `mirror`.
//!
//! Handles:
//! - Replaying pending queue trades on their target accounts
//! - Replaying pending close requests on every account
//! - Mirroring leader positions onto followers
//! - Stopping cleanly after the current iteration on Ctrl+C

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::api::TradingTerminal;
use crate::db::{status, Database};
use crate::models::{Account, PendingClose, PendingTrade};
use crate::trading::{AccountBook, CopyReport, OrderPlacer, PositionCopier, WorkerConfig};

/// One unit of periodic work.
#[async_trait]
pub trait PollTask: Send {
    fn name(&self) -> &'static str;

    /// Single iteration of the loop.
    async fn tick(&mut self) -> Result<()>;
}

/// Flip `shutdown` when Ctrl+C is pressed.
pub fn install_ctrl_c(shutdown: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C; stop the process to exit");
            return;
        }
        info!("Shutdown signal received");
        shutdown.store(true, Ordering::SeqCst);
    });
}

/// Run `task` until `shutdown` is set, sleeping `poll_interval` after each
/// iteration. Tick errors are logged and the loop keeps going. A flag set
/// while sleeping stops the loop before the next iteration.
pub async fn run_polling<T: PollTask>(
    task: &mut T,
    poll_interval: Duration,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    if poll_interval.is_zero() {
        bail!("Poll interval must be greater than zero");
    }

    info!(
        task = task.name(),
        poll_interval_ms = poll_interval.as_millis() as u64,
        "Starting run loop"
    );

    while !shutdown.load(Ordering::SeqCst) {
        if let Err(e) = task.tick().await {
            error!(task = task.name(), error = %e, "Error in worker tick");
        }

        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        sleep(poll_interval).await;
    }

    info!(task = task.name(), "Run loop stopped");
    Ok(())
}

// ==================== Queue worker ====================

/// Counters kept across queue iterations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub iterations: u64,
    pub trades_executed: u64,
    pub orders_placed: u64,
    pub orders_failed: u64,
    pub unrouted_trades: u64,
    pub closes_executed: u64,
    pub closes_placed: u64,
    pub closes_failed: u64,
    pub last_iteration_at: Option<DateTime<Utc>>,
}

impl std::fmt::Display for WorkerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Worker Statistics ===")?;
        writeln!(f, "Iterations:      {}", self.iterations)?;
        writeln!(f, "Trades:          {} (Unrouted: {})", self.trades_executed, self.unrouted_trades)?;
        writeln!(f, "Orders:          {} placed, {} failed", self.orders_placed, self.orders_failed)?;
        writeln!(f, "Close Requests:  {}", self.closes_executed)?;
        writeln!(f, "Closes:          {} placed, {} failed", self.closes_placed, self.closes_failed)?;
        writeln!(
            f,
            "Last Iteration:  {}",
            self.last_iteration_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                .unwrap_or_else(|| "Never".to_string())
        )?;
        Ok(())
    }
}

/// Replays the SQLite trade queue against terminal accounts.
pub struct QueueWorker {
    db: Database,
    accounts: AccountBook,
    placer: OrderPlacer,
    config: WorkerConfig,
    stats: WorkerStats,
    shutdown: Arc<AtomicBool>,
}

impl QueueWorker {
    pub fn new(
        db: Database,
        accounts: AccountBook,
        terminal: Arc<dyn TradingTerminal>,
        config: WorkerConfig,
    ) -> Self {
        let placer = OrderPlacer::new(terminal, config.clone());
        Self {
            db,
            accounts,
            placer,
            config,
            stats: WorkerStats::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    #[cfg(test)]
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Main run loop.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            accounts = self.accounts.len(),
            reload_accounts = self.config.reload_accounts,
            "Starting queue worker"
        );

        install_ctrl_c(self.shutdown.clone());
        let shutdown = self.shutdown.clone();
        let poll_interval = self.config.poll_interval;
        run_polling(self, poll_interval, shutdown).await
    }

    fn reload_accounts(&mut self) {
        if !self.config.reload_accounts {
            return;
        }
        match self.accounts.reload() {
            Ok(()) => debug!(accounts = self.accounts.len(), "Reloaded accounts"),
            Err(e) => warn!(error = %e, "Failed to reload accounts, keeping previous list"),
        }
    }

    async fn process_pending_trades(&mut self) -> Result<()> {
        let pending = self.db.get_pending_trades().await?;
        if !pending.is_empty() {
            info!(count = pending.len(), "Processing pending trades");
        }

        for trade in pending {
            if let Err(e) = self.process_trade(&trade).await {
                error!(trade_id = %trade.trade_id, error = %e, "Failed to process trade");
            }
        }

        Ok(())
    }

    /// Attempt one trade on every target account, then mark it executed.
    async fn process_trade(&mut self, trade: &PendingTrade) -> Result<()> {
        let targets: Vec<Account> = self
            .accounts
            .targets_for(trade)
            .into_iter()
            .cloned()
            .collect();

        if targets.is_empty() {
            warn!(
                trade_id = %trade.trade_id,
                leader_login = ?trade.leader_login,
                account_login = ?trade.account_login,
                "No accounts to route trade to"
            );
            self.stats.unrouted_trades += 1;
        }

        for account in &targets {
            match self.placer.place_trade(account, trade).await {
                Ok(result) => {
                    let ticket = result.order.to_string();
                    self.record(trade, account, Some(&ticket), None).await;
                    if let Err(e) = self.db.update_trade_ticket(&trade.trade_id, &ticket).await {
                        error!(trade_id = %trade.trade_id, ticket = %ticket, error = %e, "Failed to store ticket");
                    }
                    self.stats.orders_placed += 1;
                }
                Err(e) => {
                    self.record(trade, account, None, Some(&e.to_string())).await;
                    self.stats.orders_failed += 1;
                }
            }
        }

        self.db.mark_trade_executed(&trade.trade_id).await?;
        self.stats.trades_executed += 1;
        info!(trade_id = %trade.trade_id, targets = targets.len(), "Trade executed");

        Ok(())
    }

    /// Store one attempt. Storage failures are logged and the remaining
    /// targets are still attempted.
    async fn record(&self, trade: &PendingTrade, account: &Account, ticket: Option<&str>, error: Option<&str>) {
        let outcome = if error.is_none() { status::DONE } else { status::FAILED };
        if let Err(e) = self
            .db
            .record_execution(&trade.trade_id, account.login, ticket, outcome, error)
            .await
        {
            error!(trade_id = %trade.trade_id, login = account.login, error = %e, "Failed to record execution");
        }
    }

    async fn process_pending_closes(&mut self) -> Result<()> {
        let pending = self.db.get_pending_closes().await?;
        if !pending.is_empty() {
            info!(count = pending.len(), "Processing close requests");
        }

        for close in pending {
            if let Err(e) = self.process_close(&close).await {
                error!(close_id = %close.close_id, error = %e, "Failed to process close request");
            }
        }

        Ok(())
    }

    /// Attempt one close on every account, then mark it closed.
    async fn process_close(&mut self, close: &PendingClose) -> Result<()> {
        let accounts: Vec<Account> = self.accounts.all().to_vec();

        for account in &accounts {
            // Tickets differ per account; prefer the one recorded for this login
            let recorded = match &close.trade_id {
                Some(trade_id) => self
                    .db
                    .ticket_for(trade_id, account.login)
                    .await
                    .unwrap_or_else(|e| {
                        warn!(trade_id = %trade_id, login = account.login, error = %e, "Ticket lookup failed");
                        None
                    }),
                None => None,
            };
            let ticket = recorded.as_deref().unwrap_or(&close.ticket);

            match self.placer.close_position(account, close, ticket).await {
                Ok(_) => self.stats.closes_placed += 1,
                Err(_) => self.stats.closes_failed += 1,
            }
        }

        self.db.mark_close_executed(&close.close_id).await?;
        self.stats.closes_executed += 1;
        info!(close_id = %close.close_id, ticket = %close.ticket, "Close request executed");

        Ok(())
    }
}

#[async_trait]
impl PollTask for QueueWorker {
    fn name(&self) -> &'static str {
        "queue"
    }

    async fn tick(&mut self) -> Result<()> {
        debug!("Queue tick");
        self.stats.iterations += 1;
        self.stats.last_iteration_at = Some(Utc::now());

        self.reload_accounts();
        self.process_pending_trades().await?;
        self.process_pending_closes().await?;

        Ok(())
    }
}

// ==================== Mirror worker ====================

/// Mirrors leader positions onto followers on a fixed interval.
pub struct MirrorWorker {
    accounts: AccountBook,
    copier: PositionCopier,
    config: WorkerConfig,
    totals: CopyReport,
    shutdown: Arc<AtomicBool>,
}

impl MirrorWorker {
    pub fn new(accounts: AccountBook, terminal: Arc<dyn TradingTerminal>, config: WorkerConfig) -> Self {
        let copier = PositionCopier::new(terminal, config.clone());
        Self {
            accounts,
            copier,
            config,
            totals: CopyReport::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Counts summed over every cycle so far.
    pub fn totals(&self) -> &CopyReport {
        &self.totals
    }

    pub async fn run(&mut self) -> Result<()> {
        info!(
            leaders = self.accounts.leaders().count(),
            followers = self.accounts.followers().count(),
            replicate_closes = self.config.replicate_closes,
            seed_on_start = self.config.seed_on_start,
            "Starting mirror worker"
        );

        if self.accounts.leaders().next().is_none() {
            warn!("No leader accounts configured; nothing will be copied");
        }

        install_ctrl_c(self.shutdown.clone());
        let shutdown = self.shutdown.clone();
        let poll_interval = self.config.poll_interval;
        run_polling(self, poll_interval, shutdown).await
    }
}

#[async_trait]
impl PollTask for MirrorWorker {
    fn name(&self) -> &'static str {
        "mirror"
    }

    async fn tick(&mut self) -> Result<()> {
        if self.config.reload_accounts {
            if let Err(e) = self.accounts.reload() {
                warn!(error = %e, "Failed to reload accounts, keeping previous list");
            }
        }

        let report = self.copier.run_cycle(&self.accounts).await;
        if report.opened > 0 || report.closed > 0 || report.leaders_failed > 0 {
            info!(
                opened = report.opened,
                closed = report.closed,
                copies_placed = report.copies_placed,
                copies_failed = report.copies_failed,
                follower_positions_closed = report.follower_positions_closed,
                leaders_failed = report.leaders_failed,
                "Mirror cycle"
            );
        }

        self.totals.absorb(report);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::PaperTerminal;
    use crate::models::{OrderSide, Position, Role};
    use rust_decimal_macros::dec;

    fn account(login: u64, role: Role) -> Account {
        Account {
            login,
            password: "pw".to_string(),
            path: "terminal64.exe".to_string(),
            server: "Demo".to_string(),
            role,
        }
    }

    fn book() -> AccountBook {
        AccountBook::from_accounts(vec![
            account(1, Role::Leader),
            account(2, Role::Follower),
            account(3, Role::Follower),
        ])
    }

    fn trade(id: &str, side: &str) -> PendingTrade {
        PendingTrade {
            trade_id: id.to_string(),
            instrument: "EURUSD".to_string(),
            quantity: dec!(0.1),
            side: side.to_string(),
            sl: 0.0,
            tp: 0.0,
            leader_login: None,
            account_login: None,
        }
    }

    async fn worker(paper: PaperTerminal, accounts: AccountBook) -> (QueueWorker, Arc<PaperTerminal>) {
        let paper = Arc::new(paper);
        let db = Database::in_memory().await.unwrap();
        let worker = QueueWorker::new(db, accounts, paper.clone(), WorkerConfig::default());
        (worker, paper)
    }

    fn quoted() -> PaperTerminal {
        PaperTerminal::new().with_symbol("EURUSD", 1.1000, 1.1002)
    }

    #[tokio::test]
    async fn test_trade_replayed_on_every_account() {
        let (mut worker, paper) = worker(quoted(), book()).await;
        worker.db().enqueue_trade(&trade("t1", "buy")).await.unwrap();

        worker.tick().await.unwrap();

        assert_eq!(paper.sent_orders().await.len(), 3);
        assert!(worker.db().get_pending_trades().await.unwrap().is_empty());

        let stored = worker.db().get_trade("t1").await.unwrap().unwrap();
        assert_eq!(stored.status, status::EXECUTED);
        assert!(stored.mt5_ticket.is_some());

        let stats = worker.db().get_queue_stats().await.unwrap();
        assert_eq!(stats.executions_done, 3);
        assert_eq!(worker.stats().orders_placed, 3);
    }

    #[tokio::test]
    async fn test_marked_only_after_all_targets_attempted() {
        let (mut worker, paper) = worker(quoted().with_refused_login(2), book()).await;
        worker.db().enqueue_trade(&trade("t1", "sell")).await.unwrap();

        worker.tick().await.unwrap();

        // Account 2 failed but 3 was still attempted before marking
        assert_eq!(paper.login_history().await, vec![1, 2, 3]);
        assert_eq!(
            worker.db().get_trade("t1").await.unwrap().unwrap().status,
            status::EXECUTED
        );

        let stats = worker.db().get_queue_stats().await.unwrap();
        assert_eq!(stats.executions_done, 2);
        assert_eq!(stats.executions_failed, 1);
        assert!(worker.db().ticket_for("t1", 2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_side_never_submitted() {
        let (mut worker, paper) = worker(quoted(), book()).await;
        worker.db().enqueue_trade(&trade("t1", "hold")).await.unwrap();

        worker.tick().await.unwrap();

        assert!(paper.sent_orders().await.is_empty());
        assert!(paper.login_history().await.is_empty());
        assert_eq!(worker.stats().orders_failed, 3);
        assert_eq!(
            worker.db().get_trade("t1").await.unwrap().unwrap().status,
            status::EXECUTED
        );
    }

    #[tokio::test]
    async fn test_leader_routing() {
        let accounts = AccountBook::from_accounts(vec![
            account(1, Role::Leader),
            account(4, Role::Leader),
            account(2, Role::Follower),
        ]);
        let (mut worker, paper) = worker(quoted(), accounts).await;
        let mut routed = trade("t1", "buy");
        routed.leader_login = Some(1);
        worker.db().enqueue_trade(&routed).await.unwrap();

        worker.tick().await.unwrap();

        let logins: Vec<u64> = paper.sent_orders().await.iter().map(|o| o.login).collect();
        assert_eq!(logins, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_unrouted_trade_still_marked() {
        let (mut worker, paper) = worker(quoted(), book()).await;
        let mut pinned = trade("t1", "buy");
        pinned.account_login = Some(99);
        worker.db().enqueue_trade(&pinned).await.unwrap();

        worker.tick().await.unwrap();

        assert!(paper.sent_orders().await.is_empty());
        assert_eq!(worker.stats().unrouted_trades, 1);
        assert!(worker.db().get_pending_trades().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_close_uses_recorded_ticket() {
        let (mut worker, paper) = worker(quoted(), book()).await;
        let mut pinned = trade("t1", "buy");
        pinned.account_login = Some(2);
        worker.db().enqueue_trade(&pinned).await.unwrap();
        worker.tick().await.unwrap();
        assert_eq!(paper.positions_of(2).await.len(), 1);

        worker.db().request_trade_close("c1", "t1").await.unwrap();
        worker.tick().await.unwrap();

        assert!(paper.positions_of(2).await.is_empty());
        assert_eq!(worker.stats().closes_placed, 1);
        // Accounts 1 and 3 never held the ticket
        assert_eq!(worker.stats().closes_failed, 2);
        assert!(worker.db().get_pending_closes().await.unwrap().is_empty());
        assert_eq!(
            worker.db().get_trade("t1").await.unwrap().unwrap().status,
            status::CLOSED
        );

        let close = paper.sent_orders().await.into_iter().last().unwrap();
        assert_eq!(close.request.order_type, OrderSide::Sell);
    }

    #[tokio::test]
    async fn test_reload_accounts_each_iteration() {
        let path = std::env::temp_dir().join(format!("tradeq-worker-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"[{"login": 2, "password": "pw", "path": "t.exe", "server": "Demo"}]"#)
            .unwrap();

        let accounts = AccountBook::load(&path).unwrap();
        let paper = Arc::new(quoted());
        let db = Database::in_memory().await.unwrap();
        let config = WorkerConfig {
            reload_accounts: true,
            ..Default::default()
        };
        let mut worker = QueueWorker::new(db, accounts, paper.clone(), config);

        std::fs::write(
            &path,
            r#"[{"login": 2, "password": "pw", "path": "t.exe", "server": "Demo"},
                {"login": 3, "password": "pw", "path": "t.exe", "server": "Demo"}]"#,
        )
        .unwrap();
        worker.db().enqueue_trade(&trade("t1", "buy")).await.unwrap();
        worker.tick().await.unwrap();

        assert_eq!(paper.sent_orders().await.len(), 2);
        std::fs::remove_file(&path).ok();
    }

    #[tokio::test]
    async fn test_mirror_worker_copies_leader() {
        let paper = Arc::new(quoted());
        paper
            .set_positions(
                1,
                vec![Position {
                    ticket: 500,
                    symbol: "EURUSD".to_string(),
                    volume: 0.2,
                    side: OrderSide::Buy,
                    price_open: 1.1,
                    sl: 0.0,
                    tp: 0.0,
                }],
            )
            .await;

        let mut worker = MirrorWorker::new(book(), paper.clone(), WorkerConfig::mirror());
        worker.tick().await.unwrap();

        assert_eq!(paper.positions_of(2).await.len(), 1);
        assert_eq!(paper.positions_of(3).await.len(), 1);
        assert_eq!(worker.totals().copies_placed, 2);

        paper.set_positions(1, vec![]).await;
        worker.tick().await.unwrap();

        assert!(paper.positions_of(2).await.is_empty());
        assert_eq!(worker.totals().closed, 1);
    }

    struct Counter {
        ticks: u32,
        stop_after: u32,
        first_tick_delay: Duration,
        started: Vec<std::time::Instant>,
        shutdown: Arc<AtomicBool>,
    }

    impl Counter {
        fn new(stop_after: u32, shutdown: Arc<AtomicBool>) -> Self {
            Self {
                ticks: 0,
                stop_after,
                first_tick_delay: Duration::ZERO,
                started: Vec::new(),
                shutdown,
            }
        }
    }

    #[async_trait]
    impl PollTask for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        async fn tick(&mut self) -> Result<()> {
            self.started.push(std::time::Instant::now());
            self.ticks += 1;
            if self.ticks == 1 && !self.first_tick_delay.is_zero() {
                sleep(self.first_tick_delay).await;
            }
            if self.ticks >= self.stop_after {
                self.shutdown.store(true, Ordering::SeqCst);
            }
            anyhow::bail!("tick errors do not stop the loop")
        }
    }

    #[tokio::test]
    async fn test_polling_stops_after_current_iteration() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut counter = Counter::new(3, shutdown.clone());

        run_polling(&mut counter, Duration::from_millis(1), shutdown).await.unwrap();
        assert_eq!(counter.ticks, 3);
    }

    #[tokio::test]
    async fn test_polling_with_shutdown_set_never_ticks() {
        let shutdown = Arc::new(AtomicBool::new(true));
        let mut counter = Counter::new(1, shutdown.clone());

        run_polling(&mut counter, Duration::from_millis(1), shutdown).await.unwrap();
        assert_eq!(counter.ticks, 0);
    }

    #[tokio::test]
    async fn test_polling_rejects_zero_interval() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut counter = Counter::new(1, shutdown.clone());

        assert!(run_polling(&mut counter, Duration::ZERO, shutdown).await.is_err());
        assert_eq!(counter.ticks, 0);
    }

    #[tokio::test]
    async fn test_polling_sleeps_after_slow_iteration() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut counter = Counter::new(4, shutdown.clone());
        counter.first_tick_delay = Duration::from_millis(250);

        let poll_interval = Duration::from_millis(50);
        run_polling(&mut counter, poll_interval, shutdown).await.unwrap();

        assert_eq!(counter.started.len(), 4);
        let gaps: Vec<Duration> = counter.started.windows(2).map(|w| w[1] - w[0]).collect();
        assert!(gaps[0] >= Duration::from_millis(300), "gaps: {:?}", gaps);
        for gap in &gaps[1..] {
            assert!(*gap >= poll_interval, "gaps: {:?}", gaps);
        }
    }

    #[tokio::test]
    async fn test_shutdown_during_sleep_skips_next_iteration() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut counter = Counter::new(u32::MAX, shutdown.clone());

        let flag = shutdown.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
        });

        run_polling(&mut counter, Duration::from_millis(300), shutdown).await.unwrap();
        assert_eq!(counter.ticks, 1);
    }
}
