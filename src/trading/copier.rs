//! Leader/follower position copier.
//!
//! Each cycle snapshots a leader's open positions, diffs the ticket set
//! against the previous snapshot, and replays new positions as orders and
//! vanished positions as closes on every follower. Snapshots live only in
//! memory; a restart starts from an empty snapshot.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::api::{Credentials, TradingTerminal};
use crate::models::{Account, Position};

use super::{AccountBook, ExecutionError, OrderPlacer, WorkerConfig};

/// Tickets that appeared and disappeared between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TicketDiff {
    /// In the current snapshot only, ascending
    pub opened: Vec<u64>,
    /// In the previous snapshot only, ascending
    pub closed: Vec<u64>,
}

impl TicketDiff {
    pub fn is_empty(&self) -> bool {
        self.opened.is_empty() && self.closed.is_empty()
    }
}

/// `opened = current - previous`, `closed = previous - current`.
pub fn diff_tickets(previous: &HashSet<u64>, current: &HashSet<u64>) -> TicketDiff {
    let mut opened: Vec<u64> = current.difference(previous).copied().collect();
    let mut closed: Vec<u64> = previous.difference(current).copied().collect();
    opened.sort_unstable();
    closed.sort_unstable();
    TicketDiff { opened, closed }
}

/// Outcome counts of one copier cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyReport {
    pub leaders_synced: usize,
    pub leaders_failed: usize,
    pub opened: usize,
    pub closed: usize,
    pub copies_placed: usize,
    pub copies_failed: usize,
    pub follower_positions_closed: usize,
    pub close_failures: usize,
}

impl CopyReport {
    /// Add another report's counts to this one.
    pub fn absorb(&mut self, other: CopyReport) {
        self.leaders_synced += other.leaders_synced;
        self.leaders_failed += other.leaders_failed;
        self.opened += other.opened;
        self.closed += other.closed;
        self.copies_placed += other.copies_placed;
        self.copies_failed += other.copies_failed;
        self.follower_positions_closed += other.follower_positions_closed;
        self.close_failures += other.close_failures;
    }
}

/// Mirrors leader positions onto followers.
pub struct PositionCopier {
    terminal: Arc<dyn TradingTerminal>,
    placer: OrderPlacer,
    config: WorkerConfig,

    // Last seen open positions per leader login, keyed by ticket
    snapshots: HashMap<u64, HashMap<u64, Position>>,
}

impl PositionCopier {
    pub fn new(terminal: Arc<dyn TradingTerminal>, config: WorkerConfig) -> Self {
        let placer = OrderPlacer::new(terminal.clone(), config.clone());
        Self {
            terminal,
            placer,
            config,
            snapshots: HashMap::new(),
        }
    }

    /// Tickets last seen open for a leader.
    #[cfg(test)]
    pub fn known_tickets(&self, leader: u64) -> HashSet<u64> {
        self.snapshots
            .get(&leader)
            .map(|s| s.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Sync every leader in the book onto its followers.
    pub async fn run_cycle(&mut self, book: &AccountBook) -> CopyReport {
        let followers: Vec<&Account> = book.followers().collect();
        let mut report = CopyReport::default();

        for leader in book.leaders() {
            match self.sync_leader(leader, &followers).await {
                Ok(r) => report.absorb(r),
                Err(e) => {
                    warn!(leader = leader.login, error = %e, "Skipping leader this cycle");
                    report.leaders_failed += 1;
                }
            }
        }

        report
    }

    /// Diff one leader against its last snapshot and replicate the changes.
    pub async fn sync_leader(
        &mut self,
        leader: &Account,
        followers: &[&Account],
    ) -> Result<CopyReport, ExecutionError> {
        let positions = self.leader_positions(leader).await?;
        let current: HashMap<u64, Position> =
            positions.into_iter().map(|p| (p.ticket, p)).collect();

        let mut report = CopyReport {
            leaders_synced: 1,
            ..Default::default()
        };

        let previous = match self.snapshots.get(&leader.login).cloned() {
            Some(previous) => previous,
            None if self.config.seed_on_start => {
                info!(
                    leader = leader.login,
                    positions = current.len(),
                    "Seeded leader snapshot"
                );
                self.snapshots.insert(leader.login, current);
                return Ok(report);
            }
            None => HashMap::new(),
        };

        Ok(self.replicate(leader, followers, previous, current, report).await)
    }

    async fn replicate(
        &mut self,
        leader: &Account,
        followers: &[&Account],
        previous: HashMap<u64, Position>,
        current: HashMap<u64, Position>,
        mut report: CopyReport,
    ) -> CopyReport {
        let previous_tickets: HashSet<u64> = previous.keys().copied().collect();
        let current_tickets: HashSet<u64> = current.keys().copied().collect();
        let diff = diff_tickets(&previous_tickets, &current_tickets);

        if diff.is_empty() {
            debug!(leader = leader.login, positions = current.len(), "No leader changes");
            self.snapshots.insert(leader.login, current);
            return report;
        }
        report.opened = diff.opened.len();
        report.closed = diff.closed.len();

        for ticket in &diff.opened {
            let position = &current[ticket];
            info!(
                leader = leader.login,
                ticket = ticket,
                symbol = %position.symbol,
                volume = position.volume,
                side = %position.side,
                price = position.price_open,
                "New trade by leader"
            );

            for follower in followers {
                match self.placer.copy_position(follower, position).await {
                    Ok(_) => report.copies_placed += 1,
                    Err(_) => report.copies_failed += 1,
                }
            }
        }

        for ticket in &diff.closed {
            let position = &previous[ticket];
            info!(
                leader = leader.login,
                ticket = ticket,
                symbol = %position.symbol,
                "Trade closed by leader"
            );

            if !self.config.replicate_closes {
                continue;
            }

            for follower in followers {
                match self
                    .placer
                    .close_matching(follower, &position.symbol, position.side)
                    .await
                {
                    Ok(n) => report.follower_positions_closed += n,
                    Err(e) => {
                        error!(follower = follower.login, error = %e, "Failed to replicate close");
                        report.close_failures += 1;
                    }
                }
            }
        }

        self.snapshots.insert(leader.login, current);
        report
    }

    async fn leader_positions(&self, leader: &Account) -> Result<Vec<Position>, ExecutionError> {
        if !self.terminal.initialize(&Credentials::from(leader)).await? {
            error!(leader = leader.login, "Failed to connect to leader");
            return Err(ExecutionError::ConnectionFailed {
                login: leader.login,
            });
        }

        let positions = self.terminal.positions_get(None).await;
        if let Err(e) = self.terminal.shutdown().await {
            warn!(leader = leader.login, error = %e, "Terminal shutdown failed");
        }
        Ok(positions?)
    }
}
