//! SQLite trade queue.
//!
//! Holds the instructions the worker replays:
//! - Pending trades, marked executed once every target account was tried
//! - Close requests, marked closed once every account was tried
//! - One execution record per (trade, account) attempt

use anyhow::{Context, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::info;

use crate::models::{PendingClose, PendingTrade};

/// Queue status values.
pub mod status {
    pub const PENDING: &str = "pending";
    pub const EXECUTED: &str = "executed";
    pub const CLOSED: &str = "closed";
    pub const DONE: &str = "done";
    pub const FAILED: &str = "failed";
}

/// Database connection pool for the trade queue.
pub struct Database {
    pool: SqlitePool,
}

/// Stored trade row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredTrade {
    pub trade_id: String,
    pub instrument: String,
    pub quantity: f64,
    pub side: String,
    pub sl: Option<f64>,
    pub tp: Option<f64>,
    pub leader_login: Option<String>,
    pub account_login: Option<String>,
    pub status: String,
    pub mt5_ticket: Option<String>,
    pub created_at: String,
    pub executed_at: Option<String>,
    pub closed_at: Option<String>,
}

impl StoredTrade {
    pub fn into_pending(self) -> PendingTrade {
        PendingTrade {
            trade_id: self.trade_id,
            instrument: self.instrument,
            quantity: Decimal::try_from(self.quantity).unwrap_or(Decimal::ZERO),
            side: self.side,
            sl: self.sl.unwrap_or(0.0),
            tp: self.tp.unwrap_or(0.0),
            leader_login: parse_login(self.leader_login.as_deref()),
            account_login: parse_login(self.account_login.as_deref()),
        }
    }
}

/// Stored close request row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredClose {
    pub close_id: String,
    pub trade_id: Option<String>,
    pub ticket: String,
    pub instrument: String,
    pub quantity: f64,
    pub side: String,
    pub status: String,
    pub created_at: String,
    pub closed_at: Option<String>,
}

impl StoredClose {
    pub fn into_pending(self) -> PendingClose {
        PendingClose {
            close_id: self.close_id,
            trade_id: self.trade_id,
            ticket: self.ticket,
            instrument: self.instrument,
            quantity: Decimal::try_from(self.quantity).unwrap_or(Decimal::ZERO),
            side: self.side,
        }
    }
}

/// One attempt to execute a trade on one account.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredExecution {
    pub id: i64,
    pub trade_id: String,
    pub account_login: i64,
    pub ticket: Option<String>,
    pub status: String,
    pub error_message: Option<String>,
    pub executed_at: String,
}

/// Row counts per queue state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending_trades: i64,
    pub executed_trades: i64,
    pub closed_trades: i64,
    pub pending_closes: i64,
    pub closed_closes: i64,
    pub executions_done: i64,
    pub executions_failed: i64,
}

fn parse_login(raw: Option<&str>) -> Option<u64> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        Self::from_pool(pool).await
    }

    /// Private in-memory database on a single pinned connection.
    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool and bring its schema up to date.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        // Trade instructions
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS trades (
                trade_id TEXT PRIMARY KEY,
                instrument TEXT NOT NULL,
                quantity REAL NOT NULL,
                side TEXT NOT NULL,
                sl REAL,
                tp REAL,
                leader_login TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                mt5_ticket TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                executed_at TEXT,
                closed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Close instructions
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS close_requests (
                close_id TEXT PRIMARY KEY,
                trade_id TEXT,
                ticket TEXT NOT NULL,
                instrument TEXT NOT NULL,
                quantity REAL NOT NULL,
                side TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                closed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Per-account execution attempts
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS executions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                trade_id TEXT NOT NULL,
                account_login INTEGER NOT NULL,
                ticket TEXT,
                status TEXT NOT NULL,
                error_message TEXT,
                executed_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // trades.account_login was added after the first schema
        let (has_account_login,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM pragma_table_info('trades') WHERE name = 'account_login'",
        )
        .fetch_one(&self.pool)
        .await?;
        if has_account_login == 0 {
            sqlx::query("ALTER TABLE trades ADD COLUMN account_login VARCHAR(50)")
                .execute(&self.pool)
                .await?;
            info!("Added account_login column to trades");
        }

        // Indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_trades_status ON trades(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_close_requests_status ON close_requests(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_executions_trade ON executions(trade_id, account_login)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Trades ====================

    /// Queue a new trade instruction.
    pub async fn enqueue_trade(&self, trade: &PendingTrade) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                trade_id, instrument, quantity, side, sl, tp,
                leader_login, account_login, status
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trade.trade_id)
        .bind(&trade.instrument)
        .bind(trade.quantity.to_f64().unwrap_or(0.0))
        .bind(&trade.side)
        .bind(trade.sl)
        .bind(trade.tp)
        .bind(trade.leader_login.map(|l| l.to_string()))
        .bind(trade.account_login.map(|l| l.to_string()))
        .bind(status::PENDING)
        .execute(&self.pool)
        .await
        .context("Failed to enqueue trade")?;

        Ok(())
    }

    /// Trades waiting for execution, oldest first.
    pub async fn get_pending_trades(&self) -> Result<Vec<PendingTrade>> {
        let rows = sqlx::query_as::<_, StoredTrade>(
            "SELECT * FROM trades WHERE status = ? ORDER BY created_at, rowid",
        )
        .bind(status::PENDING)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch pending trades")?;

        Ok(rows.into_iter().map(StoredTrade::into_pending).collect())
    }

    pub async fn get_trade(&self, trade_id: &str) -> Result<Option<StoredTrade>> {
        sqlx::query_as::<_, StoredTrade>("SELECT * FROM trades WHERE trade_id = ?")
            .bind(trade_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch trade")
    }

    /// Mark a trade as executed.
    pub async fn mark_trade_executed(&self, trade_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE trades SET status = ?, executed_at = datetime('now') WHERE trade_id = ?",
        )
        .bind(status::EXECUTED)
        .bind(trade_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Store the broker ticket assigned to a trade.
    pub async fn update_trade_ticket(&self, trade_id: &str, ticket: &str) -> Result<()> {
        sqlx::query("UPDATE trades SET mt5_ticket = ? WHERE trade_id = ?")
            .bind(ticket)
            .bind(trade_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Closes ====================

    /// Queue a close instruction.
    pub async fn enqueue_close(&self, close: &PendingClose) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO close_requests (close_id, trade_id, ticket, instrument, quantity, side, status)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&close.close_id)
        .bind(&close.trade_id)
        .bind(&close.ticket)
        .bind(&close.instrument)
        .bind(close.quantity.to_f64().unwrap_or(0.0))
        .bind(&close.side)
        .bind(status::PENDING)
        .execute(&self.pool)
        .await
        .context("Failed to enqueue close")?;

        Ok(())
    }

    /// Queue a close for an executed trade, reusing its ticket and terms.
    pub async fn request_trade_close(&self, close_id: &str, trade_id: &str) -> Result<PendingClose> {
        let trade = self
            .get_trade(trade_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Trade {} not found", trade_id))?;

        let ticket = trade
            .mt5_ticket
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Trade {} has no ticket yet", trade_id))?;

        let close = PendingClose {
            close_id: close_id.to_string(),
            trade_id: Some(trade.trade_id),
            ticket,
            instrument: trade.instrument,
            quantity: Decimal::try_from(trade.quantity).unwrap_or(Decimal::ZERO),
            side: trade.side,
        };
        self.enqueue_close(&close).await?;

        Ok(close)
    }

    /// Close requests waiting for execution, oldest first.
    pub async fn get_pending_closes(&self) -> Result<Vec<PendingClose>> {
        let rows = sqlx::query_as::<_, StoredClose>(
            "SELECT * FROM close_requests WHERE status = ? ORDER BY created_at, rowid",
        )
        .bind(status::PENDING)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch pending closes")?;

        Ok(rows.into_iter().map(StoredClose::into_pending).collect())
    }

    /// Mark a close request, and the trade it belongs to, as closed.
    pub async fn mark_close_executed(&self, close_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE close_requests SET status = ?, closed_at = datetime('now') WHERE close_id = ?",
        )
        .bind(status::CLOSED)
        .bind(close_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE trades SET status = ?, closed_at = datetime('now')
            WHERE trade_id = (SELECT trade_id FROM close_requests WHERE close_id = ?)
            "#,
        )
        .bind(status::CLOSED)
        .bind(close_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    // ==================== Executions ====================

    /// Record the outcome of one account's attempt.
    pub async fn record_execution(
        &self,
        trade_id: &str,
        account_login: u64,
        ticket: Option<&str>,
        status: &str,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO executions (trade_id, account_login, ticket, status, error_message)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(trade_id)
        .bind(account_login as i64)
        .bind(ticket)
        .bind(status)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Ticket a trade got on a specific account, if it executed there.
    pub async fn ticket_for(&self, trade_id: &str, account_login: u64) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            r#"
            SELECT ticket FROM executions
            WHERE trade_id = ? AND account_login = ? AND status = ?
            ORDER BY id DESC LIMIT 1
            "#,
        )
        .bind(trade_id)
        .bind(account_login as i64)
        .bind(status::DONE)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|(ticket,)| ticket))
    }

    /// Most recent execution attempts.
    pub async fn recent_executions(&self, limit: i64) -> Result<Vec<StoredExecution>> {
        sqlx::query_as::<_, StoredExecution>(
            "SELECT * FROM executions ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch executions")
    }

    // ==================== Stats ====================

    /// Count rows per queue state.
    pub async fn get_queue_stats(&self) -> Result<QueueStats> {
        let count = |table: &'static str, state: &'static str| {
            let pool = self.pool.clone();
            async move {
                let sql = format!("SELECT COUNT(*) FROM {} WHERE status = ?", table);
                let (n,): (i64,) = sqlx::query_as(&sql).bind(state).fetch_one(&pool).await?;
                Ok::<i64, anyhow::Error>(n)
            }
        };

        Ok(QueueStats {
            pending_trades: count("trades", status::PENDING).await?,
            executed_trades: count("trades", status::EXECUTED).await?,
            closed_trades: count("trades", status::CLOSED).await?,
            pending_closes: count("close_requests", status::PENDING).await?,
            closed_closes: count("close_requests", status::CLOSED).await?,
            executions_done: count("executions", status::DONE).await?,
            executions_failed: count("executions", status::FAILED).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn trade(id: &str) -> PendingTrade {
        PendingTrade {
            trade_id: id.to_string(),
            instrument: "EURUSD".to_string(),
            quantity: dec!(0.25),
            side: "buy".to_string(),
            sl: 1.05,
            tp: 0.0,
            leader_login: Some(1001),
            account_login: None,
        }
    }

    #[tokio::test]
    async fn test_trade_lifecycle() {
        let db = Database::in_memory().await.unwrap();
        db.enqueue_trade(&trade("a")).await.unwrap();
        db.enqueue_trade(&trade("b")).await.unwrap();

        let pending = db.get_pending_trades().await.unwrap();
        let ids: Vec<&str> = pending.iter().map(|t| t.trade_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(pending[0].quantity, dec!(0.25));
        assert_eq!(pending[0].leader_login, Some(1001));
        assert_eq!(pending[0].account_login, None);

        db.update_trade_ticket("a", "555").await.unwrap();
        db.mark_trade_executed("a").await.unwrap();

        let pending = db.get_pending_trades().await.unwrap();
        assert_eq!(pending.len(), 1);

        let stored = db.get_trade("a").await.unwrap().unwrap();
        assert_eq!(stored.status, status::EXECUTED);
        assert_eq!(stored.mt5_ticket.as_deref(), Some("555"));
        assert!(stored.executed_at.is_some());
    }

    #[tokio::test]
    async fn test_close_marks_trade_closed() {
        let db = Database::in_memory().await.unwrap();
        db.enqueue_trade(&trade("a")).await.unwrap();
        db.update_trade_ticket("a", "777").await.unwrap();
        db.mark_trade_executed("a").await.unwrap();

        let close = db.request_trade_close("c1", "a").await.unwrap();
        assert_eq!(close.ticket, "777");
        assert_eq!(close.side, "buy");

        let pending = db.get_pending_closes().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].trade_id.as_deref(), Some("a"));

        db.mark_close_executed("c1").await.unwrap();
        assert!(db.get_pending_closes().await.unwrap().is_empty());
        assert_eq!(db.get_trade("a").await.unwrap().unwrap().status, status::CLOSED);
    }

    #[tokio::test]
    async fn test_close_without_ticket_refused() {
        let db = Database::in_memory().await.unwrap();
        db.enqueue_trade(&trade("a")).await.unwrap();

        assert!(db.request_trade_close("c1", "a").await.is_err());
        assert!(db.request_trade_close("c2", "missing").await.is_err());
    }

    #[tokio::test]
    async fn test_executions_and_stats() {
        let db = Database::in_memory().await.unwrap();
        db.enqueue_trade(&trade("a")).await.unwrap();

        db.record_execution("a", 10, Some("100"), status::DONE, None).await.unwrap();
        db.record_execution("a", 11, None, status::FAILED, Some("retcode 10019")).await.unwrap();

        assert_eq!(db.ticket_for("a", 10).await.unwrap().as_deref(), Some("100"));
        assert_eq!(db.ticket_for("a", 11).await.unwrap(), None);

        let stats = db.get_queue_stats().await.unwrap();
        assert_eq!(stats.pending_trades, 1);
        assert_eq!(stats.executions_done, 1);
        assert_eq!(stats.executions_failed, 1);

        let recent = db.recent_executions(10).await.unwrap();
        assert_eq!(recent[0].account_login, 11);
    }

    #[tokio::test]
    async fn test_account_login_migration_on_legacy_schema() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        sqlx::query(
            r#"
            CREATE TABLE trades (
                trade_id TEXT PRIMARY KEY,
                instrument TEXT NOT NULL,
                quantity REAL NOT NULL,
                side TEXT NOT NULL,
                sl REAL,
                tp REAL,
                leader_login TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                mt5_ticket TEXT,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                executed_at TEXT,
                closed_at TEXT
            )
            "#,
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query("INSERT INTO trades (trade_id, instrument, quantity, side) VALUES ('old', 'EURUSD', 1.0, 'sell')")
            .execute(&pool)
            .await
            .unwrap();

        let db = Database::from_pool(pool).await.unwrap();
        // Second run must be a no-op
        db.run_migrations().await.unwrap();

        let pending = db.get_pending_trades().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].account_login, None);

        let mut pinned = trade("new");
        pinned.account_login = Some(42);
        db.enqueue_trade(&pinned).await.unwrap();
        let stored = db.get_trade("new").await.unwrap().unwrap();
        assert_eq!(stored.account_login.as_deref(), Some("42"));
    }

    #[test]
    fn test_parse_login() {
        assert_eq!(parse_login(Some(" 123 ")), Some(123));
        assert_eq!(parse_login(Some("")), None);
        assert_eq!(parse_login(Some("abc")), None);
        assert_eq!(parse_login(None), None);
    }
}
