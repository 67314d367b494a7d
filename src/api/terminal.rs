//! The trading-terminal boundary.

use anyhow::Result;
use async_trait::async_trait;

use crate::models::Position;

use super::types::{Credentials, OrderRequest, OrderResult, SymbolInfo, Tick};

/// Operations the worker needs from a trading terminal.
///
/// A terminal serves one logged-in account at a time: callers `initialize`
/// an account, run their operation, then `shutdown`. `Err` is reserved for
/// transport failures; "not found" style answers are `None`/`false`.
#[async_trait]
pub trait TradingTerminal: Send + Sync {
    /// Log into an account. Returns `false` when the terminal refuses.
    async fn initialize(&self, credentials: &Credentials) -> Result<bool>;

    async fn symbol_info(&self, symbol: &str) -> Result<Option<SymbolInfo>>;

    /// Enable or disable a symbol in Market Watch.
    async fn symbol_select(&self, symbol: &str, enable: bool) -> Result<bool>;

    async fn symbol_info_tick(&self, symbol: &str) -> Result<Option<Tick>>;

    /// Submit an order. `None` means the terminal gave no reply.
    async fn order_send(&self, request: &OrderRequest) -> Result<Option<OrderResult>>;

    /// Open positions, optionally restricted to one symbol.
    async fn positions_get(&self, symbol: Option<&str>) -> Result<Vec<Position>>;

    async fn shutdown(&self) -> Result<()>;
}
