//! Request and response types exchanged with the trading terminal.

use serde::{Deserialize, Serialize};

use crate::models::{Account, OrderSide};

/// Return code the terminal reports for a completed request.
pub const RETCODE_DONE: u32 = 10009;

/// Login parameters for `initialize`.
#[derive(Debug, Clone, Serialize)]
pub struct Credentials {
    pub path: String,
    pub login: u64,
    pub password: String,
    pub server: String,
}

impl From<&Account> for Credentials {
    fn from(account: &Account) -> Self {
        Self {
            path: account.path.clone(),
            login: account.login,
            password: account.password.clone(),
            server: account.server.clone(),
        }
    }
}

/// Symbol properties relevant to order placement.
#[derive(Debug, Clone, Deserialize)]
pub struct SymbolInfo {
    /// Whether the symbol is shown in Market Watch (tradeable)
    #[serde(default)]
    pub visible: bool,
    /// Smallest lot the broker accepts for this symbol
    #[serde(default)]
    pub volume_min: f64,
}

/// Last quote for a symbol.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Tick {
    pub bid: f64,
    pub ask: f64,
}

impl Tick {
    /// Price an order on `side` fills at.
    pub fn entry_price(&self, side: OrderSide) -> f64 {
        match side {
            OrderSide::Buy => self.ask,
            OrderSide::Sell => self.bid,
        }
    }

    /// Price a position on `side` is closed at.
    pub fn exit_price(&self, side: OrderSide) -> f64 {
        match side {
            OrderSide::Buy => self.bid,
            OrderSide::Sell => self.ask,
        }
    }
}

/// Trade operation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    /// Immediate market execution
    Deal,
}

/// Order lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderTime {
    /// Good till cancelled
    Gtc,
}

/// Order filling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderFilling {
    /// Fill or kill
    Fok,
    /// Immediate or cancel
    Ioc,
}

impl std::str::FromStr for OrderFilling {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fok" => Ok(Self::Fok),
            "ioc" => Ok(Self::Ioc),
            other => anyhow::bail!("unknown filling mode: {}", other),
        }
    }
}

/// Market order submitted through `order_send`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderRequest {
    pub action: TradeAction,
    pub symbol: String,
    pub volume: f64,
    #[serde(rename = "type")]
    pub order_type: OrderSide,
    pub price: f64,
    pub sl: f64,
    pub tp: f64,
    pub deviation: u32,
    pub type_time: OrderTime,
    pub type_filling: OrderFilling,
    /// Position ticket being closed, for close requests
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
}

/// Terminal reply to `order_send`.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderResult {
    pub retcode: u32,
    #[serde(default)]
    pub deal: u64,
    #[serde(default)]
    pub order: u64,
    #[serde(default)]
    pub volume: f64,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub comment: String,
}

impl OrderResult {
    pub fn is_done(&self) -> bool {
        self.retcode == RETCODE_DONE
    }
}
