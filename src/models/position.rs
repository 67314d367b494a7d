//! Open position as reported by the terminal.

use serde::{Deserialize, Serialize};

use super::trade::OrderSide;

/// An open position on one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Broker-assigned position ticket
    pub ticket: u64,

    pub symbol: String,

    /// Lots held
    pub volume: f64,

    /// Direction of the position
    #[serde(rename = "type")]
    pub side: OrderSide,

    #[serde(default)]
    pub price_open: f64,

    #[serde(default)]
    pub sl: f64,

    #[serde(default)]
    pub tp: f64,
}

impl Position {
    /// Stop-loss to carry onto a copied order (0 when unset).
    pub fn copied_sl(&self) -> f64 {
        if self.sl > 0.0 {
            self.sl
        } else {
            0.0
        }
    }

    /// Take-profit to carry onto a copied order (0 when unset).
    pub fn copied_tp(&self) -> f64 {
        if self.tp > 0.0 {
            self.tp
        } else {
            0.0
        }
    }
}
