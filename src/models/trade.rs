//! Queued trade instructions awaiting submission to the terminal.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a market order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Parse a queued side value. Anything but buy/sell is rejected.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "buy" => Some(Self::Buy),
            "sell" => Some(Self::Sell),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }

    /// The side that offsets a position opened on this side.
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pending trade row from the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingTrade {
    /// Queue identifier
    pub trade_id: String,

    /// Symbol to trade (e.g. "EURUSD")
    pub instrument: String,

    /// Requested lots before normalisation
    pub quantity: Decimal,

    /// Raw side value as stored; validated by the order placer
    pub side: String,

    /// Stop-loss price, 0 when unset
    #[serde(default)]
    pub sl: f64,

    /// Take-profit price, 0 when unset
    #[serde(default)]
    pub tp: f64,

    /// Leader that originated this trade, if any
    #[serde(default)]
    pub leader_login: Option<u64>,

    /// Single account this trade is aimed at, if any
    #[serde(default)]
    pub account_login: Option<u64>,
}

impl PendingTrade {
    /// Parsed side, `None` for unknown values.
    pub fn order_side(&self) -> Option<OrderSide> {
        OrderSide::parse(&self.side)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_parsing() {
        assert_eq!(OrderSide::parse("BUY"), Some(OrderSide::Buy));
        assert_eq!(OrderSide::parse(" sell "), Some(OrderSide::Sell));
        assert_eq!(OrderSide::parse("hold"), None);
        assert_eq!(OrderSide::parse(""), None);
    }

    #[test]
    fn test_opposite() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
    }
}
