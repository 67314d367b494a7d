//! Queued close instructions.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::trade::OrderSide;

/// Pending close row from the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingClose {
    pub close_id: String,

    /// Trade this close belongs to, when it came from the trade queue
    #[serde(default)]
    pub trade_id: Option<String>,

    /// Position ticket as stored (text in the queue)
    pub ticket: String,

    pub instrument: String,

    pub quantity: Decimal,

    /// Side of the position being closed
    pub side: String,
}

impl PendingClose {
    pub fn position_side(&self) -> Option<OrderSide> {
        OrderSide::parse(&self.side)
    }
}
