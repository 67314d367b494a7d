//! Data models for accounts, queued instructions, and terminal positions.

mod account;
mod close;
mod position;
mod trade;

pub use account::{Account, Role};
pub use close::PendingClose;
pub use position::Position;
pub use trade::{OrderSide, PendingTrade};
