//! Trading-terminal API: the terminal trait and its back-ends.

mod bridge_client;
mod paper;
mod terminal;
mod types;

pub use bridge_client::BridgeClient;
pub use paper::PaperTerminal;
pub use terminal::TradingTerminal;
pub use types::*;
