//! Trading logic: accounts, order placement, position copying.

mod accounts;
mod config;
mod copier;
mod error;
mod placer;

pub use accounts::AccountBook;
pub use config::WorkerConfig;
pub use copier::{CopyReport, PositionCopier};
pub use error::ExecutionError;
pub use placer::OrderPlacer;
