//! Failures of a single terminal operation.

use thiserror::Error;

/// Why an order or close was not executed on an account.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("failed to connect account {login}")]
    ConnectionFailed { login: u64 },

    #[error("symbol {symbol} not available for account {login}")]
    SymbolUnavailable { symbol: String, login: u64 },

    #[error("no price for {symbol}")]
    NoTick { symbol: String },

    #[error("unknown order side: {0:?}")]
    UnknownSide(String),

    #[error("invalid ticket number: {0:?}")]
    InvalidTicket(String),

    #[error("order rejected with retcode {retcode}: {comment}")]
    Rejected { retcode: u32, comment: String },

    #[error("no response from terminal")]
    NoResponse,

    #[error("terminal error: {0:#}")]
    Terminal(#[from] anyhow::Error),
}

impl ExecutionError {
    /// Terminal return code, when the terminal answered with one.
    pub fn retcode(&self) -> Option<u32> {
        match self {
            ExecutionError::Rejected { retcode, .. } => Some(*retcode),
            _ => None,
        }
    }
}
