//! In-memory terminal used for dry runs and tests.
//!
//! Tracks one position book per login, fills every accepted market order
//! at the quoted price and records each submitted request.

use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::models::Position;

use super::terminal::TradingTerminal;
use super::types::{Credentials, OrderRequest, OrderResult, SymbolInfo, Tick, RETCODE_DONE};

/// Return code for a request the paper book cannot satisfy.
pub const RETCODE_INVALID: u32 = 10013;

const FIRST_TICKET: u64 = 100_000;

/// An order the paper terminal received.
#[derive(Debug, Clone)]
pub struct SentOrder {
    pub login: u64,
    pub request: OrderRequest,
}

const DEFAULT_VOLUME_MIN: f64 = 0.01;

// Symbols and scripted replies are only set up by tests.
#[cfg_attr(not(test), allow(dead_code))]
#[derive(Debug, Clone)]
struct PaperSymbol {
    visible: bool,
    volume_min: f64,
    tick: Option<Tick>,
}

/// Scripted reply for the next `order_send`.
#[cfg_attr(not(test), allow(dead_code))]
#[derive(Debug, Clone, Copy)]
enum Reply {
    Retcode(u32),
    Silent,
}

#[derive(Debug, Default)]
struct PaperState {
    symbols: HashMap<String, PaperSymbol>,
    books: HashMap<u64, Vec<Position>>,
    refused: HashSet<u64>,
    session: Option<u64>,
    next_ticket: u64,
    replies: VecDeque<Reply>,
    sent: Vec<SentOrder>,
    logins: Vec<u64>,
    permissive: bool,
}

/// Simulated trading terminal.
#[derive(Debug)]
pub struct PaperTerminal {
    state: Mutex<PaperState>,
}

impl Default for PaperTerminal {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperTerminal {
    /// Empty terminal: no symbols, every login accepted.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PaperState {
                next_ticket: FIRST_TICKET,
                ..Default::default()
            }),
        }
    }

    /// Terminal that quotes any unknown symbol at 1.0, for dry runs.
    pub fn permissive() -> Self {
        let mut terminal = Self::new();
        terminal.state.get_mut().permissive = true;
        terminal
    }

    fn rejection(retcode: u32, comment: &str) -> OrderResult {
        OrderResult {
            retcode,
            deal: 0,
            order: 0,
            volume: 0.0,
            price: 0.0,
            comment: comment.to_string(),
        }
    }
}

/// Scripting and inspection used by tests.
#[cfg(test)]
impl PaperTerminal {
    /// Add a tradeable symbol quoted at `bid`/`ask`.
    pub fn with_symbol(mut self, name: &str, bid: f64, ask: f64) -> Self {
        self.state.get_mut().symbols.insert(
            name.to_string(),
            PaperSymbol {
                visible: true,
                volume_min: DEFAULT_VOLUME_MIN,
                tick: Some(Tick { bid, ask }),
            },
        );
        self
    }

    /// Raise the broker-side minimum lot of an already added symbol.
    pub fn with_volume_min(mut self, name: &str, volume_min: f64) -> Self {
        if let Some(symbol) = self.state.get_mut().symbols.get_mut(name) {
            symbol.volume_min = volume_min;
        }
        self
    }

    /// Add a symbol that exists but is hidden until selected.
    pub fn with_hidden_symbol(mut self, name: &str, bid: f64, ask: f64) -> Self {
        self.state.get_mut().symbols.insert(
            name.to_string(),
            PaperSymbol {
                visible: false,
                volume_min: DEFAULT_VOLUME_MIN,
                tick: Some(Tick { bid, ask }),
            },
        );
        self
    }

    /// Make `initialize` fail for this login.
    pub fn with_refused_login(mut self, login: u64) -> Self {
        self.state.get_mut().refused.insert(login);
        self
    }

    /// Replace the open positions of an account.
    pub async fn set_positions(&self, login: u64, positions: Vec<Position>) {
        let mut state = self.state.lock().await;
        if let Some(max) = positions.iter().map(|p| p.ticket).max() {
            state.next_ticket = state.next_ticket.max(max + 1);
        }
        state.books.insert(login, positions);
    }

    pub async fn positions_of(&self, login: u64) -> Vec<Position> {
        let state = self.state.lock().await;
        state.books.get(&login).cloned().unwrap_or_default()
    }

    /// Answer the next order with `retcode` instead of filling it.
    pub async fn reject_next(&self, retcode: u32) {
        self.state.lock().await.replies.push_back(Reply::Retcode(retcode));
    }

    /// Give no reply at all to the next order.
    pub async fn drop_next_reply(&self) {
        self.state.lock().await.replies.push_back(Reply::Silent);
    }

    /// Every order received so far, in order.
    pub async fn sent_orders(&self) -> Vec<SentOrder> {
        self.state.lock().await.sent.clone()
    }

    /// Logins passed to `initialize`, in call order.
    pub async fn login_history(&self) -> Vec<u64> {
        self.state.lock().await.logins.clone()
    }

    pub async fn is_connected(&self) -> bool {
        self.state.lock().await.session.is_some()
    }
}

impl PaperState {
    fn quote(&self, symbol: &str) -> Option<Tick> {
        match self.symbols.get(symbol) {
            Some(s) => s.tick,
            None if self.permissive => Some(Tick { bid: 1.0, ask: 1.0 }),
            None => None,
        }
    }

    fn fill(&mut self, login: u64, request: &OrderRequest) -> OrderResult {
        let book = self.books.entry(login).or_default();

        if let Some(ticket) = request.position {
            let Some(index) = book.iter().position(|p| p.ticket == ticket) else {
                return PaperTerminal::rejection(RETCODE_INVALID, "Position not found");
            };
            let closed = book.remove(index);
            debug!(login = login, ticket = ticket, "Paper position closed");
            return OrderResult {
                retcode: RETCODE_DONE,
                deal: self.next_ticket,
                order: ticket,
                volume: closed.volume,
                price: request.price,
                comment: "Request executed".to_string(),
            };
        }

        let ticket = self.next_ticket;
        self.next_ticket += 1;
        book.push(Position {
            ticket,
            symbol: request.symbol.clone(),
            volume: request.volume,
            side: request.order_type,
            price_open: request.price,
            sl: request.sl,
            tp: request.tp,
        });
        debug!(login = login, ticket = ticket, symbol = %request.symbol, "Paper position opened");

        OrderResult {
            retcode: RETCODE_DONE,
            deal: ticket,
            order: ticket,
            volume: request.volume,
            price: request.price,
            comment: "Request executed".to_string(),
        }
    }
}

#[async_trait]
impl TradingTerminal for PaperTerminal {
    async fn initialize(&self, credentials: &Credentials) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.logins.push(credentials.login);
        if state.refused.contains(&credentials.login) {
            return Ok(false);
        }
        state.session = Some(credentials.login);
        Ok(true)
    }

    async fn symbol_info(&self, symbol: &str) -> Result<Option<SymbolInfo>> {
        let state = self.state.lock().await;
        let info = match state.symbols.get(symbol) {
            Some(s) => Some(SymbolInfo {
                visible: s.visible,
                volume_min: s.volume_min,
            }),
            None if state.permissive => Some(SymbolInfo {
                visible: true,
                volume_min: DEFAULT_VOLUME_MIN,
            }),
            None => None,
        };
        Ok(info)
    }

    async fn symbol_select(&self, symbol: &str, enable: bool) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.symbols.get_mut(symbol) {
            Some(s) => {
                s.visible = enable;
                Ok(true)
            }
            None => Ok(state.permissive),
        }
    }

    async fn symbol_info_tick(&self, symbol: &str) -> Result<Option<Tick>> {
        Ok(self.state.lock().await.quote(symbol))
    }

    async fn order_send(&self, request: &OrderRequest) -> Result<Option<OrderResult>> {
        let mut state = self.state.lock().await;
        let login = state
            .session
            .ok_or_else(|| anyhow!("order_send without an initialized account"))?;

        let sent = SentOrder {
            login,
            request: request.clone(),
        };
        debug!(
            login = sent.login,
            symbol = %sent.request.symbol,
            volume = sent.request.volume,
            "Paper order received"
        );
        state.sent.push(sent);

        match state.replies.pop_front() {
            Some(Reply::Silent) => Ok(None),
            Some(Reply::Retcode(code)) => Ok(Some(Self::rejection(code, "Scripted rejection"))),
            None => Ok(Some(state.fill(login, request))),
        }
    }

    async fn positions_get(&self, symbol: Option<&str>) -> Result<Vec<Position>> {
        let state = self.state.lock().await;
        let login = state
            .session
            .ok_or_else(|| anyhow!("positions_get without an initialized account"))?;

        let positions = state
            .books
            .get(&login)
            .map(|book| {
                book.iter()
                    .filter(|p| symbol.map_or(true, |s| p.symbol == s))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(positions)
    }

    async fn shutdown(&self) -> Result<()> {
        self.state.lock().await.session = None;
        Ok(())
    }
}
