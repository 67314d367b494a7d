//! Order placer: turns instructions into terminal market orders.
//!
//! Every public operation logs into the account, does its work and logs
//! out again, whatever the outcome. Only `RETCODE_DONE` counts as success
//! and nothing is retried here; a failed row is retried by the next poll
//! only if it is still pending.

use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::api::{
    Credentials, OrderFilling, OrderRequest, OrderResult, OrderTime, TradeAction, TradingTerminal,
};
use crate::models::{Account, OrderSide, PendingClose, PendingTrade, Position};

use super::{ExecutionError, WorkerConfig};

/// Floor `quantity` at `min` and round to `decimals` places.
pub fn normalize_volume(quantity: Decimal, min: Decimal, decimals: u32) -> Decimal {
    quantity.max(min).round_dp(decimals)
}

/// Submits market orders and closes on behalf of accounts.
pub struct OrderPlacer {
    terminal: Arc<dyn TradingTerminal>,
    config: WorkerConfig,
}

impl OrderPlacer {
    pub fn new(terminal: Arc<dyn TradingTerminal>, config: WorkerConfig) -> Self {
        Self { terminal, config }
    }

    /// Lot size actually submitted for a requested quantity. The floor is
    /// the larger of the configured minimum and the symbol's own minimum.
    pub fn volume_for(&self, quantity: Decimal, symbol_min: f64) -> Decimal {
        let symbol_min = Decimal::try_from(symbol_min).unwrap_or(Decimal::ZERO);
        normalize_volume(
            quantity,
            self.config.min_volume.max(symbol_min),
            self.config.volume_decimals,
        )
    }

    /// Place a queued trade on one account.
    pub async fn place_trade(
        &self,
        account: &Account,
        trade: &PendingTrade,
    ) -> Result<OrderResult, ExecutionError> {
        let Some(side) = trade.order_side() else {
            error!(login = account.login, side = %trade.side, "Unknown order side");
            return Err(ExecutionError::UnknownSide(trade.side.clone()));
        };
        self.connect(account).await?;
        let result = self
            .open_connected(
                account,
                &trade.instrument,
                trade.quantity,
                side,
                trade.sl,
                trade.tp,
                self.config.open_filling,
            )
            .await;
        self.disconnect(account).await;

        log_outcome(account, "Order", &trade.instrument, &result);
        result
    }

    /// Open a copy of a leader position on a follower.
    pub async fn copy_position(
        &self,
        account: &Account,
        position: &Position,
    ) -> Result<OrderResult, ExecutionError> {
        let quantity = Decimal::try_from(position.volume).map_err(anyhow::Error::from)?;

        self.connect(account).await?;
        let result = self
            .open_connected(
                account,
                &position.symbol,
                quantity,
                position.side,
                position.copied_sl(),
                position.copied_tp(),
                self.config.copy_filling,
            )
            .await;
        self.disconnect(account).await;

        log_outcome(account, "Copy", &position.symbol, &result);
        result
    }

    /// Close a queued position by ticket on one account.
    pub async fn close_position(
        &self,
        account: &Account,
        close: &PendingClose,
        ticket: &str,
    ) -> Result<OrderResult, ExecutionError> {
        let Some(side) = close.position_side() else {
            error!(login = account.login, side = %close.side, "Unknown position side");
            return Err(ExecutionError::UnknownSide(close.side.clone()));
        };
        let ticket = ticket
            .trim()
            .parse::<u64>()
            .map_err(|_| ExecutionError::InvalidTicket(ticket.to_string()))?;
        let volume = close.quantity.to_f64().unwrap_or(0.0);

        self.connect(account).await?;
        let result = self
            .close_connected(&close.instrument, ticket, volume, side)
            .await;
        self.disconnect(account).await;

        log_outcome(account, "Close", &close.instrument, &result);
        result
    }

    /// Close every position on `symbol` held on `side`. Matches by
    /// instrument and side because follower tickets differ from the
    /// leader's. Returns how many positions were closed.
    pub async fn close_matching(
        &self,
        account: &Account,
        symbol: &str,
        side: OrderSide,
    ) -> Result<usize, ExecutionError> {
        self.connect(account).await?;
        let result = self.close_matching_connected(account, symbol, side).await;
        self.disconnect(account).await;
        result
    }

    async fn close_matching_connected(
        &self,
        account: &Account,
        symbol: &str,
        side: OrderSide,
    ) -> Result<usize, ExecutionError> {
        let positions = self.terminal.positions_get(Some(symbol)).await?;
        let mut closed = 0;

        for position in positions.iter().filter(|p| p.side == side) {
            match self
                .close_connected(symbol, position.ticket, position.volume, side)
                .await
            {
                Ok(_) => {
                    info!(
                        login = account.login,
                        symbol = %symbol,
                        ticket = position.ticket,
                        volume = position.volume,
                        "Closed follower position"
                    );
                    closed += 1;
                }
                Err(e) => {
                    error!(
                        login = account.login,
                        ticket = position.ticket,
                        error = %e,
                        "Failed to close follower position"
                    );
                }
            }
        }

        Ok(closed)
    }

    async fn connect(&self, account: &Account) -> Result<(), ExecutionError> {
        let credentials = Credentials::from(account);
        if !self.terminal.initialize(&credentials).await? {
            error!(login = account.login, server = %account.server, "Failed to connect to terminal");
            return Err(ExecutionError::ConnectionFailed {
                login: account.login,
            });
        }
        Ok(())
    }

    async fn disconnect(&self, account: &Account) {
        if let Err(e) = self.terminal.shutdown().await {
            warn!(login = account.login, error = %e, "Terminal shutdown failed");
        }
    }

    /// Make sure `symbol` is selected for trading on the current account.
    /// Returns the symbol's minimum lot, 0 when the terminal reports none.
    async fn ensure_symbol(&self, account: &Account, symbol: &str) -> Result<f64, ExecutionError> {
        let info = self.terminal.symbol_info(symbol).await?;
        let volume_min = info.as_ref().map_or(0.0, |i| i.volume_min);
        if info.map_or(true, |i| !i.visible) && !self.terminal.symbol_select(symbol, true).await? {
            return Err(ExecutionError::SymbolUnavailable {
                symbol: symbol.to_string(),
                login: account.login,
            });
        }
        Ok(volume_min)
    }

    #[allow(clippy::too_many_arguments)]
    async fn open_connected(
        &self,
        account: &Account,
        symbol: &str,
        quantity: Decimal,
        side: OrderSide,
        sl: f64,
        tp: f64,
        filling: OrderFilling,
    ) -> Result<OrderResult, ExecutionError> {
        let symbol_min = self.ensure_symbol(account, symbol).await?;
        let volume = self.volume_for(quantity, symbol_min);

        let tick = self
            .terminal
            .symbol_info_tick(symbol)
            .await?
            .ok_or_else(|| ExecutionError::NoTick {
                symbol: symbol.to_string(),
            })?;

        let request = OrderRequest {
            action: TradeAction::Deal,
            symbol: symbol.to_string(),
            volume: volume.to_f64().unwrap_or(0.0),
            order_type: side,
            price: tick.entry_price(side),
            sl: sl.max(0.0),
            tp: tp.max(0.0),
            deviation: self.config.deviation,
            type_time: OrderTime::Gtc,
            type_filling: filling,
            position: None,
        };

        info!(
            login = account.login,
            side = %side,
            symbol = %symbol,
            volume = %volume,
            price = request.price,
            "Sending order"
        );

        self.submit(&request).await
    }

    async fn close_connected(
        &self,
        symbol: &str,
        ticket: u64,
        volume: f64,
        side: OrderSide,
    ) -> Result<OrderResult, ExecutionError> {
        let tick = self
            .terminal
            .symbol_info_tick(symbol)
            .await?
            .ok_or_else(|| ExecutionError::NoTick {
                symbol: symbol.to_string(),
            })?;

        let request = OrderRequest {
            action: TradeAction::Deal,
            symbol: symbol.to_string(),
            volume,
            order_type: side.opposite(),
            price: tick.exit_price(side),
            sl: 0.0,
            tp: 0.0,
            deviation: self.config.deviation,
            type_time: OrderTime::Gtc,
            type_filling: self.config.copy_filling,
            position: Some(ticket),
        };

        info!(symbol = %symbol, ticket = ticket, volume = volume, "Sending close order");

        self.submit(&request).await
    }

    async fn submit(&self, request: &OrderRequest) -> Result<OrderResult, ExecutionError> {
        debug!(request = ?request, "order_send");

        let result = self
            .terminal
            .order_send(request)
            .await?
            .ok_or(ExecutionError::NoResponse)?;

        if !result.is_done() {
            return Err(ExecutionError::Rejected {
                retcode: result.retcode,
                comment: result.comment,
            });
        }
        Ok(result)
    }
}

fn log_outcome(
    account: &Account,
    what: &str,
    symbol: &str,
    result: &Result<OrderResult, ExecutionError>,
) {
    match result {
        Ok(r) => info!(
            login = account.login,
            symbol = %symbol,
            ticket = r.order,
            deal = r.deal,
            volume = r.volume,
            price = r.price,
            "{} executed",
            what
        ),
        Err(e) => error!(
            login = account.login,
            symbol = %symbol,
            retcode = ?e.retcode(),
            error = %e,
            "{} failed",
            what
        ),
    }
}
