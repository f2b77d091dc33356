//! Core strategy trait and the context handed to every callback.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;

use crate::domain::{
    BookSnapshot, InstrumentKey, Order, OrderRequest, OrderTicket, Position, ReplaceParams,
    RoundingDirection, Security,
};
use crate::error::Result;
use crate::session::SessionGateway;

/// What a main trading loop pass asks the runner to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    /// Strategy is done; the runner moves to Stopping
    Complete,
}

/// Trait every strategy implements.
///
/// Callbacks run on the runner's task, never on the engine thread. Errors
/// from the notification callbacks are logged and the run continues; an
/// error from `main_trading_loop` ends the run.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    /// Reference data, books and snapshots are in place
    async fn on_ready(&mut self, _ctx: &StrategyContext) -> Result<()> {
        Ok(())
    }

    async fn on_order_update(&mut self, _ctx: &StrategyContext, _order: &Order) -> Result<()> {
        Ok(())
    }

    async fn on_position_update(&mut self, _ctx: &StrategyContext, _position: &Position) -> Result<()> {
        Ok(())
    }

    async fn on_book_update(&mut self, _ctx: &StrategyContext, _instrument: &InstrumentKey) -> Result<()> {
        Ok(())
    }

    /// One pass of the main trading loop, run at the configured interval
    async fn main_trading_loop(&mut self, ctx: &StrategyContext) -> Result<LoopControl>;

    async fn on_stop(&mut self, _ctx: &StrategyContext) -> Result<()> {
        Ok(())
    }
}

/// Strategy-facing handle on the session
#[derive(Clone)]
pub struct StrategyContext {
    gateway: Arc<SessionGateway>,
    trading: Vec<InstrumentKey>,
}

impl StrategyContext {
    pub fn new(gateway: Arc<SessionGateway>, trading: Vec<InstrumentKey>) -> Self {
        Self { gateway, trading }
    }

    pub fn gateway(&self) -> &Arc<SessionGateway> {
        &self.gateway
    }

    /// Instruments the strategy is configured to trade
    pub fn trading_instruments(&self) -> &[InstrumentKey] {
        &self.trading
    }

    pub fn send_order(&self, request: &OrderRequest) -> Result<OrderTicket> {
        self.gateway.send_order(request)
    }

    pub fn cancel_order(&self, cl_ord_id: &str) -> Result<String> {
        self.gateway.cancel_order(cl_ord_id)
    }

    pub fn replace_order(&self, cl_ord_id: &str, params: ReplaceParams) -> Result<String> {
        self.gateway.replace_order(cl_ord_id, params)
    }

    pub fn book(&self, instrument: &InstrumentKey) -> Option<BookSnapshot> {
        self.gateway.book(instrument)
    }

    pub fn position(&self, instrument: &InstrumentKey) -> Option<Position> {
        self.gateway.ledger().position(instrument)
    }

    pub fn working_orders(&self) -> Vec<Order> {
        self.gateway.ledger().working_orders()
    }

    pub fn order(&self, cl_ord_id: &str) -> Option<Order> {
        self.gateway.ledger().order(cl_ord_id)
    }

    pub fn security(&self, instrument: &InstrumentKey) -> Option<Security> {
        self.gateway.security(instrument)
    }

    /// Round to the instrument's tick. None when the security list did not
    /// carry a usable tick for it.
    pub fn round_price(
        &self,
        instrument: &InstrumentKey,
        price: Decimal,
        direction: RoundingDirection,
    ) -> Option<Decimal> {
        let tick = self
            .security(instrument)
            .map(|s| s.min_price_increment)
            .filter(|tick| *tick > Decimal::ZERO)?;
        Some(crate::domain::round_to_tick(price, tick, direction))
    }
}
