//! Random trading strategy
//!
//! Sends small orders on a fixed cadence, alternating or randomizing the
//! side, across the configured instruments. Useful for exercising a venue
//! session end to end; it has no view on price.

use async_trait::async_trait;
use rand::Rng;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::rate_limit::SlidingWindowLimiter;
use super::traits::{LoopControl, Strategy, StrategyContext};
use crate::config::{RandomStrategyConfig, SymbolSelection, TradingDirection, TradingMode};
use crate::domain::{
    BookSnapshot, InstrumentKey, Order, OrderRequest, OrderStatus, RoundingDirection, Side,
};
use crate::error::Result;

/// One pip as a fraction of price
const PIP: Decimal = dec!(0.0001);

#[derive(Debug, Default, Clone, Copy)]
pub struct RandomStrategyStats {
    pub steps: u64,
    pub orders_sent: u64,
    pub orders_skipped: u64,
    pub rate_limited: u64,
    pub fills: u64,
    pub rejects: u64,
}

pub struct RandomStrategy {
    config: RandomStrategyConfig,
    limiter: SlidingWindowLimiter,
    direction: Side,
    next_index: usize,
    started: Option<Instant>,
    last_step: Option<Instant>,
    stats: RandomStrategyStats,
}

impl RandomStrategy {
    pub fn new(config: RandomStrategyConfig) -> Self {
        let limiter = SlidingWindowLimiter::new(
            config.max_orders_per_window,
            Duration::from_millis(config.rate_window_ms),
        );
        Self {
            direction: config.initial_direction,
            config,
            limiter,
            next_index: 0,
            started: None,
            last_step: None,
            stats: RandomStrategyStats::default(),
        }
    }

    pub fn stats(&self) -> RandomStrategyStats {
        self.stats
    }

    fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.config.run_timeout_secs)
    }

    fn trade_interval(&self) -> Duration {
        Duration::from_millis(self.config.trade_interval_ms)
    }

    /// Side for the coming step
    fn next_side(&mut self) -> Side {
        match self.config.trading_direction {
            TradingDirection::Random => {
                if rand::thread_rng().gen_bool(0.5) {
                    Side::Buy
                } else {
                    Side::Sell
                }
            }
            TradingDirection::Alternate => {
                let side = self.direction;
                self.direction = side.opposite();
                side
            }
        }
    }

    /// Instruments traded this step
    fn select_instruments(&mut self, trading: &[InstrumentKey]) -> Vec<InstrumentKey> {
        if trading.is_empty() {
            return Vec::new();
        }
        match self.config.symbol_selection {
            SymbolSelection::AllAtOnce => trading.to_vec(),
            SymbolSelection::OneByOne => {
                let key = trading[self.next_index % trading.len()].clone();
                self.next_index = (self.next_index + 1) % trading.len();
                vec![key]
            }
        }
    }

    /// Limit price through the opposite side of the book, before tick
    /// rounding. Rounds back toward the touch. None when the book is
    /// one-sided.
    fn aggressive_price(&self, book: &BookSnapshot, side: Side) -> Option<(Decimal, RoundingDirection)> {
        if !book.is_two_sided() {
            return None;
        }
        let offset = PIP * self.config.aggressiveness_pips;
        match side {
            Side::Buy => book
                .best_ask()
                .map(|ask| (ask.price * (Decimal::ONE + offset), RoundingDirection::Down)),
            Side::Sell => book
                .best_bid()
                .map(|bid| (bid.price * (Decimal::ONE - offset), RoundingDirection::Up)),
        }
    }

    fn build_request(
        &self,
        ctx: &StrategyContext,
        instrument: &InstrumentKey,
        side: Side,
    ) -> Option<OrderRequest> {
        let book = ctx.book(instrument)?;
        match self.config.trading_mode {
            TradingMode::MarketOrders => {
                book.mid_price()?;
                Some(OrderRequest::market(instrument.clone(), side, self.config.quantity))
            }
            TradingMode::AggressiveLimitOrders => {
                let (raw, rounding) = self.aggressive_price(&book, side)?;
                // No tick from the security list, no price
                let price = ctx.round_price(instrument, raw, rounding)?;
                Some(OrderRequest::limit(
                    instrument.clone(),
                    side,
                    self.config.quantity,
                    price,
                ))
            }
        }
    }

    fn trade_step(&mut self, ctx: &StrategyContext) {
        self.stats.steps += 1;
        let side = self.next_side();

        for instrument in self.select_instruments(ctx.trading_instruments()) {
            let Some(request) = self.build_request(ctx, &instrument, side) else {
                debug!(instrument = %instrument, "No usable book or tick, skipping");
                self.stats.orders_skipped += 1;
                continue;
            };
            if !self.limiter.try_acquire() {
                warn!(instrument = %instrument, "Order rate limit reached, skipping");
                self.stats.rate_limited += 1;
                continue;
            }
            match ctx.send_order(&request) {
                Ok(ticket) => {
                    self.stats.orders_sent += 1;
                    debug!(cl_ord_id = %ticket.cl_ord_id, instrument = %instrument, side = %side, "Random order placed");
                }
                Err(e) => warn!(instrument = %instrument, error = %e, "Random order failed"),
            }
        }
    }
}

#[async_trait]
impl Strategy for RandomStrategy {
    fn name(&self) -> &str {
        "random"
    }

    async fn on_ready(&mut self, ctx: &StrategyContext) -> Result<()> {
        self.started = Some(Instant::now());
        info!(
            instruments = ctx.trading_instruments().len(),
            mode = ?self.config.trading_mode,
            direction = ?self.config.trading_direction,
            run_timeout_secs = self.config.run_timeout_secs,
            working_orders = ctx.working_orders().len(),
            "Random strategy ready"
        );
        Ok(())
    }

    async fn on_order_update(&mut self, _ctx: &StrategyContext, order: &Order) -> Result<()> {
        match order.status {
            OrderStatus::Filled | OrderStatus::PartiallyFilled => {
                self.stats.fills += 1;
                info!(
                    cl_ord_id = %order.cl_ord_id,
                    instrument = %order.instrument,
                    side = %order.side,
                    cum_qty = %order.cum_qty,
                    avg_px = %order.avg_px,
                    "Fill"
                );
            }
            OrderStatus::Rejected => {
                self.stats.rejects += 1;
                warn!(cl_ord_id = %order.cl_ord_id, reason = ?order.text, "Order rejected");
            }
            _ => {}
        }
        Ok(())
    }

    async fn main_trading_loop(&mut self, ctx: &StrategyContext) -> Result<LoopControl> {
        let now = Instant::now();
        let started = *self.started.get_or_insert(now);
        if now.duration_since(started) >= self.run_timeout() {
            info!(steps = self.stats.steps, "Run timeout reached");
            return Ok(LoopControl::Complete);
        }

        let due = self
            .last_step
            .map_or(true, |last| now.duration_since(last) >= self.trade_interval());
        if due {
            self.last_step = Some(now);
            self.trade_step(ctx);
        }
        Ok(LoopControl::Continue)
    }

    async fn on_stop(&mut self, ctx: &StrategyContext) -> Result<()> {
        let s = self.stats;
        info!(
            steps = s.steps,
            orders_sent = s.orders_sent,
            skipped = s.orders_skipped,
            rate_limited = s.rate_limited,
            fills = s.fills,
            rejects = s.rejects,
            open_orders = ctx.working_orders().len(),
            "Random strategy stopped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BookSide, InstrumentTable, MarketDataSnapshot, MdEntry, PriceLevel, Security};
    use crate::session::engine::MockProtocolEngine;
    use crate::session::{GatewaySettings, SessionGateway};
    use crate::signing::{AuthMethod, LogonAuthenticator, SecretString};
    use chrono::Utc;
    use std::sync::Arc;

    fn book(bid: Option<Decimal>, ask: Option<Decimal>) -> BookSnapshot {
        BookSnapshot {
            instrument: InstrumentKey::new("sim", "BTC-USD"),
            bids: bid.map(|p| vec![PriceLevel::new(p, dec!(1))]).unwrap_or_default(),
            asks: ask.map(|p| vec![PriceLevel::new(p, dec!(1))]).unwrap_or_default(),
            version: 1,
            last_update: Utc::now(),
        }
    }

    #[test]
    fn test_alternating_direction() {
        let mut strategy = RandomStrategy::new(RandomStrategyConfig {
            initial_direction: Side::Sell,
            trading_direction: TradingDirection::Alternate,
            ..Default::default()
        });
        let sides: Vec<Side> = (0..4).map(|_| strategy.next_side()).collect();
        assert_eq!(sides, vec![Side::Sell, Side::Buy, Side::Sell, Side::Buy]);
    }

    #[test]
    fn test_one_by_one_round_robin() {
        let mut strategy = RandomStrategy::new(RandomStrategyConfig {
            symbol_selection: SymbolSelection::OneByOne,
            ..Default::default()
        });
        let keys = vec![InstrumentKey::new("sim", "A"), InstrumentKey::new("sim", "B")];

        let picked: Vec<String> = (0..3)
            .flat_map(|_| strategy.select_instruments(&keys))
            .map(|k| k.symbol)
            .collect();
        assert_eq!(picked, vec!["A", "B", "A"]);
    }

    #[test]
    fn test_all_at_once_selection() {
        let mut strategy = RandomStrategy::new(RandomStrategyConfig::default());
        let keys = vec![InstrumentKey::new("sim", "A"), InstrumentKey::new("sim", "B")];
        assert_eq!(strategy.select_instruments(&keys).len(), 2);
        assert!(strategy.select_instruments(&[]).is_empty());
    }

    #[test]
    fn test_aggressive_price_crosses_book() {
        let strategy = RandomStrategy::new(RandomStrategyConfig {
            aggressiveness_pips: dec!(2),
            ..Default::default()
        });
        let book = book(Some(dec!(100)), Some(dec!(101)));

        let (buy, dir) = strategy.aggressive_price(&book, Side::Buy).unwrap();
        assert_eq!(buy, dec!(101.0202));
        assert_eq!(dir, RoundingDirection::Down);

        let (sell, dir) = strategy.aggressive_price(&book, Side::Sell).unwrap();
        assert_eq!(sell, dec!(99.98));
        assert_eq!(dir, RoundingDirection::Up);
    }

    #[test]
    fn test_one_sided_book_has_no_aggressive_price() {
        let strategy = RandomStrategy::new(RandomStrategyConfig::default());
        assert!(strategy
            .aggressive_price(&book(Some(dec!(100)), None), Side::Sell)
            .is_none());
        assert!(strategy
            .aggressive_price(&book(None, Some(dec!(101))), Side::Buy)
            .is_none());
    }

    /// Context over a gateway holding a 100/101 book for BTC-USD and a
    /// security entry with the given tick
    fn context_with_tick(tick: Decimal) -> StrategyContext {
        let key = InstrumentKey::new("sim", "BTC-USD");
        let auth = LogonAuthenticator::new(AuthMethod::Password, "trader", SecretString::new("secret"));
        let (gateway, _rx) =
            SessionGateway::new(GatewaySettings::default(), auth, Arc::new(MockProtocolEngine::new()));
        gateway.install_instruments(InstrumentTable::from_securities(vec![Security::new(key.clone(), tick)]));
        gateway.books().apply_snapshot(&MarketDataSnapshot {
            md_req_id: None,
            instrument: key.clone(),
            entries: vec![
                MdEntry::new(BookSide::Bid, dec!(100), dec!(1)),
                MdEntry::new(BookSide::Offer, dec!(101), dec!(1)),
            ],
            rpt_seq: None,
        });
        StrategyContext::new(gateway, vec![key])
    }

    #[test]
    fn test_limit_price_rounds_toward_touch() {
        let strategy = RandomStrategy::new(RandomStrategyConfig {
            aggressiveness_pips: dec!(2),
            ..Default::default()
        });
        let ctx = context_with_tick(dec!(0.01));
        let key = InstrumentKey::new("sim", "BTC-USD");

        let buy = strategy.build_request(&ctx, &key, Side::Buy).unwrap();
        assert_eq!(buy.price, Some(dec!(101.02)));
        let sell = strategy.build_request(&ctx, &key, Side::Sell).unwrap();
        assert_eq!(sell.price, Some(dec!(99.98)));
    }

    #[test]
    fn test_no_tick_means_no_order() {
        let strategy = RandomStrategy::new(RandomStrategyConfig::default());
        let ctx = context_with_tick(Decimal::ZERO);
        let key = InstrumentKey::new("sim", "BTC-USD");

        assert!(strategy.build_request(&ctx, &key, Side::Buy).is_none());
        assert!(strategy.build_request(&ctx, &key, Side::Sell).is_none());
    }
}
