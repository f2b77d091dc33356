use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::InstrumentKey;

/// Book side of a market data entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookSide {
    Bid,
    Offer,
}

impl fmt::Display for BookSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BookSide::Bid => write!(f, "BID"),
            BookSide::Offer => write!(f, "OFFER"),
        }
    }
}

/// Incremental update action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MdUpdateAction {
    New,
    Change,
    Delete,
}

/// One entry of a full-refresh snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MdEntry {
    pub side: BookSide,
    pub price: Decimal,
    pub quantity: Decimal,
    #[serde(default)]
    pub entry_id: Option<String>,
}

impl MdEntry {
    pub fn new(side: BookSide, price: Decimal, quantity: Decimal) -> Self {
        Self {
            side,
            price,
            quantity,
            entry_id: None,
        }
    }

    pub fn with_id(mut self, entry_id: impl Into<String>) -> Self {
        self.entry_id = Some(entry_id.into());
        self
    }
}

/// Full-refresh snapshot for one instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataSnapshot {
    #[serde(default)]
    pub md_req_id: Option<String>,
    pub instrument: InstrumentKey,
    pub entries: Vec<MdEntry>,
    #[serde(default)]
    pub rpt_seq: Option<u64>,
}

/// One entry of an incremental refresh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MdIncrement {
    pub action: MdUpdateAction,
    pub instrument: InstrumentKey,
    pub side: BookSide,
    pub price: Decimal,
    #[serde(default)]
    pub quantity: Decimal,
    #[serde(default)]
    pub entry_id: Option<String>,
    #[serde(default)]
    pub rpt_seq: Option<u64>,
}

impl MdIncrement {
    pub fn new(
        action: MdUpdateAction,
        instrument: InstrumentKey,
        side: BookSide,
        price: Decimal,
        quantity: Decimal,
    ) -> Self {
        Self {
            action,
            instrument,
            side,
            price,
            quantity,
            entry_id: None,
            rpt_seq: None,
        }
    }

    pub fn with_id(mut self, entry_id: impl Into<String>) -> Self {
        self.entry_id = Some(entry_id.into());
        self
    }

    pub fn with_seq(mut self, rpt_seq: u64) -> Self {
        self.rpt_seq = Some(rpt_seq);
        self
    }
}

/// Incremental refresh message; entries may span instruments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataIncremental {
    #[serde(default)]
    pub md_req_id: Option<String>,
    pub entries: Vec<MdIncrement>,
}

/// Price level as exposed to readers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }
}

/// Consistent point-in-time copy of one book
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub instrument: InstrumentKey,
    /// Best (highest) first
    pub bids: Vec<PriceLevel>,
    /// Best (lowest) first
    pub asks: Vec<PriceLevel>,
    pub version: u64,
    pub last_update: DateTime<Utc>,
}

impl BookSnapshot {
    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.first().copied()
    }

    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid.price + ask.price) / Decimal::TWO),
            _ => None,
        }
    }

    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask.price - bid.price),
            _ => None,
        }
    }

    /// Spread in basis points of mid
    pub fn spread_bps(&self) -> Option<Decimal> {
        let mid = self.mid_price()?;
        if mid.is_zero() {
            return None;
        }
        Some(self.spread()? / mid * Decimal::from(10_000))
    }

    pub fn is_two_sided(&self) -> bool {
        !self.bids.is_empty() && !self.asks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_book_snapshot_helpers() {
        let book = BookSnapshot {
            instrument: InstrumentKey::new("sim", "BTC-USD"),
            bids: vec![PriceLevel::new(dec!(99), dec!(5)), PriceLevel::new(dec!(98), dec!(1))],
            asks: vec![PriceLevel::new(dec!(101), dec!(3))],
            version: 1,
            last_update: Utc::now(),
        };

        assert_eq!(book.best_bid().unwrap().price, dec!(99));
        assert_eq!(book.best_ask().unwrap().price, dec!(101));
        assert_eq!(book.mid_price(), Some(dec!(100)));
        assert_eq!(book.spread(), Some(dec!(2)));
        assert_eq!(book.spread_bps(), Some(dec!(200)));
        assert!(book.is_two_sided());
    }

    #[test]
    fn test_one_sided_book() {
        let book = BookSnapshot {
            instrument: InstrumentKey::new("sim", "BTC-USD"),
            bids: vec![PriceLevel::new(dec!(99), dec!(5))],
            asks: vec![],
            version: 1,
            last_update: Utc::now(),
        };
        assert!(book.mid_price().is_none());
        assert!(!book.is_two_sided());
    }
}
