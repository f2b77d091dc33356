use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Venue-qualified instrument identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstrumentKey {
    pub exchange: String,
    pub symbol: String,
}

impl InstrumentKey {
    pub fn new(exchange: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            symbol: symbol.into(),
        }
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.symbol)
    }
}

/// Direction used when snapping a price to the tick grid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundingDirection {
    Up,
    Down,
}

/// Security list entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Security {
    pub key: InstrumentKey,
    pub min_price_increment: Decimal,
    #[serde(default)]
    pub min_trade_vol: Option<Decimal>,
    #[serde(default)]
    pub max_trade_vol: Option<Decimal>,
    #[serde(default)]
    pub base_currency: Option<String>,
    #[serde(default)]
    pub quote_currency: Option<String>,
}

impl Security {
    pub fn new(key: InstrumentKey, min_price_increment: Decimal) -> Self {
        Self {
            key,
            min_price_increment,
            min_trade_vol: None,
            max_trade_vol: None,
            base_currency: None,
            quote_currency: None,
        }
    }

    pub fn with_currencies(mut self, base: impl Into<String>, quote: impl Into<String>) -> Self {
        self.base_currency = Some(base.into());
        self.quote_currency = Some(quote.into());
        self
    }

    /// Snap a price onto this security's tick grid
    pub fn round_to_tick(&self, price: Decimal, direction: RoundingDirection) -> Decimal {
        round_to_tick(price, self.min_price_increment, direction)
    }

    /// (base, quote) when both are known
    pub fn currencies(&self) -> Option<(String, String)> {
        match (&self.base_currency, &self.quote_currency) {
            (Some(base), Some(quote)) => Some((base.clone(), quote.clone())),
            _ => None,
        }
    }
}

pub fn round_to_tick(price: Decimal, tick: Decimal, direction: RoundingDirection) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    let steps = price / tick;
    let steps = match direction {
        RoundingDirection::Up => steps.ceil(),
        RoundingDirection::Down => steps.floor(),
    };
    (steps * tick).normalize()
}

/// Instrument metadata built from the security list
#[derive(Debug, Clone, Default)]
pub struct InstrumentTable {
    securities: HashMap<InstrumentKey, Security>,
}

impl InstrumentTable {
    pub fn from_securities(securities: impl IntoIterator<Item = Security>) -> Self {
        Self {
            securities: securities
                .into_iter()
                .map(|s| (s.key.clone(), s))
                .collect(),
        }
    }

    pub fn get(&self, key: &InstrumentKey) -> Option<&Security> {
        self.securities.get(key)
    }

    pub fn contains(&self, key: &InstrumentKey) -> bool {
        self.securities.contains_key(key)
    }

    /// Requested keys absent from the table
    pub fn missing<'a>(&self, keys: impl IntoIterator<Item = &'a InstrumentKey>) -> Vec<InstrumentKey> {
        keys.into_iter()
            .filter(|k| !self.contains(k))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.securities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.securities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Security> {
        self.securities.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_round_to_tick() {
        assert_eq!(round_to_tick(dec!(100.37), dec!(0.1), RoundingDirection::Down), dec!(100.3));
        assert_eq!(round_to_tick(dec!(100.37), dec!(0.1), RoundingDirection::Up), dec!(100.4));
        assert_eq!(round_to_tick(dec!(100.4), dec!(0.1), RoundingDirection::Up), dec!(100.4));
        assert_eq!(round_to_tick(dec!(27013), dec!(5), RoundingDirection::Down), dec!(27010));
        // Zero tick leaves the price alone
        assert_eq!(round_to_tick(dec!(1.2345), dec!(0), RoundingDirection::Up), dec!(1.2345));
    }

    #[test]
    fn test_instrument_table_missing() {
        let btc = InstrumentKey::new("deribit", "BTC-PERPETUAL");
        let eth = InstrumentKey::new("deribit", "ETH-PERPETUAL");
        let table = InstrumentTable::from_securities(vec![Security::new(btc.clone(), dec!(0.5))]);

        assert!(table.contains(&btc));
        assert_eq!(table.missing([&btc, &eth]), vec![eth]);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_display() {
        assert_eq!(InstrumentKey::new("binance", "BTCUSDT").to_string(), "binance:BTCUSDT");
    }
}
