use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::{InstrumentKey, Side};

/// Net position in one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub instrument: InstrumentKey,
    /// Signed: positive long, negative short
    pub quantity: Decimal,
    pub avg_price: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    pub fn flat(instrument: InstrumentKey) -> Self {
        Self {
            instrument,
            quantity: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            updated_at: Utc::now(),
        }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }

    /// Apply a fill with weighted-average cost.
    ///
    /// Increasing |qty| re-weights the average, reducing it keeps the average,
    /// and crossing through zero starts a fresh average at the fill price.
    pub fn apply_fill(&mut self, side: Side, qty: Decimal, px: Decimal) {
        let signed = side.sign() * qty;
        let old_qty = self.quantity;
        let new_qty = old_qty + signed;

        let same_direction = old_qty.is_zero() || (old_qty.is_sign_positive() == signed.is_sign_positive());

        if same_direction {
            if !new_qty.is_zero() {
                self.avg_price = (self.avg_price * old_qty.abs() + px * qty) / new_qty.abs();
            }
        } else if new_qty.is_zero() {
            self.avg_price = Decimal::ZERO;
        } else if new_qty.is_sign_positive() != old_qty.is_sign_positive() {
            self.avg_price = px;
        }

        self.quantity = new_qty;
        self.updated_at = Utc::now();
    }
}

/// Result of a request for positions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionRequestResult {
    Valid,
    NoPositions,
    Rejected,
}

/// Acknowledgement of a request for positions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestForPositionsAck {
    pub pos_req_id: String,
    pub result: PositionRequestResult,
    #[serde(default)]
    pub total_reports: u32,
    #[serde(default)]
    pub text: Option<String>,
}

/// One position report; either an instrument position or a wallet balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionReport {
    #[serde(default)]
    pub pos_req_id: Option<String>,
    #[serde(default)]
    pub instrument: Option<InstrumentKey>,
    #[serde(default)]
    pub currency: Option<String>,
    pub quantity: Decimal,
    #[serde(default)]
    pub avg_price: Option<Decimal>,
    #[serde(default)]
    pub total_reports: Option<u32>,
    #[serde(default)]
    pub last_report: bool,
}

impl PositionReport {
    pub fn instrument(instrument: InstrumentKey, quantity: Decimal, avg_price: Decimal) -> Self {
        Self {
            pos_req_id: None,
            instrument: Some(instrument),
            currency: None,
            quantity,
            avg_price: Some(avg_price),
            total_reports: None,
            last_report: false,
        }
    }

    pub fn balance(currency: impl Into<String>, quantity: Decimal) -> Self {
        Self {
            pos_req_id: None,
            instrument: None,
            currency: Some(currency.into()),
            quantity,
            avg_price: None,
            total_reports: None,
            last_report: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn pos() -> Position {
        Position::flat(InstrumentKey::new("sim", "BTC-USD"))
    }

    #[test]
    fn test_weighted_average_on_increase() {
        let mut p = pos();
        p.apply_fill(Side::Buy, dec!(4), dec!(100));
        p.apply_fill(Side::Buy, dec!(6), dec!(110));

        assert_eq!(p.quantity, dec!(10));
        assert_eq!(p.avg_price, dec!(106));
    }

    #[test]
    fn test_average_unchanged_on_decrease() {
        let mut p = pos();
        p.apply_fill(Side::Buy, dec!(10), dec!(100));
        p.apply_fill(Side::Sell, dec!(3), dec!(120));

        assert_eq!(p.quantity, dec!(7));
        assert_eq!(p.avg_price, dec!(100));
    }

    #[test]
    fn test_flip_starts_new_average() {
        let mut p = pos();
        p.apply_fill(Side::Buy, dec!(2), dec!(100));
        p.apply_fill(Side::Sell, dec!(5), dec!(90));

        assert_eq!(p.quantity, dec!(-3));
        assert_eq!(p.avg_price, dec!(90));
    }

    #[test]
    fn test_close_to_flat() {
        let mut p = pos();
        p.apply_fill(Side::Sell, dec!(2), dec!(100));
        p.apply_fill(Side::Buy, dec!(2), dec!(95));

        assert!(p.is_flat());
        assert_eq!(p.avg_price, dec!(0));
    }

    #[test]
    fn test_short_averages() {
        let mut p = pos();
        p.apply_fill(Side::Sell, dec!(1), dec!(100));
        p.apply_fill(Side::Sell, dec!(1), dec!(102));

        assert_eq!(p.quantity, dec!(-2));
        assert_eq!(p.avg_price, dec!(101));
    }
}
