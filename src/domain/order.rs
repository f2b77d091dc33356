use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::InstrumentKey;
use crate::error::{FixflowError, Result};

/// Order side (buy or sell)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// +1 for buys, -1 for sells
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrdType {
    Market,
    Limit,
}

/// Time in force
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Day,
    /// Good Till Cancelled
    GTC,
    /// Immediate Or Cancel
    IOC,
}

/// Order status as tracked by the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    PendingNew,
    New,
    PartiallyFilled,
    Filled,
    PendingCancel,
    Canceled,
    PendingReplace,
    Replaced,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::PendingNew => "PENDING_NEW",
            OrderStatus::New => "NEW",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::PendingCancel => "PENDING_CANCEL",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::PendingReplace => "PENDING_REPLACE",
            OrderStatus::Replaced => "REPLACED",
            OrderStatus::Rejected => "REJECTED",
            OrderStatus::Expired => "EXPIRED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled
                | OrderStatus::Canceled
                | OrderStatus::Replaced
                | OrderStatus::Rejected
                | OrderStatus::Expired
        )
    }

    /// Accepted by the venue and not yet terminal
    pub fn is_working(&self) -> bool {
        matches!(
            self,
            OrderStatus::New
                | OrderStatus::PartiallyFilled
                | OrderStatus::PendingCancel
                | OrderStatus::PendingReplace
        )
    }

    /// Statuses from which a cancel or replace may be requested
    pub fn is_amendable(&self) -> bool {
        matches!(self, OrderStatus::New | OrderStatus::PartiallyFilled)
    }

    /// Order lifecycle edges. Self-edges cover repeated partial fills and
    /// fills that land while a cancel or replace is outstanding.
    pub fn can_transition_to(&self, target: OrderStatus) -> bool {
        use OrderStatus::*;

        match (self, target) {
            (s, _) if s.is_terminal() => false,

            (PendingNew, New | Rejected) => true,
            // Fill or venue cancel before the ack arrived
            (PendingNew, PartiallyFilled | Filled | Canceled | Expired) => true,

            (New | PartiallyFilled, PartiallyFilled | Filled) => true,
            (New | PartiallyFilled, PendingCancel | PendingReplace) => true,
            (New | PartiallyFilled, Canceled | Expired) => true,

            (PendingCancel, Canceled | Filled | Expired | PendingCancel) => true,
            (PendingCancel, New | PartiallyFilled) => true,

            (PendingReplace, Replaced | Filled | Canceled | Expired | PendingReplace) => true,
            (PendingReplace, New | PartiallyFilled) => true,

            _ => false,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Order request (what the strategy wants to do)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub instrument: InstrumentKey,
    pub side: Side,
    pub ord_type: OrdType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub time_in_force: TimeInForce,
}

impl OrderRequest {
    pub fn limit(instrument: InstrumentKey, side: Side, quantity: Decimal, price: Decimal) -> Self {
        Self {
            instrument,
            side,
            ord_type: OrdType::Limit,
            quantity,
            price: Some(price),
            time_in_force: TimeInForce::GTC,
        }
    }

    pub fn market(instrument: InstrumentKey, side: Side, quantity: Decimal) -> Self {
        Self {
            instrument,
            side,
            ord_type: OrdType::Market,
            quantity,
            price: None,
            time_in_force: TimeInForce::IOC,
        }
    }

    pub fn with_time_in_force(mut self, tif: TimeInForce) -> Self {
        self.time_in_force = tif;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.quantity <= Decimal::ZERO {
            return Err(FixflowError::Validation(format!(
                "order quantity must be positive, got {}",
                self.quantity
            )));
        }
        match (self.ord_type, self.price) {
            (OrdType::Limit, None) => Err(FixflowError::Validation(
                "limit order requires a price".to_string(),
            )),
            (OrdType::Limit, Some(px)) if px <= Decimal::ZERO => Err(FixflowError::Validation(
                format!("limit price must be positive, got {}", px),
            )),
            _ => Ok(()),
        }
    }
}

/// New terms for a cancel/replace
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplaceParams {
    pub quantity: Option<Decimal>,
    pub price: Option<Decimal>,
}

impl ReplaceParams {
    pub fn is_empty(&self) -> bool {
        self.quantity.is_none() && self.price.is_none()
    }
}

/// Returned to the caller when an order is handed to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderTicket {
    pub cl_ord_id: String,
}

/// Local view of an order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub cl_ord_id: String,
    /// Id of the order this one replaced
    pub orig_cl_ord_id: Option<String>,
    pub venue_order_id: Option<String>,
    pub instrument: InstrumentKey,
    pub side: Side,
    pub ord_type: OrdType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub cum_qty: Decimal,
    pub avg_px: Decimal,
    pub status: OrderStatus,
    /// Status restored if an outstanding cancel/replace is rejected
    pub pending_from: Option<OrderStatus>,
    pub text: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn from_request(cl_ord_id: impl Into<String>, request: &OrderRequest) -> Self {
        let now = Utc::now();
        Self {
            cl_ord_id: cl_ord_id.into(),
            orig_cl_ord_id: None,
            venue_order_id: None,
            instrument: request.instrument.clone(),
            side: request.side,
            ord_type: request.ord_type,
            quantity: request.quantity,
            price: request.price,
            cum_qty: Decimal::ZERO,
            avg_px: Decimal::ZERO,
            status: OrderStatus::PendingNew,
            pending_from: None,
            text: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn leaves_qty(&self) -> Decimal {
        (self.quantity - self.cum_qty).max(Decimal::ZERO)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Fold a fill into cumulative quantity and average price
    pub fn record_fill(&mut self, qty: Decimal, px: Decimal) {
        let new_cum = self.cum_qty + qty;
        if new_cum > Decimal::ZERO {
            self.avg_px = (self.avg_px * self.cum_qty + px * qty) / new_cum;
        }
        self.cum_qty = new_cum;
        self.updated_at = Utc::now();
    }
}
