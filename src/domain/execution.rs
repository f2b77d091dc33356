use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{InstrumentKey, OrderStatus, Side};

/// What an execution report announces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecType {
    New,
    Trade,
    Canceled,
    Replaced,
    PendingNew,
    PendingCancel,
    PendingReplace,
    Rejected,
    Expired,
    Restated,
    /// Response to an order mass status request
    OrderStatus,
}

impl fmt::Display for ExecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecType::New => "NEW",
            ExecType::Trade => "TRADE",
            ExecType::Canceled => "CANCELED",
            ExecType::Replaced => "REPLACED",
            ExecType::PendingNew => "PENDING_NEW",
            ExecType::PendingCancel => "PENDING_CANCEL",
            ExecType::PendingReplace => "PENDING_REPLACE",
            ExecType::Rejected => "REJECTED",
            ExecType::Expired => "EXPIRED",
            ExecType::Restated => "RESTATED",
            ExecType::OrderStatus => "ORDER_STATUS",
        };
        write!(f, "{}", s)
    }
}

/// Inbound execution report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub exec_id: String,
    pub exec_type: ExecType,
    pub ord_status: OrderStatus,
    #[serde(default)]
    pub cl_ord_id: Option<String>,
    #[serde(default)]
    pub orig_cl_ord_id: Option<String>,
    #[serde(default)]
    pub venue_order_id: Option<String>,
    pub instrument: InstrumentKey,
    pub side: Side,
    pub order_qty: Decimal,
    #[serde(default)]
    pub price: Option<Decimal>,
    #[serde(default)]
    pub last_qty: Decimal,
    #[serde(default)]
    pub last_px: Decimal,
    #[serde(default)]
    pub cum_qty: Decimal,
    #[serde(default)]
    pub avg_px: Decimal,
    #[serde(default)]
    pub leaves_qty: Decimal,
    #[serde(default)]
    pub text: Option<String>,
    /// Set on responses to an order mass status request
    #[serde(default)]
    pub mass_status_req_id: Option<String>,
    #[serde(default)]
    pub tot_num_reports: Option<u32>,
    #[serde(default)]
    pub last_rpt_requested: bool,
    pub transact_time: DateTime<Utc>,
}

impl ExecutionReport {
    /// Carries a fill that should move cumulative quantity and position
    pub fn is_fill(&self) -> bool {
        self.exec_type == ExecType::Trade && self.last_qty > Decimal::ZERO
    }

    /// Mass status answer meaning the venue has no working orders
    pub fn is_empty_status_response(&self) -> bool {
        self.exec_type == ExecType::OrderStatus && self.ord_status == OrderStatus::Rejected
    }

    /// The identifiers a report can be matched on, in lookup order
    pub fn reference(&self) -> String {
        self.cl_ord_id
            .as_deref()
            .or(self.orig_cl_ord_id.as_deref())
            .or(self.venue_order_id.as_deref())
            .unwrap_or("<none>")
            .to_string()
    }
}

/// Which request an order cancel reject answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelRejectResponseTo {
    Cancel,
    Replace,
}

/// Venue refusal of a cancel or cancel/replace request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCancelReject {
    /// Id of the cancel/replace request
    pub cl_ord_id: String,
    /// Id of the order the request targeted
    pub orig_cl_ord_id: Option<String>,
    pub venue_order_id: Option<String>,
    pub response_to: CancelRejectResponseTo,
    pub ord_status: Option<OrderStatus>,
    pub text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn report(exec_type: ExecType, last_qty: Decimal) -> ExecutionReport {
        ExecutionReport {
            exec_id: "E1".into(),
            exec_type,
            ord_status: OrderStatus::PartiallyFilled,
            cl_ord_id: Some("c1".into()),
            orig_cl_ord_id: None,
            venue_order_id: Some("V1".into()),
            instrument: InstrumentKey::new("sim", "BTC-USD"),
            side: Side::Buy,
            order_qty: dec!(10),
            price: Some(dec!(100)),
            last_qty,
            last_px: dec!(100),
            cum_qty: last_qty,
            avg_px: dec!(100),
            leaves_qty: dec!(10) - last_qty,
            text: None,
            mass_status_req_id: None,
            tot_num_reports: None,
            last_rpt_requested: false,
            transact_time: Utc::now(),
        }
    }

    #[test]
    fn test_is_fill() {
        assert!(report(ExecType::Trade, dec!(4)).is_fill());
        assert!(!report(ExecType::Trade, dec!(0)).is_fill());
        assert!(!report(ExecType::New, dec!(4)).is_fill());
    }

    #[test]
    fn test_reference_prefers_client_id() {
        let mut r = report(ExecType::New, dec!(0));
        assert_eq!(r.reference(), "c1");
        r.cl_ord_id = None;
        assert_eq!(r.reference(), "V1");
    }
}
