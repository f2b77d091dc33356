//! Typed view of the messages exchanged with the protocol engine.
//!
//! Wire encoding is the engine's job. Admin messages stay a tag/value map
//! because logon augmentation edits raw fields; application messages arrive
//! already decoded.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::{
    ExecutionReport, InstrumentKey, MarketDataIncremental, MarketDataSnapshot, OrdType,
    OrderCancelReject, OrderRequest, PositionReport, RequestForPositionsAck, Security, Side,
};

pub mod tags {
    pub const ACCOUNT: u32 = 1;
    pub const REF_SEQ_NUM: u32 = 45;
    pub const TEXT: u32 = 58;
    pub const RAW_DATA_LENGTH: u32 = 95;
    pub const RAW_DATA: u32 = 96;
    pub const HEART_BT_INT: u32 = 108;
    pub const RESET_SEQ_NUM_FLAG: u32 = 141;
    pub const SESSION_REJECT_REASON: u32 = 373;
    pub const USERNAME: u32 = 553;
    pub const PASSWORD: u32 = 554;
}

pub mod msg_type {
    pub const HEARTBEAT: &str = "0";
    pub const TEST_REQUEST: &str = "1";
    pub const REJECT: &str = "3";
    pub const LOGOUT: &str = "5";
    pub const LOGON: &str = "A";
}

/// Session-level message as a raw tag/value map
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixMessage {
    pub msg_type: String,
    fields: BTreeMap<u32, String>,
}

impl FixMessage {
    pub fn new(msg_type: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn logon(heartbeat_secs: u32) -> Self {
        let mut msg = Self::new(msg_type::LOGON);
        msg.set(tags::HEART_BT_INT, heartbeat_secs.to_string());
        msg
    }

    pub fn logout(text: Option<&str>) -> Self {
        let mut msg = Self::new(msg_type::LOGOUT);
        if let Some(text) = text {
            msg.set(tags::TEXT, text);
        }
        msg
    }

    pub fn is_logon(&self) -> bool {
        self.msg_type == msg_type::LOGON
    }

    pub fn is_logout(&self) -> bool {
        self.msg_type == msg_type::LOGOUT
    }

    pub fn is_reject(&self) -> bool {
        self.msg_type == msg_type::REJECT
    }

    pub fn set(&mut self, tag: u32, value: impl Into<String>) {
        self.fields.insert(tag, value.into());
    }

    pub fn get(&self, tag: u32) -> Option<&str> {
        self.fields.get(&tag).map(String::as_str)
    }

    pub fn remove(&mut self, tag: u32) -> Option<String> {
        self.fields.remove(&tag)
    }

    pub fn fields(&self) -> impl Iterator<Item = (u32, &str)> {
        self.fields.iter().map(|(t, v)| (*t, v.as_str()))
    }
}

/// Which way an admin message is travelling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    /// About to be sent; the application may still edit it
    Outbound,
}

/// Session lifecycle callbacks from the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Logon,
    Logout,
    Disconnect,
}

/// One fragment of a security list response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityListFragment {
    pub security_req_id: String,
    pub securities: Vec<Security>,
    pub last_fragment: bool,
}

/// Response to an order mass cancel request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MassCancelReport {
    pub mass_cancel_req_id: String,
    #[serde(default)]
    pub instrument: Option<InstrumentKey>,
    pub accepted: bool,
    #[serde(default)]
    pub total_affected: u32,
    #[serde(default)]
    pub text: Option<String>,
}

/// Business-level reject of an application message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessReject {
    pub ref_msg_type: String,
    #[serde(default)]
    pub ref_id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

/// Decoded inbound application message
#[derive(Debug, Clone)]
pub enum AppMessage {
    ExecutionReport(ExecutionReport),
    OrderCancelReject(OrderCancelReject),
    SecurityList(SecurityListFragment),
    SecurityListReject {
        security_req_id: String,
        text: Option<String>,
    },
    MarketDataSnapshot(MarketDataSnapshot),
    MarketDataIncremental(MarketDataIncremental),
    MarketDataRequestReject {
        md_req_id: String,
        text: Option<String>,
    },
    RequestForPositionsAck(RequestForPositionsAck),
    PositionReport(PositionReport),
    OrderMassCancelReport(MassCancelReport),
    BusinessMessageReject(BusinessReject),
    /// Anything the engine decoded but the gateway does not handle
    Other { msg_type: String },
}

impl AppMessage {
    pub fn name(&self) -> &'static str {
        match self {
            AppMessage::ExecutionReport(_) => "ExecutionReport",
            AppMessage::OrderCancelReject(_) => "OrderCancelReject",
            AppMessage::SecurityList(_) => "SecurityList",
            AppMessage::SecurityListReject { .. } => "SecurityListReject",
            AppMessage::MarketDataSnapshot(_) => "MarketDataSnapshotFullRefresh",
            AppMessage::MarketDataIncremental(_) => "MarketDataIncrementalRefresh",
            AppMessage::MarketDataRequestReject { .. } => "MarketDataRequestReject",
            AppMessage::RequestForPositionsAck(_) => "RequestForPositionsAck",
            AppMessage::PositionReport(_) => "PositionReport",
            AppMessage::OrderMassCancelReport(_) => "OrderMassCancelReport",
            AppMessage::BusinessMessageReject(_) => "BusinessMessageReject",
            AppMessage::Other { .. } => "Other",
        }
    }
}

/// Application message handed to the engine for sending
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum OutboundMessage {
    NewOrderSingle {
        cl_ord_id: String,
        account: String,
        instrument: InstrumentKey,
        side: Side,
        ord_type: OrdType,
        quantity: Decimal,
        price: Option<Decimal>,
    },
    OrderCancelRequest {
        cl_ord_id: String,
        orig_cl_ord_id: String,
        venue_order_id: Option<String>,
        instrument: InstrumentKey,
        side: Side,
    },
    OrderCancelReplaceRequest {
        cl_ord_id: String,
        orig_cl_ord_id: String,
        venue_order_id: Option<String>,
        instrument: InstrumentKey,
        side: Side,
        ord_type: OrdType,
        quantity: Decimal,
        price: Option<Decimal>,
    },
    SecurityListRequest {
        security_req_id: String,
    },
    MarketDataRequest {
        md_req_id: String,
        instruments: Vec<InstrumentKey>,
        /// 0 = full book
        depth: u32,
    },
    RequestForPositions {
        pos_req_id: String,
        account: String,
    },
    OrderMassStatusRequest {
        mass_status_req_id: String,
        account: String,
    },
    OrderMassCancelRequest {
        cl_ord_id: String,
        account: String,
        instrument: InstrumentKey,
    },
}

impl OutboundMessage {
    pub fn new_order(cl_ord_id: impl Into<String>, account: impl Into<String>, request: &OrderRequest) -> Self {
        OutboundMessage::NewOrderSingle {
            cl_ord_id: cl_ord_id.into(),
            account: account.into(),
            instrument: request.instrument.clone(),
            side: request.side,
            ord_type: request.ord_type,
            quantity: request.quantity,
            price: request.price,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OutboundMessage::NewOrderSingle { .. } => "NewOrderSingle",
            OutboundMessage::OrderCancelRequest { .. } => "OrderCancelRequest",
            OutboundMessage::OrderCancelReplaceRequest { .. } => "OrderCancelReplaceRequest",
            OutboundMessage::SecurityListRequest { .. } => "SecurityListRequest",
            OutboundMessage::MarketDataRequest { .. } => "MarketDataRequest",
            OutboundMessage::RequestForPositions { .. } => "RequestForPositions",
            OutboundMessage::OrderMassStatusRequest { .. } => "OrderMassStatusRequest",
            OutboundMessage::OrderMassCancelRequest { .. } => "OrderMassCancelRequest",
        }
    }

    /// Client-assigned id carried by the message
    pub fn request_id(&self) -> &str {
        match self {
            OutboundMessage::NewOrderSingle { cl_ord_id, .. }
            | OutboundMessage::OrderCancelRequest { cl_ord_id, .. }
            | OutboundMessage::OrderCancelReplaceRequest { cl_ord_id, .. }
            | OutboundMessage::OrderMassCancelRequest { cl_ord_id, .. } => cl_ord_id,
            OutboundMessage::SecurityListRequest { security_req_id } => security_req_id,
            OutboundMessage::MarketDataRequest { md_req_id, .. } => md_req_id,
            OutboundMessage::RequestForPositions { pos_req_id, .. } => pos_req_id,
            OutboundMessage::OrderMassStatusRequest {
                mass_status_req_id, ..
            } => mass_status_req_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fix_message_fields() {
        let mut logon = FixMessage::logon(30);
        assert!(logon.is_logon());
        assert_eq!(logon.get(tags::HEART_BT_INT), Some("30"));

        logon.set(tags::USERNAME, "trader");
        assert_eq!(logon.get(tags::USERNAME), Some("trader"));
        assert_eq!(logon.remove(tags::USERNAME), Some("trader".to_string()));
        assert!(logon.get(tags::USERNAME).is_none());
    }

    #[test]
    fn test_outbound_request_id() {
        let msg = OutboundMessage::MarketDataRequest {
            md_req_id: "md-1".into(),
            instruments: vec![InstrumentKey::new("sim", "BTC-USD")],
            depth: 0,
        };
        assert_eq!(msg.request_id(), "md-1");
        assert_eq!(msg.name(), "MarketDataRequest");
    }
}
