//! Session gateway.
//!
//! Sole implementor of [`FixApplication`]. Engine callbacks are routed into
//! the ledger, the book tracker and the correlation registry, then announced
//! to the strategy side as [`SessionNotice`]s over an unbounded channel so the
//! engine thread never waits on strategy code.

use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::book::OrderBookTracker;
use super::engine::{FixApplication, ProtocolEngine};
use super::ledger::{ApplyOutcome, OrderLedger, ReconciliationWarning};
use super::message::{tags, AppMessage, Direction, FixMessage, OutboundMessage, SessionEvent};
use super::registry::{CorrelationRegistry, CorrelationToken, RequestKind, ResponseItem};
use crate::domain::{
    BookSnapshot, ExecType, ExecutionReport, InstrumentKey, InstrumentTable, Order, OrderRequest,
    OrderStatus, OrderTicket, Position, PositionRequestResult, ReplaceParams, Security,
    SessionState,
};
use crate::error::{FixflowError, Result};
use crate::signing::LogonAuthenticator;

/// Gateway-to-strategy notification
#[derive(Debug, Clone)]
pub enum SessionNotice {
    LoggedOn,
    LoggedOut,
    Disconnected,
    OrderUpdated(Order),
    PositionUpdated(Position),
    BookUpdated(InstrumentKey),
    /// Venue refused something: an order, a cancel, or a session message
    Rejected {
        reference: String,
        text: String,
    },
    Warning(ReconciliationWarning),
}

/// Static session parameters
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub account: String,
    pub heartbeat_secs: u32,
    /// Requested market data depth, 0 = full book
    pub market_data_depth: u32,
    pub max_buffered_increments: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            account: String::new(),
            heartbeat_secs: 30,
            market_data_depth: 0,
            max_buffered_increments: super::book::DEFAULT_MAX_BUFFERED,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GatewayStats {
    pub orders_sent: u64,
    pub cancels_sent: u64,
    pub replaces_sent: u64,
    pub requests_sent: u64,
    pub rejects_received: u64,
    pub logons: u64,
}

#[derive(Default)]
struct Counters {
    orders_sent: AtomicU64,
    cancels_sent: AtomicU64,
    replaces_sent: AtomicU64,
    requests_sent: AtomicU64,
    rejects_received: AtomicU64,
    logons: AtomicU64,
}

pub struct SessionGateway {
    settings: GatewaySettings,
    engine: Arc<dyn ProtocolEngine>,
    authenticator: LogonAuthenticator,
    ledger: OrderLedger,
    books: OrderBookTracker,
    registry: Arc<CorrelationRegistry>,
    instruments: RwLock<InstrumentTable>,
    state_tx: watch::Sender<SessionState>,
    notices: mpsc::UnboundedSender<SessionNotice>,
    request_seq: AtomicU64,
    counters: Counters,
}

impl SessionGateway {
    pub fn new(
        settings: GatewaySettings,
        authenticator: LogonAuthenticator,
        engine: Arc<dyn ProtocolEngine>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SessionNotice>) {
        let (notices, notice_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let books = OrderBookTracker::new(settings.max_buffered_increments);

        let gateway = Arc::new(Self {
            settings,
            engine,
            authenticator,
            ledger: OrderLedger::new(),
            books,
            registry: CorrelationRegistry::new(),
            instruments: RwLock::new(InstrumentTable::default()),
            state_tx,
            notices,
            request_seq: AtomicU64::new(0),
            counters: Counters::default(),
        });
        (gateway, notice_rx)
    }

    /// Hand the gateway to the engine and begin logon
    pub fn start(self: &Arc<Self>) -> Result<()> {
        info!(auth = %self.authenticator.method(), "Starting protocol engine");
        let application: Arc<dyn FixApplication> = self.clone();
        self.engine.start(application)
    }

    /// Logout and stop the engine
    pub fn logout(&self) -> Result<()> {
        let state = self.session_state();
        if state == SessionState::LoggedOn {
            self.set_state(SessionState::LoggingOut);
        }
        info!(from = %state, "Logging out");
        self.engine.stop()
    }

    pub fn session_state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn ledger(&self) -> &OrderLedger {
        &self.ledger
    }

    pub fn books(&self) -> &OrderBookTracker {
        &self.books
    }

    pub fn registry(&self) -> &Arc<CorrelationRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &GatewaySettings {
        &self.settings
    }

    pub fn book(&self, instrument: &InstrumentKey) -> Option<BookSnapshot> {
        self.books.book(instrument)
    }

    /// Install the instrument table built from the security list
    pub fn install_instruments(&self, table: InstrumentTable) {
        self.ledger.register_instruments(&table);
        info!(instruments = table.len(), "Instrument table installed");
        *self.instruments.write() = table;
    }

    pub fn security(&self, instrument: &InstrumentKey) -> Option<Security> {
        self.instruments.read().get(instrument).cloned()
    }

    pub fn instruments(&self) -> InstrumentTable {
        self.instruments.read().clone()
    }

    pub fn stats(&self) -> GatewayStats {
        let c = &self.counters;
        GatewayStats {
            orders_sent: c.orders_sent.load(Ordering::Relaxed),
            cancels_sent: c.cancels_sent.load(Ordering::Relaxed),
            replaces_sent: c.replaces_sent.load(Ordering::Relaxed),
            requests_sent: c.requests_sent.load(Ordering::Relaxed),
            rejects_received: c.rejects_received.load(Ordering::Relaxed),
            logons: c.logons.load(Ordering::Relaxed),
        }
    }

    // ---- outbound: orders ----

    /// Submit a new order. The ledger tracks it as PendingNew before the
    /// engine sees it, so an immediate execution report always matches.
    pub fn send_order(&self, request: &OrderRequest) -> Result<OrderTicket> {
        self.ensure_logged_on()?;
        request.validate()?;
        {
            let instruments = self.instruments.read();
            if !instruments.is_empty() && !instruments.contains(&request.instrument) {
                return Err(FixflowError::Validation(format!(
                    "instrument {} not in security list",
                    request.instrument
                )));
            }
        }

        let cl_ord_id = Self::new_cl_ord_id();
        let order = self.ledger.record_new_order(&cl_ord_id, request)?;

        let message = OutboundMessage::new_order(&cl_ord_id, &self.settings.account, request);
        if let Err(e) = self.engine.send(message) {
            error!(cl_ord_id = %cl_ord_id, error = %e, "Failed to send order");
            if let Some(order) = self.ledger.reject_locally(&cl_ord_id, &e.to_string()) {
                self.notify(SessionNotice::OrderUpdated(order));
            }
            return Err(e);
        }

        self.counters.orders_sent.fetch_add(1, Ordering::Relaxed);
        info!(
            cl_ord_id = %cl_ord_id,
            instrument = %order.instrument,
            side = %order.side,
            qty = %order.quantity,
            price = ?order.price,
            "Order sent"
        );
        Ok(OrderTicket { cl_ord_id })
    }

    /// Request cancellation; returns the cancel request's id
    pub fn cancel_order(&self, cl_ord_id: &str) -> Result<String> {
        self.ensure_logged_on()?;
        let request_id = Self::new_cl_ord_id();
        let order = self.ledger.mark_pending_cancel(cl_ord_id, &request_id)?;

        let message = OutboundMessage::OrderCancelRequest {
            cl_ord_id: request_id.clone(),
            orig_cl_ord_id: order.cl_ord_id.clone(),
            venue_order_id: order.venue_order_id.clone(),
            instrument: order.instrument.clone(),
            side: order.side,
        };
        // Announced before sending: the venue's answer may arrive on the
        // engine thread before send returns
        self.notify(SessionNotice::OrderUpdated(order));
        if let Err(e) = self.engine.send(message) {
            if let Some(restored) = self.ledger.revert_pending(cl_ord_id, &request_id) {
                self.notify(SessionNotice::OrderUpdated(restored));
            }
            return Err(e);
        }

        self.counters.cancels_sent.fetch_add(1, Ordering::Relaxed);
        debug!(cl_ord_id, request_id = %request_id, "Cancel sent");
        Ok(request_id)
    }

    /// Request new terms; returns the id the replacement order will carry
    pub fn replace_order(&self, cl_ord_id: &str, params: ReplaceParams) -> Result<String> {
        self.ensure_logged_on()?;
        if params.is_empty() {
            return Err(FixflowError::Validation(
                "replace needs a new quantity or price".to_string(),
            ));
        }

        let request_id = Self::new_cl_ord_id();
        let order = self
            .ledger
            .mark_pending_replace(cl_ord_id, &request_id, params.clone())?;

        let message = OutboundMessage::OrderCancelReplaceRequest {
            cl_ord_id: request_id.clone(),
            orig_cl_ord_id: order.cl_ord_id.clone(),
            venue_order_id: order.venue_order_id.clone(),
            instrument: order.instrument.clone(),
            side: order.side,
            ord_type: order.ord_type,
            quantity: params.quantity.unwrap_or(order.quantity),
            price: params.price.or(order.price),
        };
        // Announced before sending: the venue's answer may arrive on the
        // engine thread before send returns
        self.notify(SessionNotice::OrderUpdated(order));
        if let Err(e) = self.engine.send(message) {
            if let Some(restored) = self.ledger.revert_pending(cl_ord_id, &request_id) {
                self.notify(SessionNotice::OrderUpdated(restored));
            }
            return Err(e);
        }

        self.counters.replaces_sent.fetch_add(1, Ordering::Relaxed);
        debug!(cl_ord_id, request_id = %request_id, "Replace sent");
        Ok(request_id)
    }

    // ---- outbound: correlated requests ----

    pub fn request_security_list(&self) -> Result<CorrelationToken> {
        self.ensure_logged_on()?;
        let token = self
            .registry
            .register(self.next_request_id(RequestKind::SecurityList), RequestKind::SecurityList)?;
        let message = OutboundMessage::SecurityListRequest {
            security_req_id: token.request_id().to_string(),
        };
        self.send_correlated(token, message)
    }

    /// Subscribe to books; completes once each instrument has a snapshot
    pub fn request_market_data(&self, instruments: &[InstrumentKey]) -> Result<CorrelationToken> {
        self.ensure_logged_on()?;
        if instruments.is_empty() {
            return Err(FixflowError::Validation(
                "market data request without instruments".to_string(),
            ));
        }
        let token = self.registry.register_market_data(
            self.next_request_id(RequestKind::MarketData),
            instruments.iter().cloned(),
        )?;
        let message = OutboundMessage::MarketDataRequest {
            md_req_id: token.request_id().to_string(),
            instruments: instruments.to_vec(),
            depth: self.settings.market_data_depth,
        };
        self.send_correlated(token, message)
    }

    pub fn request_position_snapshot(&self) -> Result<CorrelationToken> {
        self.ensure_logged_on()?;
        let token = self.registry.register(
            self.next_request_id(RequestKind::PositionSnapshot),
            RequestKind::PositionSnapshot,
        )?;
        let message = OutboundMessage::RequestForPositions {
            pos_req_id: token.request_id().to_string(),
            account: self.settings.account.clone(),
        };
        self.send_correlated(token, message)
    }

    pub fn request_working_orders(&self) -> Result<CorrelationToken> {
        self.ensure_logged_on()?;
        let token = self.registry.register(
            self.next_request_id(RequestKind::OrderMassStatus),
            RequestKind::OrderMassStatus,
        )?;
        let message = OutboundMessage::OrderMassStatusRequest {
            mass_status_req_id: token.request_id().to_string(),
            account: self.settings.account.clone(),
        };
        self.send_correlated(token, message)
    }

    pub fn request_mass_cancel(&self, instrument: &InstrumentKey) -> Result<CorrelationToken> {
        self.ensure_logged_on()?;
        let token = self
            .registry
            .register(self.next_request_id(RequestKind::MassCancel), RequestKind::MassCancel)?;
        let message = OutboundMessage::OrderMassCancelRequest {
            cl_ord_id: token.request_id().to_string(),
            account: self.settings.account.clone(),
            instrument: instrument.clone(),
        };
        self.send_correlated(token, message)
    }

    fn send_correlated(&self, token: CorrelationToken, message: OutboundMessage) -> Result<CorrelationToken> {
        let name = message.name();
        if let Err(e) = self.engine.send(message) {
            self.registry.remove(token.request_id());
            error!(request_id = token.request_id(), msg_type = name, error = %e, "Failed to send request");
            return Err(e);
        }
        self.counters.requests_sent.fetch_add(1, Ordering::Relaxed);
        debug!(request_id = token.request_id(), msg_type = name, "Request sent");
        Ok(token)
    }

    fn ensure_logged_on(&self) -> Result<()> {
        let state = self.session_state();
        if state.is_connected() {
            Ok(())
        } else {
            Err(FixflowError::SessionUnavailable { state })
        }
    }

    fn next_request_id(&self, kind: RequestKind) -> String {
        let seq = self.request_seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}", kind.id_prefix(), seq)
    }

    fn new_cl_ord_id() -> String {
        Uuid::new_v4().simple().to_string()
    }

    fn notify(&self, notice: SessionNotice) {
        // Receiver gone means the runner has already stopped
        let _ = self.notices.send(notice);
    }

    fn set_state(&self, to: SessionState) {
        let from = self.session_state();
        if from == to {
            return;
        }
        if !from.can_transition_to(to) {
            warn!(from = %from, to = %to, "Unexpected session state change");
        }
        self.state_tx.send_replace(to);
        debug!(from = %from, to = %to, "Session state changed");
    }

    // ---- inbound ----

    /// Place credentials on an outbound logon
    pub fn augment_logon(&self, message: &mut FixMessage) -> Result<()> {
        let fields = self.authenticator.logon_fields()?;

        if message.get(tags::HEART_BT_INT).is_none() {
            message.set(tags::HEART_BT_INT, self.settings.heartbeat_secs.to_string());
        }
        message.set(tags::USERNAME, fields.username);
        message.set(tags::PASSWORD, fields.password);
        match fields.raw_data {
            Some(nonce) => {
                message.set(tags::RAW_DATA_LENGTH, nonce.len().to_string());
                message.set(tags::RAW_DATA, nonce);
            }
            None => {
                message.remove(tags::RAW_DATA_LENGTH);
                message.remove(tags::RAW_DATA);
            }
        }
        Ok(())
    }

    fn on_execution_report(&self, report: ExecutionReport) {
        if let Some(id) = report.mass_status_req_id.clone() {
            if self.registry.pending_kind(&id) == Some(RequestKind::OrderMassStatus) {
                if report.is_empty_status_response() {
                    self.registry.accept(&id, Vec::new(), true);
                } else {
                    let last = report.last_rpt_requested;
                    self.registry.accept(&id, vec![ResponseItem::Order(report)], last);
                }
                return;
            }
            if report.exec_type == ExecType::OrderStatus {
                // Late answer to a withdrawn mass status request
                self.registry.accept(&id, Vec::new(), report.last_rpt_requested);
                return;
            }
        }

        let reference = report.reference();
        let text = report.text.clone();
        match self.ledger.apply_execution_report(report) {
            ApplyOutcome::Applied { order, position } => {
                if order.status == OrderStatus::Rejected {
                    self.counters.rejects_received.fetch_add(1, Ordering::Relaxed);
                    warn!(cl_ord_id = %order.cl_ord_id, reason = ?text, "Order rejected");
                    self.notify(SessionNotice::Rejected {
                        reference: order.cl_ord_id.clone(),
                        text: text.unwrap_or_else(|| "order rejected".to_string()),
                    });
                } else {
                    debug!(cl_ord_id = %order.cl_ord_id, status = %order.status, cum_qty = %order.cum_qty, "Order updated");
                }
                self.notify(SessionNotice::OrderUpdated(order));
                if let Some(position) = position {
                    self.notify(SessionNotice::PositionUpdated(position));
                }
            }
            ApplyOutcome::Duplicate { .. } => {}
            ApplyOutcome::Unknown { warning, .. } => {
                debug!(reference = %reference, "Execution report for unknown order");
                self.notify(SessionNotice::Warning(warning));
            }
            ApplyOutcome::Ignored { warning, .. } => {
                debug!(reference = %reference, "Execution report not applied");
                if let Some(warning) = warning {
                    self.notify(SessionNotice::Warning(warning));
                }
            }
        }
    }

    fn on_position_ack(&self, pos_req_id: &str, result: PositionRequestResult, total: u32, text: Option<String>) {
        match result {
            PositionRequestResult::Valid => {
                self.registry.set_expected_total(pos_req_id, total as usize);
            }
            PositionRequestResult::NoPositions => {
                self.registry.set_expected_total(pos_req_id, 0);
            }
            PositionRequestResult::Rejected => {
                self.registry.fail(
                    pos_req_id,
                    text.unwrap_or_else(|| "position request rejected".to_string()),
                );
            }
        }
    }
}

impl FixApplication for SessionGateway {
    fn on_admin_message(&self, direction: Direction, message: &mut FixMessage) {
        match direction {
            Direction::Outbound if message.is_logon() => {
                self.set_state(SessionState::LoggingOn);
                if let Err(e) = self.augment_logon(message) {
                    error!(error = %e, "Logon augmentation failed");
                    self.notify(SessionNotice::Rejected {
                        reference: "logon".to_string(),
                        text: e.to_string(),
                    });
                }
            }
            Direction::Outbound => {}
            Direction::Inbound if message.is_logout() => {
                info!(text = ?message.get(tags::TEXT), "Logout received");
            }
            Direction::Inbound if message.is_reject() => {
                self.counters.rejects_received.fetch_add(1, Ordering::Relaxed);
                let reference = message.get(tags::REF_SEQ_NUM).unwrap_or("?").to_string();
                let text = message.get(tags::TEXT).unwrap_or("session reject").to_string();
                warn!(ref_seq_num = %reference, reason = ?message.get(tags::SESSION_REJECT_REASON), text = %text, "Session-level reject");
                self.notify(SessionNotice::Rejected { reference, text });
            }
            Direction::Inbound => {}
        }
    }

    fn on_app_message(&self, message: AppMessage) {
        debug!(msg_type = message.name(), "Inbound application message");

        match message {
            AppMessage::ExecutionReport(report) => self.on_execution_report(report),
            AppMessage::OrderCancelReject(reject) => {
                self.counters.rejects_received.fetch_add(1, Ordering::Relaxed);
                match self.ledger.apply_cancel_reject(&reject) {
                    ApplyOutcome::Applied { order, .. } => {
                        self.notify(SessionNotice::Rejected {
                            reference: reject.cl_ord_id.clone(),
                            text: reject.text.clone().unwrap_or_else(|| "cancel rejected".to_string()),
                        });
                        self.notify(SessionNotice::OrderUpdated(order));
                    }
                    ApplyOutcome::Unknown { warning, .. } => {
                        self.notify(SessionNotice::Warning(warning));
                    }
                    _ => {}
                }
            }
            AppMessage::SecurityList(fragment) => {
                let items = fragment
                    .securities
                    .into_iter()
                    .map(ResponseItem::Security)
                    .collect();
                self.registry
                    .accept(&fragment.security_req_id, items, fragment.last_fragment);
            }
            AppMessage::SecurityListReject {
                security_req_id,
                text,
            } => {
                self.registry.fail(
                    &security_req_id,
                    text.unwrap_or_else(|| "security list rejected".to_string()),
                );
            }
            AppMessage::MarketDataSnapshot(snapshot) => {
                self.books.apply_snapshot(&snapshot);
                self.registry
                    .observe_snapshot(snapshot.md_req_id.as_deref(), &snapshot.instrument);
                self.notify(SessionNotice::BookUpdated(snapshot.instrument));
            }
            AppMessage::MarketDataIncremental(update) => {
                for instrument in self.books.apply_incremental(&update) {
                    self.notify(SessionNotice::BookUpdated(instrument));
                }
            }
            AppMessage::MarketDataRequestReject { md_req_id, text } => {
                self.registry.fail(
                    &md_req_id,
                    text.unwrap_or_else(|| "market data request rejected".to_string()),
                );
            }
            AppMessage::RequestForPositionsAck(ack) => {
                self.on_position_ack(&ack.pos_req_id, ack.result, ack.total_reports, ack.text);
            }
            AppMessage::PositionReport(report) => {
                let pending = report
                    .pos_req_id
                    .as_deref()
                    .filter(|id| self.registry.pending_kind(id) == Some(RequestKind::PositionSnapshot))
                    .map(str::to_string);
                match pending {
                    Some(id) => {
                        let last = report.last_report;
                        self.registry
                            .accept(&id, vec![ResponseItem::Position(report)], last);
                    }
                    None => {
                        if let Some(warning) = self.ledger.check_position_report(&report) {
                            self.notify(SessionNotice::Warning(warning));
                        }
                    }
                }
            }
            AppMessage::OrderMassCancelReport(report) => {
                let id = report.mass_cancel_req_id.clone();
                if report.accepted {
                    info!(request_id = %id, affected = report.total_affected, "Mass cancel accepted");
                    self.registry
                        .accept(&id, vec![ResponseItem::MassCancel(report)], true);
                } else {
                    self.registry.fail(
                        &id,
                        report.text.unwrap_or_else(|| "mass cancel rejected".to_string()),
                    );
                }
            }
            AppMessage::BusinessMessageReject(reject) => {
                self.counters.rejects_received.fetch_add(1, Ordering::Relaxed);
                let text = reject
                    .text
                    .clone()
                    .unwrap_or_else(|| format!("{} rejected", reject.ref_msg_type));
                let Some(ref_id) = reject.ref_id else {
                    warn!(ref_msg_type = %reject.ref_msg_type, text = %text, "Business reject without reference");
                    self.notify(SessionNotice::Rejected {
                        reference: reject.ref_msg_type,
                        text,
                    });
                    return;
                };

                if self.registry.is_pending(&ref_id) {
                    self.registry.fail(&ref_id, text);
                    return;
                }
                if let Some(order) = self.ledger.reject_locally(&ref_id, &text) {
                    self.notify(SessionNotice::OrderUpdated(order));
                }
                warn!(reference = %ref_id, text = %text, "Business reject");
                self.notify(SessionNotice::Rejected {
                    reference: ref_id,
                    text,
                });
            }
            AppMessage::Other { msg_type } => {
                debug!(msg_type = %msg_type, "Ignoring unhandled application message");
            }
        }
    }

    fn on_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Logon => {
                self.set_state(SessionState::LoggedOn);
                self.counters.logons.fetch_add(1, Ordering::Relaxed);
                info!("Session logged on");
                self.notify(SessionNotice::LoggedOn);
            }
            SessionEvent::Logout | SessionEvent::Disconnect => {
                self.set_state(SessionState::Disconnected);
                let failed = self.registry.fail_all_closing();
                let dropped = self.books.discard_buffered();
                if event == SessionEvent::Logout {
                    info!(failed_requests = failed, dropped_increments = dropped, "Session logged out");
                    self.notify(SessionNotice::LoggedOut);
                } else {
                    warn!(failed_requests = failed, dropped_increments = dropped, "Session disconnected");
                    self.notify(SessionNotice::Disconnected);
                }
            }
        }
    }
}
