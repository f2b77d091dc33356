//! In-process paper venue
//!
//! Implements [`ProtocolEngine`] without a wire: outbound messages are
//! answered by a small simulator running on its own tokio task, which calls
//! back into the application the way a real engine thread would. Books are
//! a fixed ladder around a randomly walking mid; orders fill against the
//! ladder without depleting it.

use parking_lot::Mutex;
use rand::Rng;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{PaperConfig, SessionConfig};
use crate::domain::{
    BookSide, CancelRejectResponseTo, ExecType, ExecutionReport, InstrumentKey,
    MarketDataIncremental, MarketDataSnapshot, MdEntry, MdIncrement, MdUpdateAction, OrdType,
    OrderCancelReject, OrderStatus, Position, PositionReport, PositionRequestResult, PriceLevel,
    RequestForPositionsAck, Security, Side,
};
use crate::error::{FixflowError, Result};
use crate::session::message::{tags, MassCancelReport, SecurityListFragment};
use crate::session::{
    AppMessage, Direction, FixApplication, FixMessage, OutboundMessage, ProtocolEngine,
    SessionEvent,
};
use crate::signing::{AuthMethod, LogonAuthenticator, SecretString};

/// What the venue expects on logon
#[derive(Clone)]
pub struct VenueCredentials {
    pub method: AuthMethod,
    pub username: String,
    pub secret: SecretString,
}

impl VenueCredentials {
    pub fn from_session(session: &SessionConfig) -> Self {
        Self {
            method: session.auth_method,
            username: session.username.clone(),
            secret: session.secret.clone(),
        }
    }

    fn verify(&self, logon: &FixMessage, seen_nonces: &mut HashSet<String>) -> std::result::Result<(), String> {
        if logon.get(tags::USERNAME) != Some(self.username.as_str()) {
            return Err("unknown username".to_string());
        }
        let password = logon.get(tags::PASSWORD).ok_or("missing password")?;

        let expected = match self.method {
            AuthMethod::Password => self.secret.expose().to_string(),
            AuthMethod::HmacSha256 => {
                let nonce = logon.get(tags::RAW_DATA).ok_or("missing nonce")?;
                let declared = nonce.len().to_string();
                if logon.get(tags::RAW_DATA_LENGTH) != Some(declared.as_str()) {
                    return Err("raw data length mismatch".to_string());
                }
                if !seen_nonces.insert(nonce.to_string()) {
                    return Err("nonce reused".to_string());
                }
                LogonAuthenticator::new(self.method, self.username.clone(), self.secret.clone())
                    .sign(nonce)
                    .map_err(|e| e.to_string())?
            }
        };

        if password == expected {
            Ok(())
        } else {
            Err("invalid credentials".to_string())
        }
    }
}

enum VenueCommand {
    Send(OutboundMessage),
    Logout,
    /// Drop the connection without a logout
    Disconnect,
}

pub struct PaperVenue {
    config: PaperConfig,
    listed: Vec<InstrumentKey>,
    credentials: VenueCredentials,
    heartbeat_secs: u32,
    commands: Mutex<Option<mpsc::UnboundedSender<VenueCommand>>>,
}

impl PaperVenue {
    pub fn new(
        config: PaperConfig,
        listed: Vec<InstrumentKey>,
        credentials: VenueCredentials,
        heartbeat_secs: u32,
    ) -> Self {
        Self {
            config,
            listed,
            credentials,
            heartbeat_secs,
            commands: Mutex::new(None),
        }
    }

    /// Simulate a dropped connection
    pub fn drop_connection(&self) {
        if let Some(tx) = self.commands.lock().take() {
            let _ = tx.send(VenueCommand::Disconnect);
        }
    }

    fn command(&self, command: VenueCommand) -> Result<()> {
        let guard = self.commands.lock();
        let tx = guard
            .as_ref()
            .ok_or_else(|| FixflowError::Engine("paper venue not connected".to_string()))?;
        tx.send(command)
            .map_err(|_| FixflowError::Engine("paper venue task has exited".to_string()))
    }
}

impl ProtocolEngine for PaperVenue {
    fn start(&self, application: Arc<dyn FixApplication>) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| FixflowError::Engine(format!("paper venue needs a tokio runtime: {}", e)))?;

        let mut guard = self.commands.lock();
        if guard.is_some() {
            return Err(FixflowError::Engine("paper venue already started".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *guard = Some(tx);

        let sim = VenueSim::new(self.config.clone(), self.listed.clone());
        let session = VenueSession {
            application,
            credentials: self.credentials.clone(),
            heartbeat_secs: self.heartbeat_secs,
            update_interval: Duration::from_millis(self.config.update_interval_ms.max(1)),
        };
        runtime.spawn(session.run(sim, rx));
        info!(instruments = self.listed.len(), "Paper venue started");
        Ok(())
    }

    fn send(&self, message: OutboundMessage) -> Result<()> {
        self.command(VenueCommand::Send(message))
    }

    fn stop(&self) -> Result<()> {
        match self.commands.lock().take() {
            Some(tx) => {
                let _ = tx.send(VenueCommand::Logout);
            }
            None => debug!("Paper venue stop without a live session"),
        }
        Ok(())
    }
}

struct VenueSession {
    application: Arc<dyn FixApplication>,
    credentials: VenueCredentials,
    heartbeat_secs: u32,
    update_interval: Duration,
}

impl VenueSession {
    async fn run(self, mut sim: VenueSim, mut rx: mpsc::UnboundedReceiver<VenueCommand>) {
        let app = &self.application;
        let mut seen_nonces = HashSet::new();

        let mut logon = FixMessage::logon(self.heartbeat_secs);
        app.on_admin_message(Direction::Outbound, &mut logon);
        if let Err(reason) = self.credentials.verify(&logon, &mut seen_nonces) {
            warn!(reason = %reason, "Paper venue refused logon");
            let mut logout = FixMessage::logout(Some(&reason));
            app.on_admin_message(Direction::Inbound, &mut logout);
            app.on_session_event(SessionEvent::Disconnect);
            return;
        }

        let mut ack = FixMessage::logon(self.heartbeat_secs);
        app.on_admin_message(Direction::Inbound, &mut ack);
        app.on_session_event(SessionEvent::Logon);

        let mut ticker = tokio::time::interval(self.update_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(VenueCommand::Send(message)) => {
                        for reply in sim.handle(message) {
                            app.on_app_message(reply);
                        }
                    }
                    Some(VenueCommand::Disconnect) => {
                        warn!("Paper venue dropping connection");
                        app.on_session_event(SessionEvent::Disconnect);
                        break;
                    }
                    Some(VenueCommand::Logout) | None => {
                        let mut logout = FixMessage::logout(None);
                        app.on_admin_message(Direction::Inbound, &mut logout);
                        app.on_session_event(SessionEvent::Logout);
                        break;
                    }
                },
                _ = ticker.tick() => {
                    let mut rng = rand::thread_rng();
                    for reply in sim.tick(&mut rng) {
                        app.on_app_message(reply);
                    }
                }
            }
        }
        info!("Paper venue session closed");
    }
}

#[derive(Debug, Clone)]
struct RestingOrder {
    cl_ord_id: String,
    venue_order_id: String,
    instrument: InstrumentKey,
    side: Side,
    ord_type: OrdType,
    quantity: Decimal,
    price: Option<Decimal>,
    cum_qty: Decimal,
    avg_px: Decimal,
}

impl RestingOrder {
    fn leaves(&self) -> Decimal {
        self.quantity - self.cum_qty
    }

    fn status(&self) -> OrderStatus {
        if self.cum_qty.is_zero() {
            OrderStatus::New
        } else if self.cum_qty >= self.quantity {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        }
    }

    fn fill(&mut self, qty: Decimal, px: Decimal) {
        let total = self.cum_qty + qty;
        self.avg_px = (self.avg_px * self.cum_qty + px * qty) / total;
        self.cum_qty = total;
    }

    /// Levels this order may trade against, best first
    fn crossable<'a>(&self, book: &'a SimBook) -> Vec<&'a PriceLevel> {
        let levels = match self.side {
            Side::Buy => &book.asks,
            Side::Sell => &book.bids,
        };
        levels
            .iter()
            .filter(|level| match (self.ord_type, self.price) {
                (OrdType::Market, _) | (_, None) => true,
                (OrdType::Limit, Some(limit)) => match self.side {
                    Side::Buy => level.price <= limit,
                    Side::Sell => level.price >= limit,
                },
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
struct SimBook {
    mid: Decimal,
    bids: Vec<PriceLevel>,
    asks: Vec<PriceLevel>,
}

impl SimBook {
    fn around(mid: Decimal, tick: Decimal, depth: usize) -> Self {
        let mut bids = Vec::with_capacity(depth);
        let mut asks = Vec::with_capacity(depth);
        for i in 0..depth {
            let offset = tick * Decimal::from(i as u64 + 1);
            let qty = Decimal::from(i as u64 + 1);
            bids.push(PriceLevel::new(mid - offset, qty));
            asks.push(PriceLevel::new(mid + offset, qty));
        }
        Self { mid, bids, asks }
    }

    fn entries(&self, depth: usize) -> Vec<MdEntry> {
        let depth = if depth == 0 { usize::MAX } else { depth };
        self.bids
            .iter()
            .take(depth)
            .map(|l| MdEntry::new(BookSide::Bid, l.price, l.quantity))
            .chain(
                self.asks
                    .iter()
                    .take(depth)
                    .map(|l| MdEntry::new(BookSide::Offer, l.price, l.quantity)),
            )
            .collect()
    }
}

struct Subscription {
    md_req_id: String,
    depth: usize,
}

/// Venue state machine; synchronous so it can be driven directly in tests
struct VenueSim {
    config: PaperConfig,
    listed: Vec<InstrumentKey>,
    books: HashMap<InstrumentKey, SimBook>,
    subscriptions: HashMap<InstrumentKey, Subscription>,
    orders: Vec<RestingOrder>,
    positions: BTreeMap<InstrumentKey, Position>,
    balances: BTreeMap<String, Decimal>,
    exec_seq: u64,
    order_seq: u64,
    rpt_seq: u64,
}

impl VenueSim {
    fn new(config: PaperConfig, listed: Vec<InstrumentKey>) -> Self {
        let books = listed
            .iter()
            .map(|key| {
                (
                    key.clone(),
                    SimBook::around(config.reference_price, config.tick_size, config.depth.max(1)),
                )
            })
            .collect();
        let balances = config.initial_balances.clone();
        Self {
            config,
            listed,
            books,
            subscriptions: HashMap::new(),
            orders: Vec::new(),
            positions: BTreeMap::new(),
            balances,
            exec_seq: 0,
            order_seq: 0,
            rpt_seq: 0,
        }
    }

    fn handle(&mut self, message: OutboundMessage) -> Vec<AppMessage> {
        debug!(msg_type = message.name(), request_id = message.request_id(), "Paper venue received");
        match message {
            OutboundMessage::SecurityListRequest { security_req_id } => {
                self.security_list(security_req_id)
            }
            OutboundMessage::MarketDataRequest {
                md_req_id,
                instruments,
                depth,
            } => self.subscribe(md_req_id, instruments, depth as usize),
            OutboundMessage::RequestForPositions { pos_req_id, .. } => self.positions(pos_req_id),
            OutboundMessage::OrderMassStatusRequest {
                mass_status_req_id, ..
            } => self.mass_status(mass_status_req_id),
            OutboundMessage::NewOrderSingle {
                cl_ord_id,
                instrument,
                side,
                ord_type,
                quantity,
                price,
                ..
            } => self.new_order(RestingOrder {
                cl_ord_id,
                venue_order_id: String::new(),
                instrument,
                side,
                ord_type,
                quantity,
                price,
                cum_qty: Decimal::ZERO,
                avg_px: Decimal::ZERO,
            }),
            OutboundMessage::OrderCancelRequest {
                cl_ord_id,
                orig_cl_ord_id,
                ..
            } => self.cancel(cl_ord_id, orig_cl_ord_id),
            OutboundMessage::OrderCancelReplaceRequest {
                cl_ord_id,
                orig_cl_ord_id,
                quantity,
                price,
                ..
            } => self.replace(cl_ord_id, orig_cl_ord_id, quantity, price),
            OutboundMessage::OrderMassCancelRequest {
                cl_ord_id,
                instrument,
                ..
            } => self.mass_cancel(cl_ord_id, instrument),
        }
    }

    fn security_list(&self, security_req_id: String) -> Vec<AppMessage> {
        let securities: Vec<Security> = self
            .listed
            .iter()
            .map(|key| {
                let security = Security::new(key.clone(), self.config.tick_size);
                match split_symbol(&key.symbol) {
                    Some((base, quote)) => security.with_currencies(base, quote),
                    None => security,
                }
            })
            .collect();

        let chunk = self.config.security_list_chunk.max(1);
        let chunks: Vec<Vec<Security>> = securities.chunks(chunk).map(<[Security]>::to_vec).collect();
        if chunks.is_empty() {
            return vec![AppMessage::SecurityList(SecurityListFragment {
                security_req_id,
                securities: Vec::new(),
                last_fragment: true,
            })];
        }

        let total = chunks.len();
        chunks
            .into_iter()
            .enumerate()
            .map(|(i, securities)| {
                AppMessage::SecurityList(SecurityListFragment {
                    security_req_id: security_req_id.clone(),
                    securities,
                    last_fragment: i + 1 == total,
                })
            })
            .collect()
    }

    fn subscribe(&mut self, md_req_id: String, instruments: Vec<InstrumentKey>, depth: usize) -> Vec<AppMessage> {
        if let Some(unknown) = instruments.iter().find(|k| !self.books.contains_key(*k)) {
            return vec![AppMessage::MarketDataRequestReject {
                md_req_id,
                text: Some(format!("unknown instrument {}", unknown)),
            }];
        }

        let mut replies = Vec::with_capacity(instruments.len());
        for instrument in instruments {
            self.rpt_seq += 1;
            let entries = self.books[&instrument].entries(depth);
            replies.push(AppMessage::MarketDataSnapshot(MarketDataSnapshot {
                md_req_id: Some(md_req_id.clone()),
                instrument: instrument.clone(),
                entries,
                rpt_seq: Some(self.rpt_seq),
            }));
            self.subscriptions.insert(
                instrument,
                Subscription {
                    md_req_id: md_req_id.clone(),
                    depth,
                },
            );
        }
        replies
    }

    fn positions(&self, pos_req_id: String) -> Vec<AppMessage> {
        let mut reports: Vec<PositionReport> = self
            .positions
            .values()
            .filter(|p| !p.is_flat())
            .map(|p| PositionReport::instrument(p.instrument.clone(), p.quantity, p.avg_price))
            .collect();
        reports.extend(
            self.balances
                .iter()
                .map(|(currency, qty)| PositionReport::balance(currency.clone(), *qty)),
        );

        if reports.is_empty() {
            return vec![AppMessage::RequestForPositionsAck(RequestForPositionsAck {
                pos_req_id,
                result: PositionRequestResult::NoPositions,
                total_reports: 0,
                text: None,
            })];
        }

        let total = reports.len();
        let mut replies = vec![AppMessage::RequestForPositionsAck(RequestForPositionsAck {
            pos_req_id: pos_req_id.clone(),
            result: PositionRequestResult::Valid,
            total_reports: total as u32,
            text: None,
        })];
        for (i, mut report) in reports.into_iter().enumerate() {
            report.pos_req_id = Some(pos_req_id.clone());
            report.total_reports = Some(total as u32);
            report.last_report = i + 1 == total;
            replies.push(AppMessage::PositionReport(report));
        }
        replies
    }

    fn mass_status(&mut self, mass_status_req_id: String) -> Vec<AppMessage> {
        if self.orders.is_empty() {
            let instrument = self
                .listed
                .first()
                .cloned()
                .unwrap_or_else(|| InstrumentKey::new("paper", "NONE"));
            let mut report = self.blank_report(ExecType::OrderStatus, OrderStatus::Rejected, instrument, Side::Buy);
            report.mass_status_req_id = Some(mass_status_req_id);
            report.tot_num_reports = Some(0);
            report.last_rpt_requested = true;
            report.text = Some("no working orders".to_string());
            return vec![AppMessage::ExecutionReport(report)];
        }

        let total = self.orders.len();
        let orders = self.orders.clone();
        orders
            .iter()
            .enumerate()
            .map(|(i, order)| {
                let mut report = self.order_report(order, ExecType::OrderStatus, order.status());
                report.mass_status_req_id = Some(mass_status_req_id.clone());
                report.tot_num_reports = Some(total as u32);
                report.last_rpt_requested = i + 1 == total;
                AppMessage::ExecutionReport(report)
            })
            .collect()
    }

    fn new_order(&mut self, mut order: RestingOrder) -> Vec<AppMessage> {
        let reason = if !self.books.contains_key(&order.instrument) {
            Some(format!("unknown instrument {}", order.instrument))
        } else if order.quantity <= Decimal::ZERO {
            Some("quantity must be positive".to_string())
        } else if order.ord_type == OrdType::Limit && order.price.is_none() {
            Some("limit order without price".to_string())
        } else {
            None
        };
        if let Some(reason) = reason {
            let mut report = self.order_report(&order, ExecType::Rejected, OrderStatus::Rejected);
            report.leaves_qty = Decimal::ZERO;
            report.text = Some(reason);
            return vec![AppMessage::ExecutionReport(report)];
        }

        self.order_seq += 1;
        order.venue_order_id = format!("P{}", self.order_seq);
        let mut replies = vec![AppMessage::ExecutionReport(self.order_report(
            &order,
            ExecType::New,
            OrderStatus::New,
        ))];

        replies.extend(self.match_order(&mut order));
        if order.ord_type == OrdType::Market && order.leaves() > Decimal::ZERO {
            let mut report = self.order_report(&order, ExecType::Canceled, OrderStatus::Canceled);
            report.leaves_qty = Decimal::ZERO;
            report.text = Some("insufficient liquidity".to_string());
            replies.push(AppMessage::ExecutionReport(report));
        } else if order.leaves() > Decimal::ZERO {
            self.orders.push(order);
        }
        replies
    }

    /// Fill against the ladder, one trade per level
    fn match_order(&mut self, order: &mut RestingOrder) -> Vec<AppMessage> {
        let Some(book) = self.books.get(&order.instrument) else {
            return Vec::new();
        };
        let levels: Vec<PriceLevel> = order.crossable(book).into_iter().copied().collect();

        let mut replies = Vec::new();
        for level in levels {
            let leaves = order.leaves();
            if leaves <= Decimal::ZERO {
                break;
            }
            let qty = leaves.min(level.quantity);
            order.fill(qty, level.price);
            self.book_fill(order, qty, level.price);

            let mut report = self.order_report(order, ExecType::Trade, order.status());
            report.last_qty = qty;
            report.last_px = level.price;
            replies.push(AppMessage::ExecutionReport(report));
        }
        replies
    }

    fn book_fill(&mut self, order: &RestingOrder, qty: Decimal, px: Decimal) {
        self.positions
            .entry(order.instrument.clone())
            .or_insert_with(|| Position::flat(order.instrument.clone()))
            .apply_fill(order.side, qty, px);

        if let Some((base, quote)) = split_symbol(&order.instrument.symbol) {
            let sign = order.side.sign();
            *self.balances.entry(base).or_default() += sign * qty;
            *self.balances.entry(quote).or_default() -= sign * qty * px;
        }
    }

    fn cancel(&mut self, cl_ord_id: String, orig_cl_ord_id: String) -> Vec<AppMessage> {
        let Some(idx) = self.orders.iter().position(|o| o.cl_ord_id == orig_cl_ord_id) else {
            return vec![cancel_reject(cl_ord_id, orig_cl_ord_id, CancelRejectResponseTo::Cancel, "unknown order")];
        };
        let order = self.orders.remove(idx);
        let mut report = self.order_report(&order, ExecType::Canceled, OrderStatus::Canceled);
        report.cl_ord_id = Some(cl_ord_id);
        report.orig_cl_ord_id = Some(orig_cl_ord_id);
        report.leaves_qty = Decimal::ZERO;
        vec![AppMessage::ExecutionReport(report)]
    }

    fn replace(
        &mut self,
        cl_ord_id: String,
        orig_cl_ord_id: String,
        quantity: Decimal,
        price: Option<Decimal>,
    ) -> Vec<AppMessage> {
        let Some(idx) = self.orders.iter().position(|o| o.cl_ord_id == orig_cl_ord_id) else {
            return vec![cancel_reject(cl_ord_id, orig_cl_ord_id, CancelRejectResponseTo::Replace, "unknown order")];
        };
        if quantity <= self.orders[idx].cum_qty {
            return vec![cancel_reject(
                cl_ord_id,
                orig_cl_ord_id,
                CancelRejectResponseTo::Replace,
                "quantity not above filled quantity",
            )];
        }

        let mut order = self.orders.remove(idx);
        order.cl_ord_id = cl_ord_id;
        order.quantity = quantity;
        order.price = price.or(order.price);

        let mut report = self.order_report(&order, ExecType::Replaced, order.status());
        report.orig_cl_ord_id = Some(orig_cl_ord_id);
        let mut replies = vec![AppMessage::ExecutionReport(report)];

        replies.extend(self.match_order(&mut order));
        if order.leaves() > Decimal::ZERO {
            self.orders.push(order);
        }
        replies
    }

    fn mass_cancel(&mut self, mass_cancel_req_id: String, instrument: InstrumentKey) -> Vec<AppMessage> {
        let (cancelled, kept): (Vec<RestingOrder>, Vec<RestingOrder>) = std::mem::take(&mut self.orders)
            .into_iter()
            .partition(|o| o.instrument == instrument);
        self.orders = kept;

        let mut replies: Vec<AppMessage> = cancelled
            .iter()
            .map(|order| {
                let mut report = self.order_report(order, ExecType::Canceled, OrderStatus::Canceled);
                report.leaves_qty = Decimal::ZERO;
                AppMessage::ExecutionReport(report)
            })
            .collect();
        replies.push(AppMessage::OrderMassCancelReport(MassCancelReport {
            mass_cancel_req_id,
            instrument: Some(instrument),
            accepted: true,
            total_affected: cancelled.len() as u32,
            text: None,
        }));
        replies
    }

    /// Walk every mid one tick at most, republish subscribed books and fill
    /// resting orders the new ladder crosses
    fn tick<R: Rng>(&mut self, rng: &mut R) -> Vec<AppMessage> {
        let tick = self.config.tick_size;
        let depth = self.config.depth.max(1);
        let mut replies = Vec::new();
        let mut increments = Vec::new();
        let mut md_req_id = None;

        let keys: Vec<InstrumentKey> = self.books.keys().cloned().collect();
        for key in keys {
            let Some(old) = self.books.get(&key).cloned() else {
                continue;
            };
            let step = Decimal::from(rng.gen_range(-1i64..=1));
            let floor = tick * Decimal::from(depth as u64 + 1);
            let mid = (old.mid + step * tick).max(floor);
            if mid == old.mid {
                continue;
            }
            let new = SimBook::around(mid, tick, depth);

            if let Some(sub) = self.subscriptions.get(&key) {
                self.rpt_seq += 1;
                increments.extend(book_diff(&key, &old, &new, sub.depth, self.rpt_seq));
                md_req_id.get_or_insert_with(|| sub.md_req_id.clone());
            }
            self.books.insert(key, new);
        }

        if !increments.is_empty() {
            replies.push(AppMessage::MarketDataIncremental(MarketDataIncremental {
                md_req_id,
                entries: increments,
            }));
        }

        let mut resting = std::mem::take(&mut self.orders);
        for order in resting.iter_mut() {
            replies.extend(self.match_order(order));
        }
        resting.retain(|o| o.leaves() > Decimal::ZERO);
        self.orders = resting;
        replies
    }

    fn next_exec_id(&mut self) -> String {
        self.exec_seq += 1;
        format!("X{}", self.exec_seq)
    }

    fn blank_report(&mut self, exec_type: ExecType, ord_status: OrderStatus, instrument: InstrumentKey, side: Side) -> ExecutionReport {
        ExecutionReport {
            exec_id: self.next_exec_id(),
            exec_type,
            ord_status,
            cl_ord_id: None,
            orig_cl_ord_id: None,
            venue_order_id: None,
            instrument,
            side,
            order_qty: Decimal::ZERO,
            price: None,
            last_qty: Decimal::ZERO,
            last_px: Decimal::ZERO,
            cum_qty: Decimal::ZERO,
            avg_px: Decimal::ZERO,
            leaves_qty: Decimal::ZERO,
            text: None,
            mass_status_req_id: None,
            tot_num_reports: None,
            last_rpt_requested: false,
            transact_time: chrono::Utc::now(),
        }
    }

    fn order_report(&mut self, order: &RestingOrder, exec_type: ExecType, ord_status: OrderStatus) -> ExecutionReport {
        let mut report = self.blank_report(exec_type, ord_status, order.instrument.clone(), order.side);
        report.cl_ord_id = Some(order.cl_ord_id.clone());
        if !order.venue_order_id.is_empty() {
            report.venue_order_id = Some(order.venue_order_id.clone());
        }
        report.order_qty = order.quantity;
        report.price = order.price;
        report.cum_qty = order.cum_qty;
        report.avg_px = order.avg_px;
        report.leaves_qty = order.leaves().max(Decimal::ZERO);
        report
    }
}

fn cancel_reject(
    cl_ord_id: String,
    orig_cl_ord_id: String,
    response_to: CancelRejectResponseTo,
    text: &str,
) -> AppMessage {
    AppMessage::OrderCancelReject(OrderCancelReject {
        cl_ord_id,
        orig_cl_ord_id: Some(orig_cl_ord_id),
        venue_order_id: None,
        response_to,
        ord_status: None,
        text: Some(text.to_string()),
    })
}

/// Deletes for vacated levels, then new or changed levels
fn book_diff(key: &InstrumentKey, old: &SimBook, new: &SimBook, depth: usize, seq: u64) -> Vec<MdIncrement> {
    let depth = if depth == 0 { usize::MAX } else { depth };
    let mut out = Vec::new();

    for (side, before, after) in [
        (BookSide::Bid, &old.bids, &new.bids),
        (BookSide::Offer, &old.asks, &new.asks),
    ] {
        let before: Vec<&PriceLevel> = before.iter().take(depth).collect();
        let after: Vec<&PriceLevel> = after.iter().take(depth).collect();

        for level in &before {
            if !after.iter().any(|l| l.price == level.price) {
                out.push(
                    MdIncrement::new(MdUpdateAction::Delete, key.clone(), side, level.price, Decimal::ZERO)
                        .with_seq(seq),
                );
            }
        }
        for level in &after {
            let action = match before.iter().find(|l| l.price == level.price) {
                Some(prev) if prev.quantity == level.quantity => continue,
                Some(_) => MdUpdateAction::Change,
                None => MdUpdateAction::New,
            };
            out.push(MdIncrement::new(action, key.clone(), side, level.price, level.quantity).with_seq(seq));
        }
    }
    out
}

/// "BTC-USD" or "BTC/USD" into base and quote
fn split_symbol(symbol: &str) -> Option<(String, String)> {
    let (base, quote) = symbol.split_once(['-', '/'])?;
    if base.is_empty() || quote.is_empty() {
        return None;
    }
    Some((base.to_string(), quote.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rust_decimal_macros::dec;

    fn key() -> InstrumentKey {
        InstrumentKey::new("sim", "BTC-USD")
    }

    fn sim() -> VenueSim {
        let config = PaperConfig {
            reference_price: dec!(100),
            tick_size: dec!(0.5),
            depth: 3,
            security_list_chunk: 1,
            ..Default::default()
        };
        VenueSim::new(config, vec![key(), InstrumentKey::new("sim", "ETH-USD")])
    }

    fn reports(replies: &[AppMessage]) -> Vec<&ExecutionReport> {
        replies
            .iter()
            .filter_map(|m| match m {
                AppMessage::ExecutionReport(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    fn limit(cl_ord_id: &str, side: Side, qty: Decimal, price: Decimal) -> OutboundMessage {
        OutboundMessage::NewOrderSingle {
            cl_ord_id: cl_ord_id.into(),
            account: "A".into(),
            instrument: key(),
            side,
            ord_type: OrdType::Limit,
            quantity: qty,
            price: Some(price),
        }
    }

    #[test]
    fn test_security_list_is_fragmented() {
        let replies = sim().handle(OutboundMessage::SecurityListRequest {
            security_req_id: "sl-1".into(),
        });
        assert_eq!(replies.len(), 2);
        match &replies[1] {
            AppMessage::SecurityList(f) => {
                assert!(f.last_fragment);
                assert_eq!(f.securities[0].base_currency.as_deref(), Some("ETH"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_marketable_limit_fills_level_by_level() {
        let mut sim = sim();
        // Asks: 100.5 x1, 101 x2, 101.5 x3
        let replies = sim.handle(limit("c1", Side::Buy, dec!(2), dec!(101)));
        let reports = reports(&replies);

        assert_eq!(reports[0].exec_type, ExecType::New);
        assert_eq!(reports[1].last_px, dec!(100.5));
        assert_eq!(reports[1].ord_status, OrderStatus::PartiallyFilled);
        assert_eq!(reports[2].last_qty, dec!(1));
        assert_eq!(reports[2].ord_status, OrderStatus::Filled);
        assert_eq!(reports[2].avg_px, dec!(100.75));
        assert!(sim.orders.is_empty());
        assert_eq!(sim.balances.get("BTC"), Some(&dec!(2)));
        assert_eq!(sim.balances.get("USD"), Some(&dec!(-201.5)));
    }

    #[test]
    fn test_passive_limit_rests_then_cancels() {
        let mut sim = sim();
        sim.handle(limit("c1", Side::Sell, dec!(1), dec!(105)));
        assert_eq!(sim.orders.len(), 1);

        let status = sim.handle(OutboundMessage::OrderMassStatusRequest {
            mass_status_req_id: "ms-1".into(),
            account: "A".into(),
        });
        let status = reports(&status);
        assert_eq!(status[0].ord_status, OrderStatus::New);
        assert!(status[0].last_rpt_requested);

        let replies = sim.handle(OutboundMessage::OrderCancelRequest {
            cl_ord_id: "x1".into(),
            orig_cl_ord_id: "c1".into(),
            venue_order_id: None,
            instrument: key(),
            side: Side::Sell,
        });
        let cancel = reports(&replies);
        assert_eq!(cancel[0].exec_type, ExecType::Canceled);
        assert_eq!(cancel[0].orig_cl_ord_id.as_deref(), Some("c1"));
        assert!(sim.orders.is_empty());
    }

    #[test]
    fn test_cancel_unknown_order_rejected() {
        let replies = sim().handle(OutboundMessage::OrderCancelRequest {
            cl_ord_id: "x1".into(),
            orig_cl_ord_id: "nope".into(),
            venue_order_id: None,
            instrument: key(),
            side: Side::Buy,
        });
        assert!(matches!(replies[0], AppMessage::OrderCancelReject(_)));
    }

    #[test]
    fn test_empty_mass_status_marks_last() {
        let replies = sim().handle(OutboundMessage::OrderMassStatusRequest {
            mass_status_req_id: "ms-1".into(),
            account: "A".into(),
        });
        let report = reports(&replies)[0];
        assert!(report.is_empty_status_response());
        assert!(report.last_rpt_requested);
    }

    #[test]
    fn test_mass_cancel_only_touches_instrument() {
        let mut sim = sim();
        sim.handle(limit("c1", Side::Buy, dec!(1), dec!(90)));
        sim.handle(limit("c2", Side::Buy, dec!(1), dec!(91)));

        let replies = sim.handle(OutboundMessage::OrderMassCancelRequest {
            cl_ord_id: "mc-1".into(),
            account: "A".into(),
            instrument: key(),
        });
        assert_eq!(reports(&replies).len(), 2);
        match replies.last() {
            Some(AppMessage::OrderMassCancelReport(r)) => assert_eq!(r.total_affected, 2),
            other => panic!("unexpected {:?}", other),
        }
        assert!(sim.orders.is_empty());
    }

    #[test]
    fn test_replace_reprices_and_may_fill() {
        let mut sim = sim();
        sim.handle(limit("c1", Side::Buy, dec!(1), dec!(95)));

        let replies = sim.handle(OutboundMessage::OrderCancelReplaceRequest {
            cl_ord_id: "r1".into(),
            orig_cl_ord_id: "c1".into(),
            venue_order_id: None,
            instrument: key(),
            side: Side::Buy,
            ord_type: OrdType::Limit,
            quantity: dec!(1),
            price: Some(dec!(100.5)),
        });
        let reports = reports(&replies);
        assert_eq!(reports[0].exec_type, ExecType::Replaced);
        assert_eq!(reports[0].cl_ord_id.as_deref(), Some("r1"));
        assert_eq!(reports[1].ord_status, OrderStatus::Filled);
        assert!(sim.orders.is_empty());
    }

    #[test]
    fn test_positions_include_balances() {
        let mut sim = sim();
        sim.handle(limit("c1", Side::Buy, dec!(1), dec!(101)));

        let replies = sim.handle(OutboundMessage::RequestForPositions {
            pos_req_id: "pos-1".into(),
            account: "A".into(),
        });
        match &replies[0] {
            AppMessage::RequestForPositionsAck(ack) => assert_eq!(ack.total_reports, 3),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(replies.len(), 4);
        match replies.last() {
            Some(AppMessage::PositionReport(r)) => assert!(r.last_report),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_no_positions_ack() {
        let replies = sim().handle(OutboundMessage::RequestForPositions {
            pos_req_id: "pos-1".into(),
            account: "A".into(),
        });
        match &replies[..] {
            [AppMessage::RequestForPositionsAck(ack)] => {
                assert_eq!(ack.result, PositionRequestResult::NoPositions)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_tick_publishes_sequenced_increments() {
        let mut sim = sim();
        sim.handle(OutboundMessage::MarketDataRequest {
            md_req_id: "md-1".into(),
            instruments: vec![key()],
            depth: 0,
        });
        let mut rng = StdRng::seed_from_u64(7);

        let mut saw_increment = false;
        for _ in 0..20 {
            for reply in sim.tick(&mut rng) {
                if let AppMessage::MarketDataIncremental(inc) = reply {
                    saw_increment = true;
                    assert_eq!(inc.md_req_id.as_deref(), Some("md-1"));
                    assert!(inc.entries.iter().all(|e| e.instrument == key() && e.rpt_seq.is_some()));
                }
            }
        }
        assert!(saw_increment);
    }

    #[test]
    fn test_market_data_unknown_instrument_rejected() {
        let replies = sim().handle(OutboundMessage::MarketDataRequest {
            md_req_id: "md-1".into(),
            instruments: vec![InstrumentKey::new("sim", "DOGE-USD")],
            depth: 0,
        });
        assert!(matches!(replies[0], AppMessage::MarketDataRequestReject { .. }));
    }

    #[test]
    fn test_hmac_credentials_verified() {
        let credentials = VenueCredentials {
            method: AuthMethod::HmacSha256,
            username: "paper".into(),
            secret: SecretString::new("k"),
        };
        let client = LogonAuthenticator::new(AuthMethod::HmacSha256, "paper", SecretString::new("k"));
        let fields = client.logon_fields().unwrap();
        let nonce = fields.raw_data.unwrap();

        let mut logon = FixMessage::logon(30);
        logon.set(tags::USERNAME, fields.username);
        logon.set(tags::PASSWORD, fields.password);
        logon.set(tags::RAW_DATA_LENGTH, nonce.len().to_string());
        logon.set(tags::RAW_DATA, nonce);

        let mut seen = HashSet::new();
        assert!(credentials.verify(&logon, &mut seen).is_ok());
        assert_eq!(credentials.verify(&logon, &mut seen), Err("nonce reused".to_string()));

        let wrong = VenueCredentials {
            secret: SecretString::new("other"),
            ..credentials
        };
        assert_eq!(wrong.verify(&logon, &mut HashSet::new()), Err("invalid credentials".to_string()));
    }

    #[test]
    fn test_split_symbol() {
        assert_eq!(split_symbol("BTC-USD"), Some(("BTC".into(), "USD".into())));
        assert_eq!(split_symbol("ETH/USDT"), Some(("ETH".into(), "USDT".into())));
        assert_eq!(split_symbol("XBTUSD"), None);
    }
}
