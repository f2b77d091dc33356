//! Order & position ledger.
//!
//! Orders, fills, positions and wallet balances live here and change only
//! through execution reports (plus the local pending markers set when a
//! request is sent). Fills are deduplicated per order chain by exec id.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::domain::{
    ExecType, ExecutionReport, InstrumentKey, InstrumentTable, OrdType, Order, OrderCancelReject,
    OrderRequest, OrderStatus, Position, PositionReport, ReplaceParams, Side,
};
use crate::error::{FixflowError, Result};

/// Result of feeding one report to the ledger
#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    Applied {
        order: Order,
        /// Set when the report carried a fill
        position: Option<Position>,
    },
    /// Exec id already seen for this order chain
    Duplicate { reference: String, exec_id: String },
    /// No local order matched; recorded as a reconciliation warning
    Unknown {
        reference: String,
        warning: ReconciliationWarning,
    },
    /// Matched an order but was not applicable (terminal order, bad edge)
    Ignored {
        cl_ord_id: String,
        reason: String,
        /// Set when the report was recorded as a reconciliation warning
        warning: Option<ReconciliationWarning>,
    },
}

impl ApplyOutcome {
    pub fn order(&self) -> Option<&Order> {
        match self {
            ApplyOutcome::Applied { order, .. } => Some(order),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationWarning {
    pub reference: String,
    pub exec_id: Option<String>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub orders_recorded: u64,
    pub reports_applied: u64,
    pub fills_applied: u64,
    pub duplicates_skipped: u64,
    pub unknown_reports: u64,
    pub warnings: u64,
}

/// Serializable copy of everything the ledger holds
#[derive(Debug, Clone, Serialize)]
pub struct LedgerSnapshot {
    pub orders: Vec<Order>,
    pub positions: Vec<Position>,
    pub balances: BTreeMap<String, Decimal>,
    pub warnings: Vec<ReconciliationWarning>,
    pub stats: LedgerStats,
}

#[derive(Debug)]
struct TrackedOrder {
    order: Order,
    exec_ids: HashSet<String>,
    /// Terms of an outstanding replace
    replace: Option<ReplaceParams>,
}

impl TrackedOrder {
    fn new(order: Order) -> Self {
        Self {
            order,
            exec_ids: HashSet::new(),
            replace: None,
        }
    }
}

/// What applying a report did to the matched order
enum Effect {
    Updated,
    Filled { side: Side, qty: Decimal, px: Decimal },
    Replaced(Box<Order>),
}

#[derive(Default)]
struct LedgerState {
    working: HashMap<String, TrackedOrder>,
    archived: HashMap<String, TrackedOrder>,
    by_venue_id: HashMap<String, String>,
    /// cancel/replace request id -> targeted order
    amend_requests: HashMap<String, String>,
    positions: HashMap<InstrumentKey, Position>,
    balances: BTreeMap<String, Decimal>,
    currencies: HashMap<InstrumentKey, (String, String)>,
    unmatched: Vec<ExecutionReport>,
    unmatched_exec_ids: HashSet<String>,
    warnings: Vec<ReconciliationWarning>,
    stats: LedgerStats,
}

impl LedgerState {
    fn contains(&self, id: &str) -> bool {
        self.working.contains_key(id) || self.archived.contains_key(id)
    }

    fn tracked(&self, id: &str) -> Option<&TrackedOrder> {
        self.working.get(id).or_else(|| self.archived.get(id))
    }

    fn resolve_id(&self, id: &str) -> Option<String> {
        if self.contains(id) {
            return Some(id.to_string());
        }
        self.amend_requests.get(id).cloned()
    }

    /// cl_ord_id, then orig_cl_ord_id, then venue order id
    fn resolve(&self, cl_ord_id: Option<&str>, orig: Option<&str>, venue_id: Option<&str>) -> Option<String> {
        cl_ord_id
            .and_then(|id| self.resolve_id(id))
            .or_else(|| orig.and_then(|id| self.resolve_id(id)))
            .or_else(|| venue_id.and_then(|id| self.by_venue_id.get(id).cloned()))
    }

    fn warn(&mut self, reference: &str, exec_id: Option<&str>, message: impl Into<String>) -> ReconciliationWarning {
        let message = message.into();
        warn!(reference, exec_id = exec_id.unwrap_or(""), "Reconciliation warning: {}", message);
        self.stats.warnings += 1;
        let warning = ReconciliationWarning {
            reference: reference.to_string(),
            exec_id: exec_id.map(str::to_string),
            message,
            timestamp: Utc::now(),
        };
        self.warnings.push(warning.clone());
        warning
    }

    fn bind_venue_id(&mut self, cl_ord_id: &str, venue_id: Option<&str>) {
        let Some(venue_id) = venue_id else { return };
        if let Some(tracked) = self.working.get_mut(cl_ord_id) {
            if tracked.order.venue_order_id.is_none() {
                tracked.order.venue_order_id = Some(venue_id.to_string());
            }
        }
        self.by_venue_id
            .insert(venue_id.to_string(), cl_ord_id.to_string());
    }

    fn archive_if_terminal(&mut self, cl_ord_id: &str) {
        let terminal = self
            .working
            .get(cl_ord_id)
            .map_or(false, |t| t.order.is_terminal());
        if terminal {
            if let Some(tracked) = self.working.remove(cl_ord_id) {
                self.amend_requests.retain(|_, target| target != cl_ord_id);
                self.archived.insert(cl_ord_id.to_string(), tracked);
            }
        }
    }

    fn apply_fill_to_position(&mut self, instrument: &InstrumentKey, side: Side, qty: Decimal, px: Decimal) -> Position {
        let position = self
            .positions
            .entry(instrument.clone())
            .or_insert_with(|| Position::flat(instrument.clone()));
        position.apply_fill(side, qty, px);
        let position = position.clone();

        if let Some((base, quote)) = self.currencies.get(instrument).cloned() {
            let signed = side.sign() * qty;
            *self.balances.entry(base).or_insert(Decimal::ZERO) += signed;
            *self.balances.entry(quote).or_insert(Decimal::ZERO) -= signed * px;
        }
        position
    }

    fn record_unknown(&mut self, report: ExecutionReport) -> ApplyOutcome {
        let reference = report.reference();
        if !report.exec_id.is_empty() && !self.unmatched_exec_ids.insert(report.exec_id.clone()) {
            self.stats.duplicates_skipped += 1;
            return ApplyOutcome::Duplicate {
                reference,
                exec_id: report.exec_id,
            };
        }

        self.stats.unknown_reports += 1;
        let message = if report.is_fill() {
            format!(
                "fill {} @ {} for unknown order; position left untouched",
                report.last_qty, report.last_px
            )
        } else {
            format!("{} report for unknown order", report.exec_type)
        };
        let warning = self.warn(&reference, Some(&report.exec_id), message);
        self.unmatched.push(report);
        ApplyOutcome::Unknown { reference, warning }
    }
}

/// Apply one report to a matched, non-terminal order
fn transition(tracked: &mut TrackedOrder, report: &ExecutionReport) -> std::result::Result<Effect, String> {
    let order = &mut tracked.order;
    let current = order.status;

    let target = match report.exec_type {
        ExecType::PendingNew => return Ok(Effect::Updated),
        ExecType::New => {
            if current == OrderStatus::PendingNew {
                OrderStatus::New
            } else {
                return Ok(Effect::Updated);
            }
        }
        ExecType::Trade => {
            if report.last_qty <= Decimal::ZERO {
                return Err(format!("trade report without quantity (last_qty {})", report.last_qty));
            }
            let cum_after = order.cum_qty + report.last_qty;
            let target = if cum_after >= order.quantity {
                OrderStatus::Filled
            } else if matches!(current, OrderStatus::PendingCancel | OrderStatus::PendingReplace) {
                current
            } else {
                OrderStatus::PartiallyFilled
            };
            if !current.can_transition_to(target) {
                return Err(format!("fill not allowed from {}", current));
            }
            order.record_fill(report.last_qty, report.last_px);
            if target == current {
                // Partial fill while a cancel/replace is outstanding
                order.pending_from = Some(OrderStatus::PartiallyFilled);
            } else {
                order.status = target;
            }
            if target.is_terminal() {
                order.pending_from = None;
            }
            return Ok(Effect::Filled {
                side: order.side,
                qty: report.last_qty,
                px: report.last_px,
            });
        }
        ExecType::PendingCancel | ExecType::PendingReplace => {
            let pending = if report.exec_type == ExecType::PendingCancel {
                OrderStatus::PendingCancel
            } else {
                OrderStatus::PendingReplace
            };
            if current == pending {
                return Ok(Effect::Updated);
            }
            if !current.is_amendable() {
                return Err(format!("{} ack while {}", pending, current));
            }
            order.pending_from = Some(current);
            pending
        }
        ExecType::Canceled => OrderStatus::Canceled,
        ExecType::Expired => OrderStatus::Expired,
        ExecType::Rejected => match current {
            OrderStatus::PendingNew => OrderStatus::Rejected,
            OrderStatus::PendingCancel | OrderStatus::PendingReplace => {
                order.pending_from.take().unwrap_or(OrderStatus::New)
            }
            _ => return Err(format!("reject while {}", current)),
        },
        ExecType::Replaced => {
            if current != OrderStatus::PendingReplace {
                return Err(format!("replace ack while {}", current));
            }
            let new_id = match report.cl_ord_id.as_deref() {
                Some(id) if id != order.cl_ord_id => id.to_string(),
                _ => return Err("replace ack without a new client order id".to_string()),
            };
            let params = tracked.replace.take().unwrap_or_default();
            let order = &mut tracked.order;

            let mut replacement = order.clone();
            replacement.cl_ord_id = new_id;
            replacement.orig_cl_ord_id = Some(order.cl_ord_id.clone());
            replacement.venue_order_id = report
                .venue_order_id
                .clone()
                .or_else(|| order.venue_order_id.clone());
            replacement.quantity = if report.order_qty > Decimal::ZERO {
                report.order_qty
            } else {
                params.quantity.unwrap_or(order.quantity)
            };
            replacement.price = report.price.or(params.price).or(order.price);
            replacement.cum_qty = report.cum_qty;
            if report.avg_px > Decimal::ZERO {
                replacement.avg_px = report.avg_px;
            }
            replacement.pending_from = None;
            replacement.status = if replacement.cum_qty >= replacement.quantity {
                OrderStatus::Filled
            } else if replacement.cum_qty > Decimal::ZERO {
                OrderStatus::PartiallyFilled
            } else {
                OrderStatus::New
            };
            replacement.created_at = Utc::now();
            replacement.updated_at = replacement.created_at;

            order.status = OrderStatus::Replaced;
            order.pending_from = None;
            order.updated_at = Utc::now();
            return Ok(Effect::Replaced(Box::new(replacement)));
        }
        ExecType::Restated | ExecType::OrderStatus => {
            if report.cum_qty > order.cum_qty {
                return Err(format!(
                    "venue cum qty {} ahead of local {}; fills missing",
                    report.cum_qty, order.cum_qty
                ));
            }
            if report.ord_status == current {
                return Ok(Effect::Updated);
            }
            report.ord_status
        }
    };

    if !current.can_transition_to(target) {
        return Err(format!("{} -> {} not allowed", current, target));
    }
    if !matches!(target, OrderStatus::PendingCancel | OrderStatus::PendingReplace) {
        order.pending_from = None;
    }
    if target == OrderStatus::New || target == OrderStatus::PartiallyFilled {
        tracked.replace = None;
    }
    let order = &mut tracked.order;
    order.status = target;
    if report.text.is_some() {
        order.text = report.text.clone();
    }
    order.updated_at = Utc::now();
    Ok(Effect::Updated)
}

/// Authoritative in-memory store of orders, fills, positions and balances
#[derive(Default)]
pub struct OrderLedger {
    state: RwLock<LedgerState>,
}

impl OrderLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly submitted order as PendingNew
    pub fn record_new_order(&self, cl_ord_id: &str, request: &OrderRequest) -> Result<Order> {
        let mut state = self.state.write();
        if state.contains(cl_ord_id) {
            return Err(FixflowError::Validation(format!(
                "client order id {} already in use",
                cl_ord_id
            )));
        }
        let order = Order::from_request(cl_ord_id, request);
        state
            .working
            .insert(cl_ord_id.to_string(), TrackedOrder::new(order.clone()));
        state.stats.orders_recorded += 1;
        Ok(order)
    }

    /// Order never reached the venue
    pub fn reject_locally(&self, cl_ord_id: &str, reason: &str) -> Option<Order> {
        let mut state = self.state.write();
        let order = {
            let tracked = state.working.get_mut(cl_ord_id)?;
            if tracked.order.status != OrderStatus::PendingNew {
                return None;
            }
            tracked.order.status = OrderStatus::Rejected;
            tracked.order.text = Some(reason.to_string());
            tracked.order.updated_at = Utc::now();
            tracked.order.clone()
        };
        state.archive_if_terminal(cl_ord_id);
        Some(order)
    }

    pub fn mark_pending_cancel(&self, cl_ord_id: &str, request_id: &str) -> Result<Order> {
        self.mark_pending(cl_ord_id, request_id, OrderStatus::PendingCancel, None)
    }

    pub fn mark_pending_replace(&self, cl_ord_id: &str, request_id: &str, params: ReplaceParams) -> Result<Order> {
        self.mark_pending(cl_ord_id, request_id, OrderStatus::PendingReplace, Some(params))
    }

    fn mark_pending(
        &self,
        cl_ord_id: &str,
        request_id: &str,
        pending: OrderStatus,
        params: Option<ReplaceParams>,
    ) -> Result<Order> {
        let mut state = self.state.write();
        let Some(tracked) = state.working.get_mut(cl_ord_id) else {
            return Err(FixflowError::UnknownReference(format!(
                "no working order {}",
                cl_ord_id
            )));
        };

        let current = tracked.order.status;
        if !current.is_amendable() {
            return Err(FixflowError::InvalidOrderTransition {
                cl_ord_id: cl_ord_id.to_string(),
                from: current,
                to: pending,
            });
        }

        tracked.order.pending_from = Some(current);
        tracked.order.status = pending;
        tracked.order.updated_at = Utc::now();
        tracked.replace = params;
        let order = tracked.order.clone();

        state
            .amend_requests
            .insert(request_id.to_string(), cl_ord_id.to_string());
        Ok(order)
    }

    /// Undo a pending marker (request could not be sent)
    pub fn revert_pending(&self, cl_ord_id: &str, request_id: &str) -> Option<Order> {
        let mut state = self.state.write();
        state.amend_requests.remove(request_id);
        let tracked = state.working.get_mut(cl_ord_id)?;
        if !matches!(
            tracked.order.status,
            OrderStatus::PendingCancel | OrderStatus::PendingReplace
        ) {
            return None;
        }
        tracked.order.status = tracked.order.pending_from.take().unwrap_or(OrderStatus::New);
        tracked.replace = None;
        Some(tracked.order.clone())
    }

    /// Apply an execution report
    pub fn apply_execution_report(&self, report: ExecutionReport) -> ApplyOutcome {
        let mut state = self.state.write();

        let Some(cl_ord_id) = state.resolve(
            report.cl_ord_id.as_deref(),
            report.orig_cl_ord_id.as_deref(),
            report.venue_order_id.as_deref(),
        ) else {
            return state.record_unknown(report);
        };

        let Some(tracked) = state.tracked(&cl_ord_id) else {
            return state.record_unknown(report);
        };

        if !report.exec_id.is_empty() && tracked.exec_ids.contains(&report.exec_id) {
            state.stats.duplicates_skipped += 1;
            debug!(cl_ord_id = %cl_ord_id, exec_id = %report.exec_id, "Duplicate execution report skipped");
            return ApplyOutcome::Duplicate {
                reference: cl_ord_id,
                exec_id: report.exec_id,
            };
        }

        if tracked.order.is_terminal() {
            let status = tracked.order.status;
            let reason = format!("{} report for {} order", report.exec_type, status);
            if let Some(tracked) = state.archived.get_mut(&cl_ord_id) {
                tracked.exec_ids.insert(report.exec_id.clone());
            }
            let warning = state.warn(&cl_ord_id, Some(&report.exec_id), reason.clone());
            return ApplyOutcome::Ignored {
                cl_ord_id,
                reason,
                warning: Some(warning),
            };
        }

        let effect = {
            let Some(tracked) = state.working.get_mut(&cl_ord_id) else {
                return state.record_unknown(report);
            };
            let effect = transition(tracked, &report);
            if effect.is_ok() && !report.exec_id.is_empty() {
                tracked.exec_ids.insert(report.exec_id.clone());
            }
            effect
        };

        let effect = match effect {
            Ok(effect) => effect,
            Err(reason) => {
                let warning = state.warn(&cl_ord_id, Some(&report.exec_id), reason.clone());
                return ApplyOutcome::Ignored {
                    cl_ord_id,
                    reason,
                    warning: Some(warning),
                };
            }
        };

        state.stats.reports_applied += 1;
        state.bind_venue_id(&cl_ord_id, report.venue_order_id.as_deref());

        let mut position = None;
        let order = match effect {
            Effect::Updated => state.working.get(&cl_ord_id).map(|t| t.order.clone()),
            Effect::Filled { side, qty, px } => {
                state.stats.fills_applied += 1;
                let order = state.working.get(&cl_ord_id).map(|t| t.order.clone());
                if let Some(order) = &order {
                    if order.cum_qty > order.quantity {
                        let msg = format!("overfill: cum {} > qty {}", order.cum_qty, order.quantity);
                        state.warn(&cl_ord_id, Some(&report.exec_id), msg);
                    }
                    position = Some(state.apply_fill_to_position(&order.instrument, side, qty, px));
                }
                order
            }
            Effect::Replaced(replacement) => {
                let replacement = *replacement;
                let new_id = replacement.cl_ord_id.clone();
                let exec_ids = state
                    .working
                    .get(&cl_ord_id)
                    .map(|t| t.exec_ids.clone())
                    .unwrap_or_default();
                state.amend_requests.remove(&new_id);
                if let Some(venue_id) = &replacement.venue_order_id {
                    state.by_venue_id.insert(venue_id.clone(), new_id.clone());
                }
                info!(old = %cl_ord_id, new = %new_id, qty = %replacement.quantity, "Order replaced");
                state.working.insert(
                    new_id.clone(),
                    TrackedOrder {
                        order: replacement.clone(),
                        exec_ids,
                        replace: None,
                    },
                );
                state.archive_if_terminal(&cl_ord_id);
                state.archive_if_terminal(&new_id);
                return ApplyOutcome::Applied {
                    order: replacement,
                    position: None,
                };
            }
        };

        state.archive_if_terminal(&cl_ord_id);
        let order = order.or_else(|| state.tracked(&cl_ord_id).map(|t| t.order.clone()));
        match order {
            Some(order) => ApplyOutcome::Applied { order, position },
            None => ApplyOutcome::Ignored {
                cl_ord_id,
                reason: "order vanished while applying".to_string(),
                warning: None,
            },
        }
    }

    /// Restore the pre-request status after a cancel/replace reject
    pub fn apply_cancel_reject(&self, reject: &OrderCancelReject) -> ApplyOutcome {
        let mut state = self.state.write();

        let target = state.resolve(
            Some(reject.cl_ord_id.as_str()),
            reject.orig_cl_ord_id.as_deref(),
            reject.venue_order_id.as_deref(),
        );
        let Some(cl_ord_id) = target else {
            let reference = reject.orig_cl_ord_id.clone().unwrap_or_else(|| reject.cl_ord_id.clone());
            state.stats.unknown_reports += 1;
            let warning = state.warn(&reference, None, "cancel reject for unknown order");
            return ApplyOutcome::Unknown { reference, warning };
        };
        state.amend_requests.remove(&reject.cl_ord_id);

        let restored = match state.working.get_mut(&cl_ord_id) {
            Some(tracked)
                if matches!(
                    tracked.order.status,
                    OrderStatus::PendingCancel | OrderStatus::PendingReplace
                ) =>
            {
                let restore = tracked.order.pending_from.take().unwrap_or(OrderStatus::New);
                tracked.order.status = restore;
                tracked.order.text = reject.text.clone();
                tracked.order.updated_at = Utc::now();
                tracked.replace = None;
                Some(tracked.order.clone())
            }
            _ => None,
        };

        match restored {
            Some(order) => {
                info!(cl_ord_id = %cl_ord_id, status = %order.status, reason = ?reject.text, "Cancel/replace rejected, status restored");
                state.stats.reports_applied += 1;
                ApplyOutcome::Applied {
                    order,
                    position: None,
                }
            }
            None => {
                // Typically "too late to cancel" after a fill already closed the order
                debug!(cl_ord_id = %cl_ord_id, "Cancel reject for order with nothing pending");
                ApplyOutcome::Ignored {
                    cl_ord_id,
                    reason: "no cancel/replace outstanding".to_string(),
                    warning: None,
                }
            }
        }
    }

    /// Seed or sync orders from an order mass status response. Positions are
    /// not touched.
    pub fn load_working_orders(&self, reports: &[ExecutionReport]) -> usize {
        let mut state = self.state.write();
        let mut loaded = 0;

        for report in reports {
            if report.ord_status.is_terminal() {
                continue;
            }
            let existing = state.resolve(
                report.cl_ord_id.as_deref(),
                report.orig_cl_ord_id.as_deref(),
                report.venue_order_id.as_deref(),
            );

            let cl_ord_id = match existing {
                Some(id) => {
                    if let Some(tracked) = state.working.get_mut(&id) {
                        tracked.order.status = report.ord_status;
                        tracked.order.cum_qty = tracked.order.cum_qty.max(report.cum_qty);
                        if report.avg_px > Decimal::ZERO {
                            tracked.order.avg_px = report.avg_px;
                        }
                        tracked.order.updated_at = Utc::now();
                        if !report.exec_id.is_empty() {
                            tracked.exec_ids.insert(report.exec_id.clone());
                        }
                    }
                    id
                }
                None => {
                    let id = report.cl_ord_id.clone().unwrap_or_else(|| {
                        format!("venue-{}", report.venue_order_id.as_deref().unwrap_or(&report.exec_id))
                    });
                    let now = Utc::now();
                    let order = Order {
                        cl_ord_id: id.clone(),
                        orig_cl_ord_id: None,
                        venue_order_id: report.venue_order_id.clone(),
                        instrument: report.instrument.clone(),
                        side: report.side,
                        ord_type: if report.price.is_some() {
                            OrdType::Limit
                        } else {
                            OrdType::Market
                        },
                        quantity: report.order_qty,
                        price: report.price,
                        cum_qty: report.cum_qty,
                        avg_px: report.avg_px,
                        status: report.ord_status,
                        pending_from: None,
                        text: report.text.clone(),
                        created_at: now,
                        updated_at: now,
                    };
                    let mut tracked = TrackedOrder::new(order);
                    if !report.exec_id.is_empty() {
                        tracked.exec_ids.insert(report.exec_id.clone());
                    }
                    state.working.insert(id.clone(), tracked);
                    state.stats.orders_recorded += 1;
                    id
                }
            };
            state.bind_venue_id(&cl_ord_id, report.venue_order_id.as_deref());
            loaded += 1;
        }

        info!(loaded, "Loaded working orders from venue snapshot");
        loaded
    }

    /// Overwrite positions and balances from a position snapshot
    pub fn load_positions(&self, reports: &[PositionReport]) {
        let mut state = self.state.write();
        state.positions.clear();
        state.balances.clear();

        for report in reports {
            if let Some(instrument) = &report.instrument {
                let mut position = Position::flat(instrument.clone());
                position.quantity = report.quantity;
                position.avg_price = report.avg_price.unwrap_or(Decimal::ZERO);
                state.positions.insert(instrument.clone(), position);
            } else if let Some(currency) = &report.currency {
                state.balances.insert(currency.clone(), report.quantity);
            }
        }

        info!(
            positions = state.positions.len(),
            balances = state.balances.len(),
            "Loaded position snapshot"
        );
    }

    /// Compare an unsolicited venue position report with local state
    pub fn check_position_report(&self, report: &PositionReport) -> Option<ReconciliationWarning> {
        let mut state = self.state.write();
        let (reference, local) = match (&report.instrument, &report.currency) {
            (Some(instrument), _) => (
                instrument.to_string(),
                state
                    .positions
                    .get(instrument)
                    .map_or(Decimal::ZERO, |p| p.quantity),
            ),
            (None, Some(currency)) => (
                currency.clone(),
                state.balances.get(currency).copied().unwrap_or(Decimal::ZERO),
            ),
            (None, None) => return None,
        };

        if local == report.quantity {
            return None;
        }
        Some(state.warn(
            &reference,
            None,
            format!("venue reports {} but ledger holds {}", report.quantity, local),
        ))
    }

    /// Remember base/quote currencies so fills can move wallet balances
    pub fn register_instruments(&self, table: &InstrumentTable) {
        let mut state = self.state.write();
        for security in table.iter() {
            if let Some(pair) = security.currencies() {
                state.currencies.insert(security.key.clone(), pair);
            }
        }
    }

    pub fn order(&self, cl_ord_id: &str) -> Option<Order> {
        self.state.read().tracked(cl_ord_id).map(|t| t.order.clone())
    }

    /// Orders not yet in a terminal status (PendingNew included)
    pub fn live_orders(&self) -> Vec<Order> {
        let state = self.state.read();
        let mut orders: Vec<_> = state.working.values().map(|t| t.order.clone()).collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        orders
    }

    /// Orders accepted by the venue and not yet terminal
    pub fn working_orders(&self) -> Vec<Order> {
        self.live_orders()
            .into_iter()
            .filter(|o| o.status.is_working())
            .collect()
    }

    pub fn has_live_orders(&self) -> bool {
        !self.state.read().working.is_empty()
    }

    pub fn position(&self, instrument: &InstrumentKey) -> Option<Position> {
        self.state.read().positions.get(instrument).cloned()
    }

    pub fn positions(&self) -> Vec<Position> {
        let mut positions: Vec<_> = self.state.read().positions.values().cloned().collect();
        positions.sort_by(|a, b| a.instrument.cmp(&b.instrument));
        positions
    }

    pub fn balance(&self, currency: &str) -> Option<Decimal> {
        self.state.read().balances.get(currency).copied()
    }

    pub fn balances(&self) -> BTreeMap<String, Decimal> {
        self.state.read().balances.clone()
    }

    pub fn warnings(&self) -> Vec<ReconciliationWarning> {
        self.state.read().warnings.clone()
    }

    pub fn unmatched_reports(&self) -> Vec<ExecutionReport> {
        self.state.read().unmatched.clone()
    }

    pub fn stats(&self) -> LedgerStats {
        self.state.read().stats
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.state.read();
        let mut orders: Vec<Order> = state
            .working
            .values()
            .chain(state.archived.values())
            .map(|t| t.order.clone())
            .collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let mut positions: Vec<Position> = state.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.instrument.cmp(&b.instrument));

        LedgerSnapshot {
            orders,
            positions,
            balances: state.balances.clone(),
            warnings: state.warnings.clone(),
            stats: state.stats,
        }
    }
}
