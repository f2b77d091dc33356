//! Request/response correlation.
//!
//! Every data request registers a pending entry keyed by its request id.
//! Chunks accumulate until the terminal one arrives, then the entry is
//! removed and its oneshot fired, so a completion can be delivered at most
//! once. The delivering side never blocks on the waiter.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::message::MassCancelReport;
use crate::domain::{ExecutionReport, InstrumentKey, PositionReport, Security};
use crate::error::CorrelationError;

/// Kinds of correlated request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    SecurityList,
    MarketData,
    PositionSnapshot,
    OrderMassStatus,
    MassCancel,
}

impl RequestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::SecurityList => "security_list",
            RequestKind::MarketData => "market_data",
            RequestKind::PositionSnapshot => "position_snapshot",
            RequestKind::OrderMassStatus => "order_mass_status",
            RequestKind::MassCancel => "mass_cancel",
        }
    }

    /// Prefix for generated request ids
    pub fn id_prefix(&self) -> &'static str {
        match self {
            RequestKind::SecurityList => "sl",
            RequestKind::MarketData => "md",
            RequestKind::PositionSnapshot => "pos",
            RequestKind::OrderMassStatus => "ms",
            RequestKind::MassCancel => "mc",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One accumulated piece of a response
#[derive(Debug, Clone)]
pub enum ResponseItem {
    Security(Security),
    Order(ExecutionReport),
    Position(PositionReport),
    Snapshot(InstrumentKey),
    MassCancel(MassCancelReport),
}

/// Delivered once the terminal chunk has been seen
#[derive(Debug, Clone)]
pub struct Completion {
    pub request_id: String,
    pub kind: RequestKind,
    pub items: Vec<ResponseItem>,
    pub elapsed: Duration,
}

impl Completion {
    pub fn securities(&self) -> Vec<Security> {
        self.items
            .iter()
            .filter_map(|i| match i {
                ResponseItem::Security(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn execution_reports(&self) -> Vec<ExecutionReport> {
        self.items
            .iter()
            .filter_map(|i| match i {
                ResponseItem::Order(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn position_reports(&self) -> Vec<PositionReport> {
        self.items
            .iter()
            .filter_map(|i| match i {
                ResponseItem::Position(p) => Some(p.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn snapshot_instruments(&self) -> Vec<InstrumentKey> {
        self.items
            .iter()
            .filter_map(|i| match i {
                ResponseItem::Snapshot(k) => Some(k.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn mass_cancel_reports(&self) -> Vec<MassCancelReport> {
        self.items
            .iter()
            .filter_map(|i| match i {
                ResponseItem::MassCancel(r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }
}

type CompletionResult = std::result::Result<Completion, CorrelationError>;

/// What happened to a delivered chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    Accumulated { received: usize },
    Completed,
    /// No outstanding request with that id; chunk dropped
    Unknown,
}

struct PendingRequest {
    kind: RequestKind,
    items: Vec<ResponseItem>,
    expected_total: Option<usize>,
    awaiting: HashSet<InstrumentKey>,
    completion: oneshot::Sender<CompletionResult>,
    registered_at: Instant,
}

impl PendingRequest {
    fn is_satisfied(&self) -> bool {
        match self.kind {
            RequestKind::MarketData => self.awaiting.is_empty(),
            _ => self
                .expected_total
                .map_or(false, |total| self.items.len() >= total),
        }
    }
}

/// Counters for diagnostics and the session summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RegistryStats {
    pub registered: u64,
    pub completed: u64,
    pub failed: u64,
    pub discarded_chunks: u64,
}

#[derive(Default)]
pub struct CorrelationRegistry {
    pending: Mutex<HashMap<String, PendingRequest>>,
    registered: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

impl CorrelationRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a chunked request. Fails if the id is already outstanding.
    pub fn register(
        self: &Arc<Self>,
        request_id: impl Into<String>,
        kind: RequestKind,
    ) -> std::result::Result<CorrelationToken, CorrelationError> {
        self.insert(request_id.into(), kind, HashSet::new())
    }

    /// Register a market data subscription that completes once every
    /// instrument has produced a first snapshot.
    pub fn register_market_data(
        self: &Arc<Self>,
        request_id: impl Into<String>,
        instruments: impl IntoIterator<Item = InstrumentKey>,
    ) -> std::result::Result<CorrelationToken, CorrelationError> {
        let awaiting: HashSet<_> = instruments.into_iter().collect();
        self.insert(request_id.into(), RequestKind::MarketData, awaiting)
    }

    fn insert(
        self: &Arc<Self>,
        request_id: String,
        kind: RequestKind,
        awaiting: HashSet<InstrumentKey>,
    ) -> std::result::Result<CorrelationToken, CorrelationError> {
        let mut pending = self.pending.lock();
        if pending.contains_key(&request_id) {
            return Err(CorrelationError::Duplicate { request_id });
        }

        let (tx, rx) = oneshot::channel();
        pending.insert(
            request_id.clone(),
            PendingRequest {
                kind,
                items: Vec::new(),
                expected_total: None,
                awaiting,
                completion: tx,
                registered_at: Instant::now(),
            },
        );
        self.registered.fetch_add(1, Ordering::Relaxed);
        debug!(request_id = %request_id, kind = %kind, "Registered pending request");

        Ok(CorrelationToken {
            request_id,
            kind,
            rx,
            registry: Arc::downgrade(self),
        })
    }

    /// Accumulate a response chunk; `last` marks the end-of-list chunk.
    pub fn accept(&self, request_id: &str, items: Vec<ResponseItem>, last: bool) -> ChunkOutcome {
        let mut pending = self.pending.lock();
        let Some(entry) = pending.get_mut(request_id) else {
            drop(pending);
            self.discard(request_id, "response chunk");
            return ChunkOutcome::Unknown;
        };

        entry.items.extend(items);
        if last || entry.is_satisfied() {
            if let Some(entry) = pending.remove(request_id) {
                drop(pending);
                self.deliver(request_id, entry);
            }
            return ChunkOutcome::Completed;
        }

        ChunkOutcome::Accumulated {
            received: entry.items.len(),
        }
    }

    /// Record how many items the venue announced. Completes immediately if
    /// they have all arrived already, or if the total is zero.
    pub fn set_expected_total(&self, request_id: &str, total: usize) -> ChunkOutcome {
        let mut pending = self.pending.lock();
        let Some(entry) = pending.get_mut(request_id) else {
            drop(pending);
            self.discard(request_id, "expected total");
            return ChunkOutcome::Unknown;
        };

        entry.expected_total = Some(total);
        if entry.is_satisfied() {
            if let Some(entry) = pending.remove(request_id) {
                drop(pending);
                self.deliver(request_id, entry);
            }
            return ChunkOutcome::Completed;
        }

        ChunkOutcome::Accumulated {
            received: entry.items.len(),
        }
    }

    /// Note a first snapshot for a market data subscription. Without a
    /// request id, any subscription still waiting on the instrument matches.
    pub fn observe_snapshot(&self, md_req_id: Option<&str>, instrument: &InstrumentKey) -> ChunkOutcome {
        let mut pending = self.pending.lock();

        let request_id = match md_req_id {
            Some(id) => match pending.get(id) {
                Some(entry) if entry.kind == RequestKind::MarketData => id.to_string(),
                _ => return ChunkOutcome::Unknown,
            },
            None => {
                let found = pending.iter().find(|(_, e)| {
                    e.kind == RequestKind::MarketData && e.awaiting.contains(instrument)
                });
                match found {
                    Some((id, _)) => id.clone(),
                    None => return ChunkOutcome::Unknown,
                }
            }
        };

        let Some(entry) = pending.get_mut(&request_id) else {
            return ChunkOutcome::Unknown;
        };
        if entry.awaiting.remove(instrument) {
            entry.items.push(ResponseItem::Snapshot(instrument.clone()));
        }

        if entry.is_satisfied() {
            if let Some(entry) = pending.remove(&request_id) {
                drop(pending);
                self.deliver(&request_id, entry);
            }
            return ChunkOutcome::Completed;
        }

        ChunkOutcome::Accumulated {
            received: entry.items.len(),
        }
    }

    /// Fail one request with a venue reject
    pub fn fail(&self, request_id: &str, reason: impl Into<String>) -> bool {
        let entry = self.pending.lock().remove(request_id);
        match entry {
            Some(entry) => {
                let err = CorrelationError::Rejected {
                    request_id: request_id.to_string(),
                    reason: reason.into(),
                };
                warn!(request_id, kind = %entry.kind, error = %err, "Request failed");
                self.failed.fetch_add(1, Ordering::Relaxed);
                let _ = entry.completion.send(Err(err));
                true
            }
            None => {
                self.discard(request_id, "reject");
                false
            }
        }
    }

    /// Fail everything outstanding with a session-closing signal
    pub fn fail_all_closing(&self) -> usize {
        let drained: Vec<(String, PendingRequest)> = self.pending.lock().drain().collect();
        let count = drained.len();

        for (request_id, entry) in drained {
            debug!(request_id = %request_id, kind = %entry.kind, "Abandoning request, session closing");
            self.failed.fetch_add(1, Ordering::Relaxed);
            let _ = entry
                .completion
                .send(Err(CorrelationError::SessionClosing { request_id }));
        }

        if count > 0 {
            warn!(count, "Failed outstanding requests on session close");
        }
        count
    }

    /// Drop a request without signalling (send failure, local timeout)
    pub fn remove(&self, request_id: &str) -> bool {
        self.pending.lock().remove(request_id).is_some()
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        self.pending.lock().contains_key(request_id)
    }

    pub fn pending_kind(&self, request_id: &str) -> Option<RequestKind> {
        self.pending.lock().get(request_id).map(|e| e.kind)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            registered: self.registered.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            discarded_chunks: self.discarded.load(Ordering::Relaxed),
        }
    }

    fn deliver(&self, request_id: &str, entry: PendingRequest) {
        let elapsed = entry.registered_at.elapsed();
        let completion = Completion {
            request_id: request_id.to_string(),
            kind: entry.kind,
            items: entry.items,
            elapsed,
        };
        debug!(
            request_id,
            kind = %completion.kind,
            items = completion.items.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Request completed"
        );
        self.completed.fetch_add(1, Ordering::Relaxed);
        if entry.completion.send(Ok(completion)).is_err() {
            debug!(request_id, "Completion receiver already dropped");
        }
    }

    fn discard(&self, request_id: &str, what: &str) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
        warn!(request_id, what, "Discarding response for unknown request id");
    }
}

/// Handle returned to the requester; resolves when the response completes
pub struct CorrelationToken {
    request_id: String,
    kind: RequestKind,
    rx: oneshot::Receiver<CompletionResult>,
    registry: Weak<CorrelationRegistry>,
}

impl fmt::Debug for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CorrelationToken")
            .field("request_id", &self.request_id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl CorrelationToken {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Wait for completion. On timeout the request is withdrawn so late
    /// chunks are treated as unknown.
    pub async fn wait(self, timeout: Duration) -> CompletionResult {
        let CorrelationToken {
            request_id,
            kind,
            rx,
            registry,
        } = self;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without a result: the registry went away
            Ok(Err(_)) => Err(CorrelationError::SessionClosing { request_id }),
            Err(_) => {
                if let Some(registry) = registry.upgrade() {
                    registry.remove(&request_id);
                }
                warn!(request_id = %request_id, kind = %kind, timeout_ms = timeout.as_millis() as u64, "Request timed out");
                Err(CorrelationError::Timeout {
                    request_id,
                    elapsed_ms: timeout.as_millis() as u64,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn security(symbol: &str) -> ResponseItem {
        ResponseItem::Security(Security::new(InstrumentKey::new("sim", symbol), dec!(0.1)))
    }

    #[tokio::test]
    async fn test_chunked_security_list_completes_once() {
        let registry = CorrelationRegistry::new();
        let token = registry.register("sl-1", RequestKind::SecurityList).unwrap();

        assert_eq!(
            registry.accept("sl-1", vec![security("A"), security("B")], false),
            ChunkOutcome::Accumulated { received: 2 }
        );
        assert_eq!(
            registry.accept("sl-1", vec![security("C")], false),
            ChunkOutcome::Accumulated { received: 3 }
        );
        assert_eq!(
            registry.accept("sl-1", vec![security("D")], true),
            ChunkOutcome::Completed
        );

        // A second terminal chunk finds nothing to complete
        assert_eq!(
            registry.accept("sl-1", vec![security("E")], true),
            ChunkOutcome::Unknown
        );

        let completion = token.wait(Duration::from_secs(1)).await.unwrap();
        let symbols: Vec<_> = completion
            .securities()
            .into_iter()
            .map(|s| s.key.symbol)
            .collect();
        assert_eq!(symbols, vec!["A", "B", "C", "D"]);
        assert_eq!(registry.stats().completed, 1);
        assert_eq!(registry.stats().discarded_chunks, 1);
    }

    #[test]
    fn test_duplicate_request_id_rejected() {
        let registry = CorrelationRegistry::new();
        let _token = registry.register("pos-1", RequestKind::PositionSnapshot).unwrap();
        let err = registry
            .register("pos-1", RequestKind::PositionSnapshot)
            .unwrap_err();
        assert_eq!(
            err,
            CorrelationError::Duplicate {
                request_id: "pos-1".into()
            }
        );
    }

    #[test]
    fn test_unknown_chunk_is_discarded() {
        let registry = CorrelationRegistry::new();
        assert_eq!(
            registry.accept("nope", vec![security("A")], true),
            ChunkOutcome::Unknown
        );
        assert_eq!(registry.stats().discarded_chunks, 1);
    }

    #[tokio::test]
    async fn test_expected_total_completes() {
        let registry = CorrelationRegistry::new();
        let token = registry.register("pos-1", RequestKind::PositionSnapshot).unwrap();

        registry.set_expected_total("pos-1", 2);
        let item = ResponseItem::Position(PositionReport::balance("USD", dec!(1000)));
        assert_eq!(
            registry.accept("pos-1", vec![item.clone()], false),
            ChunkOutcome::Accumulated { received: 1 }
        );
        assert_eq!(
            registry.accept("pos-1", vec![item], false),
            ChunkOutcome::Completed
        );

        let completion = token.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(completion.position_reports().len(), 2);
    }

    #[tokio::test]
    async fn test_zero_total_completes_empty() {
        let registry = CorrelationRegistry::new();
        let token = registry.register("pos-1", RequestKind::PositionSnapshot).unwrap();

        assert_eq!(registry.set_expected_total("pos-1", 0), ChunkOutcome::Completed);
        let completion = token.wait(Duration::from_secs(1)).await.unwrap();
        assert!(completion.items.is_empty());
    }

    #[tokio::test]
    async fn test_market_data_waits_for_every_instrument() {
        let registry = CorrelationRegistry::new();
        let btc = InstrumentKey::new("sim", "BTC-USD");
        let eth = InstrumentKey::new("sim", "ETH-USD");
        let token = registry
            .register_market_data("md-1", vec![btc.clone(), eth.clone()])
            .unwrap();

        assert_eq!(
            registry.observe_snapshot(Some("md-1"), &btc),
            ChunkOutcome::Accumulated { received: 1 }
        );
        // Repeat snapshot for the same instrument does not count twice
        assert_eq!(
            registry.observe_snapshot(Some("md-1"), &btc),
            ChunkOutcome::Accumulated { received: 1 }
        );
        assert_eq!(registry.observe_snapshot(None, &eth), ChunkOutcome::Completed);

        let completion = token.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(completion.snapshot_instruments().len(), 2);
        assert!(!registry.is_pending("md-1"));
    }

    #[tokio::test]
    async fn test_fail_all_unblocks_with_session_closing() {
        let registry = CorrelationRegistry::new();
        let token = registry.register("pos-1", RequestKind::PositionSnapshot).unwrap();

        let waiter = tokio::spawn(token.wait(Duration::from_secs(30)));
        tokio::task::yield_now().await;
        assert_eq!(registry.fail_all_closing(), 1);

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(CorrelationError::SessionClosing { .. })));
    }

    #[tokio::test]
    async fn test_reject_fails_request() {
        let registry = CorrelationRegistry::new();
        let token = registry.register("md-1", RequestKind::MarketData).unwrap();

        assert!(registry.fail("md-1", "unknown symbol"));
        let err = token.wait(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, CorrelationError::Rejected { .. }));
    }

    #[tokio::test]
    async fn test_timeout_withdraws_request() {
        let registry = CorrelationRegistry::new();
        let token = registry.register("sl-1", RequestKind::SecurityList).unwrap();

        let err = token.wait(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, CorrelationError::Timeout { .. }));
        assert!(!registry.is_pending("sl-1"));
        assert_eq!(
            registry.accept("sl-1", vec![security("A")], true),
            ChunkOutcome::Unknown
        );
    }
}
