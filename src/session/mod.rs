//! FIX session core: message model, engine seam, correlation, ledger,
//! books, and the gateway that ties them to the engine callbacks.

pub mod book;
pub mod engine;
pub mod gateway;
pub mod ledger;
pub mod message;
pub mod registry;

pub use book::{OrderBook, OrderBookTracker};
pub use engine::{FixApplication, ProtocolEngine};
pub use gateway::{GatewaySettings, GatewayStats, SessionGateway, SessionNotice};
pub use ledger::{ApplyOutcome, LedgerSnapshot, LedgerStats, OrderLedger, ReconciliationWarning};
pub use message::{AppMessage, Direction, FixMessage, OutboundMessage, SessionEvent};
pub use registry::{
    ChunkOutcome, Completion, CorrelationRegistry, CorrelationToken, RegistryStats, RequestKind,
    ResponseItem,
};
