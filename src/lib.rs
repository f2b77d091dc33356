pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod session;
pub mod signing;
pub mod strategy;
pub mod venue;

pub use config::AppConfig;
pub use coordination::{GracefulShutdown, ShutdownPhase, ShutdownSignal};
pub use error::{CorrelationError, FixflowError, Result};
pub use session::{
    FixApplication, OrderBookTracker, OrderLedger, ProtocolEngine, SessionGateway, SessionNotice,
};
pub use strategy::{RandomStrategy, RunSummary, Strategy, StrategyContext, StrategyRunner};
pub use venue::{PaperVenue, VenueCredentials};
