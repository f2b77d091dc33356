//! Strategy layer
//!
//! - `traits` - the [`Strategy`] callbacks and the [`StrategyContext`] handle
//! - `runner` - run-state machine driving one strategy against a session
//! - `random` - example strategy placing small random orders
//! - `rate_limit` - sliding-window order throttle

pub mod random;
pub mod rate_limit;
pub mod runner;
pub mod traits;

pub use random::{RandomStrategy, RandomStrategyStats};
pub use rate_limit::SlidingWindowLimiter;
pub use runner::{export_summary, RunSummary, StrategyRunner};
pub use traits::{LoopControl, Strategy, StrategyContext};
