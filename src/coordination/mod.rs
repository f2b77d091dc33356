//! Process-level coordination: shutdown signalling and teardown phases.

pub mod shutdown;

pub use shutdown::{
    install_signal_handlers, GracefulShutdown, ShutdownPhase, ShutdownSignal, ShutdownToken,
};
