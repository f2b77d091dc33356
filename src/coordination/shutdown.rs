//! Shutdown coordination
//!
//! OS signals and strategy completion both funnel into one
//! [`GracefulShutdown`]; the runner reports its teardown progress through
//! [`ShutdownPhase`] so the binary can observe it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM / SIGINT
    Graceful,
    /// SIGQUIT; skips cancel-on-exit
    Urgent,
    /// Strategy reported its work complete
    StrategyComplete,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Urgent => write!(f, "urgent"),
            ShutdownSignal::StrategyComplete => write!(f, "strategy_complete"),
        }
    }
}

/// Teardown phase tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// Not shutting down
    Running,
    /// Cancel or mass-cancel requests going out
    CancellingOrders,
    /// Waiting for the working set to drain
    AwaitingCancels,
    /// Strategy on_stop callback
    NotifyingStrategy,
    /// Logout sent, engine stopping
    LoggingOut,
    /// Writing the session summary
    ExportingSummary,
    /// Shutdown complete
    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Running => write!(f, "running"),
            ShutdownPhase::CancellingOrders => write!(f, "cancelling_orders"),
            ShutdownPhase::AwaitingCancels => write!(f, "awaiting_cancels"),
            ShutdownPhase::NotifyingStrategy => write!(f, "notifying_strategy"),
            ShutdownPhase::LoggingOut => write!(f, "logging_out"),
            ShutdownPhase::ExportingSummary => write!(f, "exporting_summary"),
            ShutdownPhase::Complete => write!(f, "complete"),
        }
    }
}

/// Graceful shutdown coordinator
pub struct GracefulShutdown {
    shutdown_requested: Arc<AtomicBool>,
    phase: watch::Sender<ShutdownPhase>,
    signal_tx: broadcast::Sender<ShutdownSignal>,
}

impl Default for GracefulShutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl GracefulShutdown {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(ShutdownPhase::Running);
        let (signal_tx, _) = broadcast::channel(8);

        Self {
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            phase,
            signal_tx,
        }
    }

    /// Subscribe to shutdown signals
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.signal_tx.subscribe()
    }

    /// Get a receiver for phase changes
    pub fn phase_receiver(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase.subscribe()
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    /// Request shutdown; only the first request is acted on
    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already requested, ignoring duplicate signal: {}", signal);
            return;
        }

        info!("Shutdown requested: {}", signal);
        let _ = self.signal_tx.send(signal);
    }

    pub fn set_phase(&self, phase: ShutdownPhase) {
        self.phase.send_replace(phase);
        info!("Shutdown phase: {}", phase);
    }

    /// Create a token for checking shutdown status in async tasks
    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            shutdown_requested: self.shutdown_requested.clone(),
            signal_rx: self.signal_tx.subscribe(),
            phase_rx: self.phase.subscribe(),
        }
    }
}

/// Token for checking shutdown status in async tasks
pub struct ShutdownToken {
    shutdown_requested: Arc<AtomicBool>,
    signal_rx: broadcast::Receiver<ShutdownSignal>,
    phase_rx: watch::Receiver<ShutdownPhase>,
}

impl ShutdownToken {
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Resolve once shutdown is requested, including requests made before
    /// the token existed
    pub async fn wait_for_shutdown(&mut self) -> ShutdownSignal {
        if self.is_shutdown_requested() {
            if let Ok(signal) = self.signal_rx.try_recv() {
                return signal;
            }
            return ShutdownSignal::Graceful;
        }
        match self.signal_rx.recv().await {
            Ok(signal) => signal,
            Err(_) => ShutdownSignal::Urgent,
        }
    }

    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase_rx.borrow()
    }

    /// Wait for specific phase
    pub async fn wait_for_phase(&mut self, target: ShutdownPhase) {
        while *self.phase_rx.borrow() != target {
            if self.phase_rx.changed().await.is_err() {
                break;
            }
        }
    }
}

/// Route OS signals into the coordinator
pub async fn install_signal_handlers(shutdown: Arc<GracefulShutdown>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        for (kind, name, urgency) in [
            (SignalKind::terminate(), "SIGTERM", ShutdownSignal::Graceful),
            (SignalKind::interrupt(), "SIGINT", ShutdownSignal::Graceful),
            (SignalKind::quit(), "SIGQUIT", ShutdownSignal::Urgent),
        ] {
            let mut stream = match signal(kind) {
                Ok(stream) => stream,
                Err(e) => {
                    error!(signal = name, error = %e, "Failed to install signal handler");
                    continue;
                }
            };
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                stream.recv().await;
                info!("Received {}", name);
                shutdown.request_shutdown(urgency);
            });
        }
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
                return;
            }
            info!("Received Ctrl+C");
            shutdown.request_shutdown(ShutdownSignal::Graceful);
        });
    }
}
