//! Strategy runner
//!
//! Drives one strategy through the run-state machine: logon, reference
//! data, market data, position and working-order snapshots, the main
//! trading loop, then an orderly teardown. Engine callbacks arrive as
//! [`SessionNotice`]s and are dispatched on this task, so strategy code
//! never runs on the engine thread.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::traits::{LoopControl, Strategy, StrategyContext};
use crate::config::{AppConfig, RunnerConfig, ShutdownConfig, StartupConfig};
use crate::coordination::{GracefulShutdown, ShutdownPhase, ShutdownSignal, ShutdownToken};
use crate::domain::{InstrumentKey, InstrumentTable, StateTransition, StrategyRunState};
use crate::error::{CorrelationError, FixflowError, Result};
use crate::session::{
    GatewayStats, LedgerSnapshot, RegistryStats, SessionGateway, SessionNotice,
};

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Written at the end of every run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub strategy: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub final_state: StrategyRunState,
    pub stop_reason: String,
    pub transitions: Vec<StateTransition>,
    pub gateway: GatewayStats,
    pub registry: RegistryStats,
    pub ledger: LedgerSnapshot,
}

/// Why the run left its live states
#[derive(Debug)]
enum Exit {
    Signal(ShutdownSignal),
    Failed(FixflowError),
}

impl Exit {
    fn reason(&self) -> String {
        match self {
            Exit::Signal(signal) => signal.to_string(),
            Exit::Failed(e) => e.to_string(),
        }
    }
}

pub struct StrategyRunner<S: Strategy> {
    strategy: S,
    ctx: StrategyContext,
    gateway: Arc<SessionGateway>,
    notices: mpsc::UnboundedReceiver<SessionNotice>,
    shutdown: Arc<GracefulShutdown>,
    startup_cfg: StartupConfig,
    shutdown_cfg: ShutdownConfig,
    runner_cfg: RunnerConfig,
    subscriptions: Vec<InstrumentKey>,
    trading: Vec<InstrumentKey>,
    state: StrategyRunState,
    transitions: Vec<StateTransition>,
    state_tx: watch::Sender<StrategyRunState>,
    strategy_notified: bool,
}

impl<S: Strategy> StrategyRunner<S> {
    pub fn new(
        config: &AppConfig,
        strategy: S,
        gateway: Arc<SessionGateway>,
        notices: mpsc::UnboundedReceiver<SessionNotice>,
        shutdown: Arc<GracefulShutdown>,
    ) -> Self {
        let trading = config.instruments.trading.clone();
        let ctx = StrategyContext::new(gateway.clone(), trading.clone());
        let (state_tx, _) = watch::channel(StrategyRunState::Initializing);

        Self {
            strategy,
            ctx,
            gateway,
            notices,
            shutdown,
            startup_cfg: config.startup.clone(),
            shutdown_cfg: config.shutdown.clone(),
            runner_cfg: config.runner.clone(),
            subscriptions: config.subscription_instruments(),
            trading,
            state: StrategyRunState::Initializing,
            transitions: Vec::new(),
            state_tx,
            strategy_notified: false,
        }
    }

    pub fn state(&self) -> StrategyRunState {
        self.state
    }

    /// Observe run-state changes; subscribe before calling [`run`](Self::run)
    pub fn subscribe_state(&self) -> watch::Receiver<StrategyRunState> {
        self.state_tx.subscribe()
    }

    /// Run to completion. Fails if startup failed or the session dropped;
    /// teardown and summary export happen either way.
    pub async fn run(mut self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let mut token = self.shutdown.token();
        info!(strategy = self.strategy.name(), "Strategy runner starting");

        let startup = tokio::select! {
            result = self.startup() => result.map(|_| None),
            signal = token.wait_for_shutdown() => Ok(Some(signal)),
        };

        let exit = match startup {
            Ok(None) => self.run_loop(&mut token).await,
            Ok(Some(signal)) => {
                info!(state = %self.state, signal = %signal, "Shutdown requested during startup");
                Exit::Signal(signal)
            }
            Err(e) => {
                error!(state = %self.state, error = %e, "Startup failed");
                Exit::Failed(e)
            }
        };

        let summary = self.teardown(&exit, started_at).await;
        match exit {
            Exit::Failed(e) => Err(e),
            Exit::Signal(_) => Ok(summary),
        }
    }

    fn advance(&mut self, to: StrategyRunState, reason: &str) -> Result<()> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(FixflowError::InvalidStateTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        info!(from = %from, to = %to, reason, "Run state changed");
        self.transitions.push(StateTransition::new(from, to, reason));
        self.state = to;
        self.state_tx.send_replace(to);
        Ok(())
    }

    // ---- startup ----

    async fn startup(&mut self) -> Result<()> {
        self.advance(StrategyRunState::AwaitingLogon, "starting session")?;
        self.await_logon()
            .await
            .map_err(|e| FixflowError::startup("logon", e))?;

        self.advance(StrategyRunState::AwaitingReferenceData, "logged on")?;
        self.load_reference_data()
            .await
            .map_err(|e| FixflowError::startup("reference data", e))?;

        self.advance(StrategyRunState::AwaitingMarketData, "security list loaded")?;
        self.subscribe_market_data()
            .await
            .map_err(|e| FixflowError::startup("market data", e))?;

        self.advance(StrategyRunState::AwaitingSnapshot, "books initialized")?;
        self.load_snapshots()
            .await
            .map_err(|e| FixflowError::startup("snapshot", e))?;

        self.advance(StrategyRunState::Ready, "snapshots loaded")?;
        self.strategy_notified = true;
        self.strategy
            .on_ready(&self.ctx)
            .await
            .map_err(|e| FixflowError::startup("strategy ready", e))?;

        self.advance(StrategyRunState::Running, "strategy ready")
    }

    async fn await_logon(&mut self) -> Result<()> {
        self.gateway.start()?;

        let timeout = self.startup_cfg.logon_timeout();
        let notices = &mut self.notices;
        let wait = async {
            while let Some(notice) = notices.recv().await {
                match notice {
                    SessionNotice::LoggedOn => return Ok(()),
                    SessionNotice::Disconnected | SessionNotice::LoggedOut => {
                        return Err(FixflowError::SessionDisconnect(
                            "session closed before logon".to_string(),
                        ));
                    }
                    SessionNotice::Rejected { reference, text } if reference == "logon" => {
                        return Err(FixflowError::Auth(text));
                    }
                    other => debug!(notice = ?other, "Notice before logon"),
                }
            }
            Err(FixflowError::SessionDisconnect(
                "notice channel closed".to_string(),
            ))
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(CorrelationError::Timeout {
                request_id: "logon".to_string(),
                elapsed_ms: timeout.as_millis() as u64,
            }
            .into()),
        }
    }

    async fn load_reference_data(&mut self) -> Result<()> {
        let completion = self
            .gateway
            .request_security_list()?
            .wait(self.startup_cfg.security_list_timeout())
            .await?;

        let table = InstrumentTable::from_securities(completion.securities());
        let missing = table.missing(self.subscriptions.iter());
        if !missing.is_empty() {
            let names: Vec<String> = missing.iter().map(ToString::to_string).collect();
            return Err(FixflowError::Validation(format!(
                "instruments not in security list: {}",
                names.join(", ")
            )));
        }

        info!(securities = table.len(), fragments_ms = completion.elapsed.as_millis() as u64, "Security list received");
        self.gateway.install_instruments(table);
        Ok(())
    }

    async fn subscribe_market_data(&mut self) -> Result<()> {
        let completion = self
            .gateway
            .request_market_data(&self.subscriptions)?
            .wait(self.startup_cfg.market_data_timeout())
            .await?;
        info!(
            instruments = completion.snapshot_instruments().len(),
            "Initial book snapshots received"
        );
        Ok(())
    }

    async fn load_snapshots(&mut self) -> Result<()> {
        let timeout = self.startup_cfg.snapshot_timeout();
        let positions = self.gateway.request_position_snapshot()?;
        let orders = self.gateway.request_working_orders()?;

        let (positions, orders) = tokio::join!(positions.wait(timeout), orders.wait(timeout));
        let positions = positions?;
        let orders = orders?;

        let ledger = self.gateway.ledger();
        let reports = positions.position_reports();
        ledger.load_positions(&reports);
        let loaded = ledger.load_working_orders(&orders.execution_reports());
        info!(positions = reports.len(), working_orders = loaded, "Snapshots loaded");
        Ok(())
    }

    // ---- running ----

    async fn run_loop(&mut self, token: &mut ShutdownToken) -> Exit {
        let mut ticker = tokio::time::interval(self.runner_cfg.loop_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                signal = token.wait_for_shutdown() => {
                    return Exit::Signal(signal);
                }

                notice = self.notices.recv() => {
                    let Some(notice) = notice else {
                        return Exit::Failed(FixflowError::SessionDisconnect(
                            "notice channel closed".to_string(),
                        ));
                    };
                    if let Err(e) = self.dispatch_batch(notice).await {
                        return Exit::Failed(e);
                    }
                }

                _ = ticker.tick() => {
                    match self.strategy.main_trading_loop(&self.ctx).await {
                        Ok(LoopControl::Continue) => {}
                        Ok(LoopControl::Complete) => {
                            info!(strategy = self.strategy.name(), "Strategy reported completion");
                            self.shutdown.request_shutdown(ShutdownSignal::StrategyComplete);
                        }
                        Err(e) => {
                            error!(strategy = self.strategy.name(), error = %e, "Main trading loop failed");
                            return Exit::Failed(e);
                        }
                    }
                }
            }
        }
    }

    /// Dispatch one notice plus whatever else is already queued, bounded
    /// so the trading loop is not starved
    async fn dispatch_batch(&mut self, first: SessionNotice) -> Result<()> {
        self.dispatch(first).await?;
        for _ in 1..self.runner_cfg.max_notices_per_tick.max(1) {
            match self.notices.try_recv() {
                Ok(notice) => self.dispatch(notice).await?,
                Err(_) => break,
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, notice: SessionNotice) -> Result<()> {
        let (kind, result) = match &notice {
            SessionNotice::Disconnected => {
                return Err(FixflowError::SessionDisconnect(
                    "connection lost".to_string(),
                ));
            }
            SessionNotice::LoggedOut => {
                return Err(FixflowError::SessionDisconnect(
                    "logged out by venue".to_string(),
                ));
            }
            SessionNotice::LoggedOn => {
                debug!("Logon notice while running");
                return Ok(());
            }
            SessionNotice::Rejected { reference, text } => {
                warn!(reference = %reference, text = %text, "Venue reject");
                return Ok(());
            }
            SessionNotice::Warning(warning) => {
                warn!(
                    reference = %warning.reference,
                    exec_id = ?warning.exec_id,
                    warning = %warning.message,
                    "Reconciliation warning"
                );
                return Ok(());
            }
            SessionNotice::OrderUpdated(order) => (
                "order",
                self.strategy.on_order_update(&self.ctx, order).await,
            ),
            SessionNotice::PositionUpdated(position) => (
                "position",
                self.strategy.on_position_update(&self.ctx, position).await,
            ),
            SessionNotice::BookUpdated(instrument) => (
                "book",
                self.strategy.on_book_update(&self.ctx, instrument).await,
            ),
        };

        if let Err(e) = result {
            warn!(strategy = self.strategy.name(), callback = kind, error = %e, "Strategy callback failed");
        }
        Ok(())
    }

    // ---- teardown ----

    async fn teardown(&mut self, exit: &Exit, started_at: DateTime<Utc>) -> RunSummary {
        let reason = exit.reason();
        if let Err(e) = self.advance(StrategyRunState::Stopping, &reason) {
            error!(error = %e, "Could not enter Stopping");
        }
        if !self.shutdown.is_shutdown_requested() {
            let signal = match exit {
                Exit::Signal(signal) => *signal,
                Exit::Failed(_) => ShutdownSignal::Urgent,
            };
            self.shutdown.request_shutdown(signal);
        }

        let urgent = matches!(exit, Exit::Signal(ShutdownSignal::Urgent));
        if self.shutdown_cfg.cancel_orders_on_exit
            && !urgent
            && self.gateway.session_state().is_connected()
        {
            self.shutdown.set_phase(ShutdownPhase::CancellingOrders);
            let mut cancelled = HashSet::new();
            self.cancel_open_orders(&mut cancelled).await;

            self.shutdown.set_phase(ShutdownPhase::AwaitingCancels);
            self.await_cancels(&mut cancelled).await;
        } else if self.gateway.ledger().has_live_orders() {
            warn!(
                live_orders = self.gateway.ledger().live_orders().len(),
                "Leaving live orders at the venue"
            );
        }

        if self.strategy_notified {
            self.shutdown.set_phase(ShutdownPhase::NotifyingStrategy);
            if let Err(e) = self.strategy.on_stop(&self.ctx).await {
                warn!(strategy = self.strategy.name(), error = %e, "Strategy on_stop failed");
            }
        }

        self.shutdown.set_phase(ShutdownPhase::LoggingOut);
        if let Err(e) = self.gateway.logout() {
            warn!(error = %e, "Logout failed");
        }

        if let Err(e) = self.advance(StrategyRunState::Stopped, "teardown complete") {
            error!(error = %e, "Could not enter Stopped");
        }

        let summary = RunSummary {
            strategy: self.strategy.name().to_string(),
            started_at,
            finished_at: Utc::now(),
            final_state: self.state,
            stop_reason: reason,
            transitions: self.transitions.clone(),
            gateway: self.gateway.stats(),
            registry: self.gateway.registry().stats(),
            ledger: self.gateway.ledger().snapshot(),
        };

        if let Some(dir) = self.shutdown_cfg.export_dir.clone() {
            self.shutdown.set_phase(ShutdownPhase::ExportingSummary);
            match export_summary(&summary, &dir).await {
                Ok(path) => info!(path = %path.display(), "Session summary written"),
                Err(e) => error!(dir = %dir.display(), error = %e, "Failed to write session summary"),
            }
        }

        self.shutdown.set_phase(ShutdownPhase::Complete);
        info!(
            strategy = %summary.strategy,
            reason = %summary.stop_reason,
            orders_sent = summary.gateway.orders_sent,
            fills = summary.ledger.stats.fills_applied,
            "Strategy runner stopped"
        );
        summary
    }

    /// Mass cancel per instrument where configured, single cancels otherwise
    /// or when a mass cancel is refused
    async fn cancel_open_orders(&mut self, cancelled: &mut HashSet<String>) {
        if !self.shutdown_cfg.use_mass_cancel {
            let sent = self.cancel_amendable(cancelled);
            info!(cancels = sent, "Cancel requests sent");
            return;
        }

        let mut instruments = self.trading.clone();
        for order in self.gateway.ledger().live_orders() {
            if !instruments.contains(&order.instrument) {
                instruments.push(order.instrument);
            }
        }

        let mut tokens = Vec::with_capacity(instruments.len());
        for instrument in instruments {
            match self.gateway.request_mass_cancel(&instrument) {
                Ok(token) => tokens.push((instrument, token)),
                Err(e) => warn!(instrument = %instrument, error = %e, "Mass cancel not sent"),
            }
        }

        let deadline = Instant::now() + self.shutdown_cfg.cancel_timeout();
        let mut fallback = false;
        for (instrument, token) in tokens {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match token.wait(remaining).await {
                Ok(completion) => {
                    let affected: u32 = completion
                        .mass_cancel_reports()
                        .iter()
                        .map(|r| r.total_affected)
                        .sum();
                    info!(instrument = %instrument, affected, "Mass cancel acknowledged");
                }
                Err(e) => {
                    warn!(instrument = %instrument, error = %e, "Mass cancel failed");
                    fallback = true;
                }
            }
        }

        if fallback {
            let sent = self.cancel_amendable(cancelled);
            info!(cancels = sent, "Fell back to single cancels");
        }
    }

    /// Cancel every amendable order not already asked for
    fn cancel_amendable(&self, cancelled: &mut HashSet<String>) -> usize {
        let mut sent = 0;
        for order in self.gateway.ledger().live_orders() {
            if !order.status.is_amendable() || cancelled.contains(&order.cl_ord_id) {
                continue;
            }
            match self.gateway.cancel_order(&order.cl_ord_id) {
                Ok(_) => {
                    cancelled.insert(order.cl_ord_id);
                    sent += 1;
                }
                Err(e) => debug!(cl_ord_id = %order.cl_ord_id, error = %e, "Cancel not sent"),
            }
        }
        sent
    }

    /// Wait for the live set to drain. Orders still PendingNew when the
    /// cancels went out are cancelled once the venue acknowledges them.
    async fn await_cancels(&mut self, cancelled: &mut HashSet<String>) -> bool {
        let deadline = Instant::now() + self.shutdown_cfg.cancel_timeout();
        let single = !self.shutdown_cfg.use_mass_cancel;

        loop {
            if !self.drain_notices().await {
                return false;
            }

            let ledger = self.gateway.ledger();
            if !ledger.has_live_orders() {
                info!("All orders closed");
                // Updates that closed the last orders may have landed after the drain
                return self.drain_notices().await;
            }
            if Instant::now() >= deadline {
                warn!(live_orders = ledger.live_orders().len(), "Cancel timeout elapsed with live orders");
                return false;
            }
            if single {
                self.cancel_amendable(cancelled);
            }
            tokio::time::sleep(CANCEL_POLL_INTERVAL).await;
        }
    }

    /// Hand queued notices to the strategy so it sees the final order
    /// states before `on_stop`. False once the session has closed.
    async fn drain_notices(&mut self) -> bool {
        while let Ok(notice) = self.notices.try_recv() {
            let closed = if self.strategy_notified {
                self.dispatch(notice).await.is_err()
            } else {
                matches!(notice, SessionNotice::Disconnected | SessionNotice::LoggedOut)
            };
            if closed {
                warn!("Session closed while awaiting cancels");
                return false;
            }
        }
        true
    }
}

/// Write `summary` as pretty JSON into `dir`, named by its finish time
pub async fn export_summary(summary: &RunSummary, dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let name = format!(
        "session-summary-{}.json",
        summary.finished_at.format("%Y%m%d-%H%M%S%.3f")
    );
    let path = dir.join(name);
    let body = serde_json::to_vec_pretty(summary)?;
    tokio::fs::write(&path, body).await?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::session::engine::MockProtocolEngine;
    use crate::session::SessionGateway;
    use async_trait::async_trait;

    struct IdleStrategy;

    #[async_trait]
    impl Strategy for IdleStrategy {
        fn name(&self) -> &str {
            "idle"
        }

        async fn main_trading_loop(&mut self, _ctx: &StrategyContext) -> Result<LoopControl> {
            Ok(LoopControl::Continue)
        }
    }

    fn config() -> AppConfig {
        let mut config = AppConfig::default_paper(vec![InstrumentKey::new("sim", "BTC-USD")]);
        config.startup.logon_timeout_ms = 50;
        config
    }

    fn runner(engine: MockProtocolEngine, config: &AppConfig) -> StrategyRunner<IdleStrategy> {
        let (gateway, notices) =
            SessionGateway::new(config.gateway_settings(), config.session.authenticator(), Arc::new(engine));
        StrategyRunner::new(
            config,
            IdleStrategy,
            gateway,
            notices,
            Arc::new(GracefulShutdown::new()),
        )
    }

    #[tokio::test]
    async fn test_logon_timeout_aborts_startup() {
        let mut engine = MockProtocolEngine::new();
        engine.expect_start().returning(|_| Ok(()));
        engine.expect_stop().returning(|| Ok(()));
        let config = config();

        let runner = runner(engine, &config);
        let states = runner.subscribe_state();
        let err = runner.run().await.unwrap_err();

        match err {
            FixflowError::Startup { step, source } => {
                assert_eq!(step, "logon");
                assert!(matches!(
                    *source,
                    FixflowError::Correlation(CorrelationError::Timeout { .. })
                ));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(*states.borrow(), StrategyRunState::Stopped);
    }

    #[tokio::test]
    async fn test_engine_start_failure_is_fatal() {
        let mut engine = MockProtocolEngine::new();
        engine
            .expect_start()
            .returning(|_| Err(FixflowError::Engine("connection refused".into())));
        engine.expect_stop().returning(|| Ok(()));
        let config = config();

        let err = runner(engine, &config).run().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_shutdown_during_startup_stops_cleanly() {
        let mut engine = MockProtocolEngine::new();
        engine.expect_start().returning(|_| Ok(()));
        engine.expect_stop().returning(|| Ok(()));
        let mut config = config();
        config.startup.logon_timeout_ms = 10_000;

        let runner = runner(engine, &config);
        let shutdown = runner.shutdown.clone();
        let handle = tokio::spawn(runner.run());
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.request_shutdown(ShutdownSignal::Graceful);

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.final_state, StrategyRunState::Stopped);
        assert_eq!(summary.stop_reason, "graceful");
        let path: Vec<_> = summary.transitions.iter().map(|t| t.to).collect();
        assert_eq!(
            path,
            vec![
                StrategyRunState::AwaitingLogon,
                StrategyRunState::Stopping,
                StrategyRunState::Stopped
            ]
        );
        assert_eq!(shutdown.current_phase(), ShutdownPhase::Complete);
    }

    #[test]
    fn test_invalid_advance_rejected() {
        let mut engine = MockProtocolEngine::new();
        engine.expect_start().returning(|_| Ok(()));
        let config = config();
        let mut runner = runner(engine, &config);

        assert!(runner.advance(StrategyRunState::Running, "skip ahead").is_err());
        assert_eq!(runner.state(), StrategyRunState::Initializing);
        assert!(runner.advance(StrategyRunState::AwaitingLogon, "start").is_ok());
        assert_eq!(runner.transitions.len(), 1);
    }

    #[tokio::test]
    async fn test_export_summary_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = crate::session::OrderLedger::new();
        let summary = RunSummary {
            strategy: "idle".into(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            final_state: StrategyRunState::Stopped,
            stop_reason: "graceful".into(),
            transitions: vec![StateTransition::new(
                StrategyRunState::Initializing,
                StrategyRunState::AwaitingLogon,
                "starting session",
            )],
            gateway: GatewayStats::default(),
            registry: RegistryStats::default(),
            ledger: ledger.snapshot(),
        };

        let path = export_summary(&summary, &dir.path().join("out")).await.unwrap();
        let body = std::fs::read_to_string(path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["final_state"], "Stopped");
        assert_eq!(value["transitions"][0]["to"], "AwaitingLogon");
    }
}
