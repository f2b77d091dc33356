//! Full sessions against the in-process paper venue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal_macros::dec;

use fixflow::config::AppConfig;
use fixflow::coordination::{GracefulShutdown, ShutdownPhase};
use fixflow::domain::{InstrumentKey, Order, OrderRequest, OrderStatus, Side, StrategyRunState};
use fixflow::error::{FixflowError, Result};
use fixflow::session::{ProtocolEngine, SessionGateway};
use fixflow::signing::SecretString;
use fixflow::strategy::{LoopControl, RandomStrategy, Strategy, StrategyContext, StrategyRunner};
use fixflow::venue::{PaperVenue, VenueCredentials};

fn btc() -> InstrumentKey {
    InstrumentKey::new("sim", "BTC-USD")
}

fn fast_config() -> AppConfig {
    let mut config = AppConfig::default_paper(vec![btc()]);
    config.instruments.market = vec![InstrumentKey::new("sim", "ETH-USD")];
    config.strategy.trade_interval_ms = 50;
    config.strategy.run_timeout_secs = 1;
    config.runner.loop_interval_ms = 20;
    config.paper.update_interval_ms = 20;
    config.startup.logon_timeout_ms = 2_000;
    config
}

fn venue_for(config: &AppConfig, credentials: VenueCredentials) -> Arc<PaperVenue> {
    Arc::new(PaperVenue::new(
        config.paper.clone(),
        config.subscription_instruments(),
        credentials,
        config.session.heartbeat_secs,
    ))
}

#[tokio::test]
async fn random_strategy_runs_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config();
    config.shutdown.export_dir = Some(dir.path().to_path_buf());

    let venue = venue_for(&config, VenueCredentials::from_session(&config.session));
    let engine: Arc<dyn ProtocolEngine> = venue;
    let (gateway, notices) =
        SessionGateway::new(config.gateway_settings(), config.session.authenticator(), engine);
    let shutdown = Arc::new(GracefulShutdown::new());

    let runner = StrategyRunner::new(
        &config,
        RandomStrategy::new(config.strategy.clone()),
        gateway.clone(),
        notices,
        shutdown.clone(),
    );
    let summary = tokio::time::timeout(Duration::from_secs(15), runner.run())
        .await
        .expect("run should finish")
        .expect("run should succeed");

    assert_eq!(summary.final_state, StrategyRunState::Stopped);
    assert_eq!(summary.stop_reason, "strategy_complete");
    assert!(summary.gateway.orders_sent > 0, "strategy never traded");
    assert!(summary.ledger.stats.fills_applied > 0, "no fills recorded");
    assert_eq!(summary.gateway.logons, 1);
    assert!(summary
        .transitions
        .iter()
        .any(|t| t.to == StrategyRunState::Running));

    assert!(!gateway.ledger().has_live_orders());
    assert!(gateway.book(&InstrumentKey::new("sim", "ETH-USD")).is_some());
    assert_eq!(shutdown.current_phase(), ShutdownPhase::Complete);

    let exported: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .collect();
    assert_eq!(exported.len(), 1);
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(exported[0].path()).unwrap()).unwrap();
    assert_eq!(json["strategy"], "random");
    assert_eq!(json["final_state"], "Stopped");
}

#[tokio::test]
async fn wrong_hmac_secret_fails_logon() {
    let config = fast_config();
    let mut credentials = VenueCredentials::from_session(&config.session);
    credentials.secret = SecretString::new("someone-else");

    let engine: Arc<dyn ProtocolEngine> = venue_for(&config, credentials);
    let (gateway, notices) =
        SessionGateway::new(config.gateway_settings(), config.session.authenticator(), engine);
    let runner = StrategyRunner::new(
        &config,
        RandomStrategy::new(config.strategy.clone()),
        gateway.clone(),
        notices,
        Arc::new(GracefulShutdown::new()),
    );
    let states = runner.subscribe_state();

    let err = runner.run().await.unwrap_err();
    match err {
        FixflowError::Startup { step, source } => {
            assert_eq!(step, "logon");
            assert!(matches!(*source, FixflowError::SessionDisconnect(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(gateway.stats().logons, 0);
    assert_eq!(*states.borrow(), StrategyRunState::Stopped);
}

#[tokio::test]
async fn dropped_connection_stops_the_run() {
    let mut config = fast_config();
    config.strategy.run_timeout_secs = 60;

    let venue = venue_for(&config, VenueCredentials::from_session(&config.session));
    let engine: Arc<dyn ProtocolEngine> = venue.clone();
    let (gateway, notices) =
        SessionGateway::new(config.gateway_settings(), config.session.authenticator(), engine);
    let shutdown = Arc::new(GracefulShutdown::new());
    let runner = StrategyRunner::new(
        &config,
        RandomStrategy::new(config.strategy.clone()),
        gateway,
        notices,
        shutdown.clone(),
    );

    let mut states = runner.subscribe_state();
    let dropper = tokio::spawn(async move {
        states
            .wait_for(|state| *state == StrategyRunState::Running)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        venue.drop_connection();
    });

    let err = tokio::time::timeout(Duration::from_secs(15), runner.run())
        .await
        .expect("run should finish")
        .unwrap_err();
    dropper.await.unwrap();

    assert!(matches!(err, FixflowError::SessionDisconnect(_)), "got {err}");
    assert_eq!(shutdown.current_phase(), ShutdownPhase::Complete);
}

/// Rests one buy far below the market, finishes once the venue has it, and
/// records every order status it is shown
#[derive(Default)]
struct RestingOrderStrategy {
    seen: Arc<Mutex<Vec<OrderStatus>>>,
    at_stop: Arc<Mutex<Option<OrderStatus>>>,
    sent: bool,
}

#[async_trait]
impl Strategy for RestingOrderStrategy {
    fn name(&self) -> &str {
        "resting"
    }

    async fn on_order_update(&mut self, _ctx: &StrategyContext, order: &Order) -> Result<()> {
        self.seen.lock().push(order.status);
        Ok(())
    }

    async fn main_trading_loop(&mut self, ctx: &StrategyContext) -> Result<LoopControl> {
        if !self.sent {
            ctx.send_order(&OrderRequest::limit(btc(), Side::Buy, dec!(0.01), dec!(50)))?;
            self.sent = true;
        }
        if self.seen.lock().contains(&OrderStatus::New) {
            return Ok(LoopControl::Complete);
        }
        Ok(LoopControl::Continue)
    }

    async fn on_stop(&mut self, _ctx: &StrategyContext) -> Result<()> {
        *self.at_stop.lock() = self.seen.lock().last().copied();
        Ok(())
    }
}

#[tokio::test]
async fn strategy_sees_teardown_cancels_before_stop() {
    let config = fast_config();
    let venue = venue_for(&config, VenueCredentials::from_session(&config.session));
    let engine: Arc<dyn ProtocolEngine> = venue;
    let (gateway, notices) =
        SessionGateway::new(config.gateway_settings(), config.session.authenticator(), engine);

    let strategy = RestingOrderStrategy::default();
    let seen = strategy.seen.clone();
    let at_stop = strategy.at_stop.clone();
    let runner = StrategyRunner::new(
        &config,
        strategy,
        gateway.clone(),
        notices,
        Arc::new(GracefulShutdown::new()),
    );
    let summary = tokio::time::timeout(Duration::from_secs(15), runner.run())
        .await
        .expect("run should finish")
        .expect("run should succeed");

    assert_eq!(summary.stop_reason, "strategy_complete");
    assert!(!gateway.ledger().has_live_orders());
    assert!(seen.lock().contains(&OrderStatus::New));
    assert_eq!(*at_stop.lock(), Some(OrderStatus::Canceled));
}
