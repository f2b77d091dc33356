//! Gateway and runner behaviour against a scripted protocol engine.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use fixflow::config::AppConfig;
use fixflow::coordination::GracefulShutdown;
use fixflow::domain::{
    BookSide, ExecType, ExecutionReport, InstrumentKey, MarketDataSnapshot, MdEntry, OrderRequest,
    OrderStatus, Security, Side, StrategyRunState,
};
use fixflow::error::{CorrelationError, FixflowError, Result};
use fixflow::session::{
    AppMessage, Direction, FixApplication, FixMessage, OutboundMessage, ProtocolEngine,
    SessionEvent, SessionGateway, SessionNotice,
};
use fixflow::session::message::SecurityListFragment;
use fixflow::strategy::{RandomStrategy, StrategyRunner};

/// Logs on immediately and records outbound traffic. Only the requests
/// switched on are answered, synchronously from inside `send`.
#[derive(Default)]
struct ScriptedEngine {
    app: Mutex<Option<Arc<dyn FixApplication>>>,
    sent: Mutex<Vec<OutboundMessage>>,
    stopped: Mutex<bool>,
    answer_security_list: bool,
    answer_market_data: bool,
}

impl ScriptedEngine {
    fn deliver(&self, message: AppMessage) {
        let app = self.app.lock().clone();
        if let Some(app) = app {
            app.on_app_message(message);
        }
    }

    fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().clone()
    }
}

impl ProtocolEngine for ScriptedEngine {
    fn start(&self, application: Arc<dyn FixApplication>) -> Result<()> {
        let mut logon = FixMessage::logon(30);
        application.on_admin_message(Direction::Outbound, &mut logon);
        application.on_session_event(SessionEvent::Logon);
        *self.app.lock() = Some(application);
        Ok(())
    }

    fn send(&self, message: OutboundMessage) -> Result<()> {
        self.sent.lock().push(message.clone());
        match message {
            OutboundMessage::SecurityListRequest { security_req_id } if self.answer_security_list => {
                self.deliver(AppMessage::SecurityList(SecurityListFragment {
                    security_req_id,
                    securities: vec![Security::new(btc(), dec!(0.1))],
                    last_fragment: true,
                }));
            }
            OutboundMessage::MarketDataRequest {
                md_req_id,
                instruments,
                ..
            } if self.answer_market_data => {
                for instrument in instruments {
                    self.deliver(AppMessage::MarketDataSnapshot(MarketDataSnapshot {
                        md_req_id: Some(md_req_id.clone()),
                        instrument,
                        entries: vec![
                            MdEntry::new(BookSide::Bid, dec!(99), dec!(5)),
                            MdEntry::new(BookSide::Offer, dec!(101), dec!(3)),
                        ],
                        rpt_seq: None,
                    }));
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        *self.stopped.lock() = true;
        let app = self.app.lock().take();
        if let Some(app) = app {
            app.on_session_event(SessionEvent::Logout);
        }
        Ok(())
    }
}

fn btc() -> InstrumentKey {
    InstrumentKey::new("sim", "BTC-USD")
}

fn report(cl_ord_id: &str, exec_id: &str, exec_type: ExecType, status: OrderStatus, last_qty: Decimal, cum_qty: Decimal) -> ExecutionReport {
    ExecutionReport {
        exec_id: exec_id.to_string(),
        exec_type,
        ord_status: status,
        cl_ord_id: Some(cl_ord_id.to_string()),
        orig_cl_ord_id: None,
        venue_order_id: Some("V-1".to_string()),
        instrument: btc(),
        side: Side::Buy,
        order_qty: dec!(1),
        price: Some(dec!(100)),
        last_qty,
        last_px: if last_qty.is_zero() { Decimal::ZERO } else { dec!(100) },
        cum_qty,
        avg_px: if cum_qty.is_zero() { Decimal::ZERO } else { dec!(100) },
        leaves_qty: dec!(1) - cum_qty,
        text: None,
        mass_status_req_id: None,
        tot_num_reports: None,
        last_rpt_requested: false,
        transact_time: Utc::now(),
    }
}

#[tokio::test]
async fn duplicate_fill_is_applied_once() {
    let config = AppConfig::default_paper(vec![btc()]);
    let engine = Arc::new(ScriptedEngine::default());
    let (gateway, mut notices) = SessionGateway::new(
        config.gateway_settings(),
        config.session.authenticator(),
        engine.clone(),
    );
    gateway.start().unwrap();
    assert!(matches!(notices.recv().await, Some(SessionNotice::LoggedOn)));

    let ticket = gateway
        .send_order(&OrderRequest::limit(btc(), Side::Buy, dec!(1), dec!(100)))
        .unwrap();
    let id = ticket.cl_ord_id.as_str();
    assert!(matches!(
        engine.sent().last(),
        Some(OutboundMessage::NewOrderSingle { cl_ord_id, .. }) if cl_ord_id == id
    ));

    engine.deliver(AppMessage::ExecutionReport(report(id, "E0", ExecType::New, OrderStatus::New, dec!(0), dec!(0))));
    let fill = report(id, "E1", ExecType::Trade, OrderStatus::PartiallyFilled, dec!(0.4), dec!(0.4));
    engine.deliver(AppMessage::ExecutionReport(fill.clone()));
    engine.deliver(AppMessage::ExecutionReport(fill));

    let order = gateway.ledger().order(id).unwrap();
    assert_eq!(order.status, OrderStatus::PartiallyFilled);
    assert_eq!(order.cum_qty, dec!(0.4));
    assert_eq!(gateway.ledger().position(&btc()).unwrap().quantity, dec!(0.4));

    let stats = gateway.ledger().snapshot().stats;
    assert_eq!(stats.fills_applied, 1);
    assert_eq!(stats.duplicates_skipped, 1);
}

/// Run startup against `engine` with short step timeouts and return the
/// step that timed out
async fn startup_timeout_step(engine: Arc<ScriptedEngine>) -> String {
    let mut config = AppConfig::default_paper(vec![btc()]);
    config.startup.security_list_timeout_ms = 50;
    config.startup.market_data_timeout_ms = 50;
    config.startup.snapshot_timeout_ms = 50;
    config.shutdown.cancel_timeout_ms = 50;

    let (gateway, notices) = SessionGateway::new(
        config.gateway_settings(),
        config.session.authenticator(),
        engine.clone(),
    );
    let runner = StrategyRunner::new(
        &config,
        RandomStrategy::new(config.strategy.clone()),
        gateway,
        notices,
        Arc::new(GracefulShutdown::new()),
    );
    let states = runner.subscribe_state();

    let err = tokio::time::timeout(std::time::Duration::from_secs(10), runner.run())
        .await
        .expect("startup must not hang")
        .unwrap_err();

    assert!(*engine.stopped.lock());
    assert_eq!(*states.borrow(), StrategyRunState::Stopped);
    match err {
        FixflowError::Startup { step, source } => {
            assert!(
                matches!(*source, FixflowError::Correlation(CorrelationError::Timeout { .. })),
                "expected a timeout, got {source}"
            );
            step
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn unanswered_security_list_aborts_startup() {
    let engine = Arc::new(ScriptedEngine::default());
    let step = startup_timeout_step(engine.clone()).await;

    assert_eq!(step, "reference data");
    assert!(matches!(
        engine.sent().first(),
        Some(OutboundMessage::SecurityListRequest { .. })
    ));
}

#[tokio::test]
async fn missing_first_snapshot_aborts_startup() {
    let engine = Arc::new(ScriptedEngine {
        answer_security_list: true,
        ..Default::default()
    });
    let step = startup_timeout_step(engine.clone()).await;

    assert_eq!(step, "market data");
    assert!(engine
        .sent()
        .iter()
        .any(|m| matches!(m, OutboundMessage::MarketDataRequest { .. })));
}

#[tokio::test]
async fn unanswered_position_snapshot_aborts_startup() {
    let engine = Arc::new(ScriptedEngine {
        answer_security_list: true,
        answer_market_data: true,
        ..Default::default()
    });
    let step = startup_timeout_step(engine.clone()).await;

    assert_eq!(step, "snapshot");
    let sent = engine.sent();
    assert!(sent
        .iter()
        .any(|m| matches!(m, OutboundMessage::RequestForPositions { .. })));
    assert!(sent
        .iter()
        .any(|m| matches!(m, OutboundMessage::OrderMassStatusRequest { .. })));
}
