use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::{InstrumentKey, Side};
use crate::session::GatewaySettings;
use crate::signing::{AuthMethod, LogonAuthenticator, SecretString};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub session: SessionConfig,
    pub instruments: InstrumentsConfig,
    #[serde(default)]
    pub startup: StartupConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub book: BookConfig,
    #[serde(default)]
    pub strategy: RandomStrategyConfig,
    #[serde(default)]
    pub paper: PaperConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub sender_comp_id: String,
    pub target_comp_id: String,
    /// Trading account placed on orders and requests
    pub account: String,
    pub username: String,
    /// Password, or HMAC key in hmac_sha256 mode
    #[serde(default)]
    pub secret: SecretString,
    #[serde(default)]
    pub auth_method: AuthMethod,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u32,
    /// 0 = full book
    #[serde(default)]
    pub market_data_depth: u32,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    1238
}

fn default_heartbeat() -> u32 {
    30
}

impl SessionConfig {
    pub fn authenticator(&self) -> LogonAuthenticator {
        LogonAuthenticator::new(self.auth_method, self.username.clone(), self.secret.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentsConfig {
    /// Instruments to subscribe market data for
    #[serde(default)]
    pub market: Vec<InstrumentKey>,
    /// Instruments the strategy trades (also subscribed)
    pub trading: Vec<InstrumentKey>,
}

/// Per-step startup timeouts
#[derive(Debug, Clone, Deserialize)]
pub struct StartupConfig {
    #[serde(default = "default_logon_timeout")]
    pub logon_timeout_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub security_list_timeout_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub market_data_timeout_ms: u64,
    #[serde(default = "default_request_timeout")]
    pub snapshot_timeout_ms: u64,
}

fn default_logon_timeout() -> u64 {
    10_000
}

fn default_request_timeout() -> u64 {
    15_000
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            logon_timeout_ms: default_logon_timeout(),
            security_list_timeout_ms: default_request_timeout(),
            market_data_timeout_ms: default_request_timeout(),
            snapshot_timeout_ms: default_request_timeout(),
        }
    }
}

impl StartupConfig {
    pub fn logon_timeout(&self) -> Duration {
        Duration::from_millis(self.logon_timeout_ms)
    }

    pub fn security_list_timeout(&self) -> Duration {
        Duration::from_millis(self.security_list_timeout_ms)
    }

    pub fn market_data_timeout(&self) -> Duration {
        Duration::from_millis(self.market_data_timeout_ms)
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default = "default_true")]
    pub cancel_orders_on_exit: bool,
    /// One mass cancel per trading instrument instead of per-order cancels
    #[serde(default = "default_true")]
    pub use_mass_cancel: bool,
    #[serde(default = "default_cancel_timeout")]
    pub cancel_timeout_ms: u64,
    /// Session summary JSON is written here when set
    #[serde(default)]
    pub export_dir: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_cancel_timeout() -> u64 {
    5_000
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            cancel_orders_on_exit: true,
            use_mass_cancel: true,
            cancel_timeout_ms: default_cancel_timeout(),
            export_dir: None,
        }
    }
}

impl ShutdownConfig {
    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    /// Interval between main trading loop passes
    #[serde(default = "default_loop_interval")]
    pub loop_interval_ms: u64,
    /// Notices handed to the strategy per wakeup before yielding
    #[serde(default = "default_max_notices")]
    pub max_notices_per_tick: usize,
}

fn default_loop_interval() -> u64 {
    250
}

fn default_max_notices() -> usize {
    256
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            loop_interval_ms: default_loop_interval(),
            max_notices_per_tick: default_max_notices(),
        }
    }
}

impl RunnerConfig {
    pub fn loop_interval(&self) -> Duration {
        Duration::from_millis(self.loop_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BookConfig {
    /// Increments held per instrument while waiting for a snapshot
    #[serde(default = "default_max_buffered")]
    pub max_buffered_increments: usize,
}

fn default_max_buffered() -> usize {
    crate::session::book::DEFAULT_MAX_BUFFERED
}

impl Default for BookConfig {
    fn default() -> Self {
        Self {
            max_buffered_increments: default_max_buffered(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SymbolSelection {
    AllAtOnce,
    /// Round-robin, one instrument per pass
    OneByOne,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingDirection {
    Random,
    Alternate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    MarketOrders,
    /// Limit orders priced through the opposite side of the book
    AggressiveLimitOrders,
}

/// Parameters of the example random strategy
#[derive(Debug, Clone, Deserialize)]
pub struct RandomStrategyConfig {
    #[serde(default = "default_quantity")]
    pub quantity: Decimal,
    /// Minimum time between trading steps
    #[serde(default = "default_trade_interval")]
    pub trade_interval_ms: u64,
    /// Strategy completes after this long in Running
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,
    #[serde(default = "default_symbol_selection")]
    pub symbol_selection: SymbolSelection,
    #[serde(default = "default_trading_direction")]
    pub trading_direction: TradingDirection,
    #[serde(default = "default_initial_direction")]
    pub initial_direction: Side,
    #[serde(default = "default_trading_mode")]
    pub trading_mode: TradingMode,
    #[serde(default = "default_aggressiveness")]
    pub aggressiveness_pips: Decimal,
    #[serde(default = "default_max_orders")]
    pub max_orders_per_window: usize,
    #[serde(default = "default_rate_window")]
    pub rate_window_ms: u64,
}

fn default_quantity() -> Decimal {
    Decimal::new(1, 2)
}

fn default_trade_interval() -> u64 {
    5_000
}

fn default_run_timeout() -> u64 {
    1_800
}

fn default_symbol_selection() -> SymbolSelection {
    SymbolSelection::AllAtOnce
}

fn default_trading_direction() -> TradingDirection {
    TradingDirection::Alternate
}

fn default_initial_direction() -> Side {
    Side::Buy
}

fn default_trading_mode() -> TradingMode {
    TradingMode::AggressiveLimitOrders
}

fn default_aggressiveness() -> Decimal {
    Decimal::from(2)
}

fn default_tick() -> Decimal {
    Decimal::new(1, 1)
}

fn default_max_orders() -> usize {
    10
}

fn default_rate_window() -> u64 {
    1_000
}

impl Default for RandomStrategyConfig {
    fn default() -> Self {
        Self {
            quantity: default_quantity(),
            trade_interval_ms: default_trade_interval(),
            run_timeout_secs: default_run_timeout(),
            symbol_selection: default_symbol_selection(),
            trading_direction: default_trading_direction(),
            initial_direction: default_initial_direction(),
            trading_mode: default_trading_mode(),
            aggressiveness_pips: default_aggressiveness(),
            max_orders_per_window: default_max_orders(),
            rate_window_ms: default_rate_window(),
        }
    }
}

/// In-process simulated venue
#[derive(Debug, Clone, Deserialize)]
pub struct PaperConfig {
    #[serde(default = "default_reference_price")]
    pub reference_price: Decimal,
    #[serde(default = "default_tick")]
    pub tick_size: Decimal,
    /// Levels per side in generated books
    #[serde(default = "default_depth")]
    pub depth: usize,
    #[serde(default = "default_update_interval")]
    pub update_interval_ms: u64,
    /// Securities per security list fragment
    #[serde(default = "default_chunk")]
    pub security_list_chunk: usize,
    #[serde(default)]
    pub initial_balances: BTreeMap<String, Decimal>,
}

fn default_reference_price() -> Decimal {
    Decimal::from(100)
}

fn default_depth() -> usize {
    5
}

fn default_update_interval() -> u64 {
    500
}

fn default_chunk() -> usize {
    2
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            reference_price: default_reference_price(),
            tick_size: default_tick(),
            depth: default_depth(),
            update_interval_ms: default_update_interval(),
            security_list_chunk: default_chunk(),
            initial_balances: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Daily rolling log files go here when set
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("session.heartbeat_secs", 30)?
            .set_default("runner.loop_interval_ms", 250)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific overrides (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("FIXFLOW_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // FIXFLOW_SESSION__ACCOUNT, FIXFLOW_SESSION__SECRET, ...
            .add_source(
                Environment::with_prefix("FIXFLOW")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Configuration for a paper session against the in-process venue
    pub fn default_paper(trading: Vec<InstrumentKey>) -> Self {
        Self {
            session: SessionConfig {
                sender_comp_id: "FIXFLOW".to_string(),
                target_comp_id: "PAPER".to_string(),
                account: "PAPER-1".to_string(),
                username: "paper".to_string(),
                secret: SecretString::new("paper-secret"),
                auth_method: AuthMethod::HmacSha256,
                host: default_host(),
                port: default_port(),
                heartbeat_secs: default_heartbeat(),
                market_data_depth: 0,
            },
            instruments: InstrumentsConfig {
                market: Vec::new(),
                trading,
            },
            startup: StartupConfig::default(),
            shutdown: ShutdownConfig::default(),
            runner: RunnerConfig::default(),
            book: BookConfig::default(),
            strategy: RandomStrategyConfig::default(),
            paper: PaperConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Every instrument needing a book: market list plus trading list
    pub fn subscription_instruments(&self) -> Vec<InstrumentKey> {
        let mut keys = self.instruments.market.clone();
        for key in &self.instruments.trading {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        keys
    }

    pub fn gateway_settings(&self) -> GatewaySettings {
        GatewaySettings {
            account: self.session.account.clone(),
            heartbeat_secs: self.session.heartbeat_secs,
            market_data_depth: self.session.market_data_depth,
            max_buffered_increments: self.book.max_buffered_increments,
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.session.sender_comp_id.is_empty() || self.session.target_comp_id.is_empty() {
            errors.push("sender_comp_id and target_comp_id are required".to_string());
        }
        if self.session.account.is_empty() {
            errors.push("session.account is required".to_string());
        }
        if self.session.username.is_empty() {
            errors.push("session.username is required".to_string());
        }
        if self.session.auth_method == AuthMethod::HmacSha256 && self.session.secret.is_empty() {
            errors.push("hmac_sha256 auth requires session.secret".to_string());
        }
        if self.session.heartbeat_secs == 0 {
            errors.push("session.heartbeat_secs must be positive".to_string());
        }

        if self.instruments.trading.is_empty() {
            errors.push("instruments.trading must list at least one instrument".to_string());
        }

        let startup = &self.startup;
        for (name, value) in [
            ("logon_timeout_ms", startup.logon_timeout_ms),
            ("security_list_timeout_ms", startup.security_list_timeout_ms),
            ("market_data_timeout_ms", startup.market_data_timeout_ms),
            ("snapshot_timeout_ms", startup.snapshot_timeout_ms),
        ] {
            if value == 0 {
                errors.push(format!("startup.{name} must be positive"));
            }
        }

        if self.runner.loop_interval_ms == 0 {
            errors.push("runner.loop_interval_ms must be positive".to_string());
        }
        if self.book.max_buffered_increments == 0 {
            errors.push("book.max_buffered_increments must be positive".to_string());
        }

        let strategy = &self.strategy;
        if strategy.quantity <= Decimal::ZERO {
            errors.push("strategy.quantity must be positive".to_string());
        }
        if strategy.aggressiveness_pips < Decimal::ZERO {
            errors.push("strategy.aggressiveness_pips must not be negative".to_string());
        }
        if strategy.max_orders_per_window == 0 || strategy.rate_window_ms == 0 {
            errors.push("strategy rate limit window must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
