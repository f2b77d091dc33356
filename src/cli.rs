use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::AppConfig;

#[derive(Parser)]
#[command(name = "fixflow")]
#[command(author = "Fixflow Team")]
#[command(version = "0.1.0")]
#[command(about = "Buy-side FIX session engine and strategy runner", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config directory (default.toml plus FIXFLOW_ENV overlay)
    #[arg(short, long, global = true, default_value = "config", env = "FIXFLOW_CONFIG_DIR")]
    pub config: PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the random strategy through a full session
    Run {
        /// Trade against the in-process paper venue
        #[arg(long)]
        paper: bool,
        /// Write the session summary here (overrides shutdown.export_dir)
        #[arg(long)]
        export_dir: Option<PathBuf>,
        /// Stop the strategy after this many seconds
        #[arg(long)]
        run_timeout_secs: Option<u64>,
    },
    /// Load and validate configuration, then exit
    CheckConfig,
}

/// Human-readable configuration summary for `check-config`
pub fn describe_config(config: &AppConfig) -> String {
    let join = |keys: &[crate::domain::InstrumentKey]| {
        keys.iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    };

    let mut out = String::new();
    out.push_str(&format!(
        "session   {} -> {} @ {}:{} (account {}, auth {})\n",
        config.session.sender_comp_id,
        config.session.target_comp_id,
        config.session.host,
        config.session.port,
        config.session.account,
        config.session.auth_method,
    ));
    out.push_str(&format!("trading   {}\n", join(&config.instruments.trading)));
    if !config.instruments.market.is_empty() {
        out.push_str(&format!("market    {}\n", join(&config.instruments.market)));
    }
    out.push_str(&format!(
        "startup   logon {}ms, security list {}ms, market data {}ms, snapshot {}ms\n",
        config.startup.logon_timeout_ms,
        config.startup.security_list_timeout_ms,
        config.startup.market_data_timeout_ms,
        config.startup.snapshot_timeout_ms,
    ));
    out.push_str(&format!(
        "shutdown  cancel on exit {}, mass cancel {}, timeout {}ms\n",
        config.shutdown.cancel_orders_on_exit,
        config.shutdown.use_mass_cancel,
        config.shutdown.cancel_timeout_ms,
    ));
    out.push_str(&format!(
        "strategy  qty {} every {}ms, {:?} / {:?}, timeout {}s",
        config.strategy.quantity,
        config.strategy.trade_interval_ms,
        config.strategy.trading_mode,
        config.strategy.trading_direction,
        config.strategy.run_timeout_secs,
    ));
    out
}
