use anyhow::{bail, Context};
use clap::Parser;
use fixflow::cli::{self, Cli, Commands};
use fixflow::config::{AppConfig, LoggingConfig};
use fixflow::coordination::{install_signal_handlers, GracefulShutdown};
use fixflow::session::{ProtocolEngine, SessionGateway};
use fixflow::strategy::{RandomStrategy, StrategyRunner};
use fixflow::venue::{PaperVenue, VenueCredentials};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    match cli.command {
        Commands::CheckConfig => {
            init_logging_simple();
            check_config(&config)
        }
        Commands::Run {
            paper,
            export_dir,
            run_timeout_secs,
        } => {
            if let Some(dir) = export_dir {
                config.shutdown.export_dir = Some(dir);
            }
            if let Some(secs) = run_timeout_secs {
                config.strategy.run_timeout_secs = secs;
            }
            let _guard = init_logging(&config.logging);
            run(config, paper).await
        }
    }
}

fn check_config(config: &AppConfig) -> anyhow::Result<()> {
    match config.validate() {
        Ok(()) => {
            println!("{}", cli::describe_config(config));
            println!("configuration ok");
            Ok(())
        }
        Err(errors) => {
            for error in &errors {
                eprintln!("  - {}", error);
            }
            bail!("{} configuration error(s)", errors.len())
        }
    }
}

async fn run(config: AppConfig, paper: bool) -> anyhow::Result<()> {
    if let Err(errors) = config.validate() {
        bail!("invalid configuration: {}", errors.join("; "));
    }
    if !paper {
        bail!(
            "no FIX transport is bundled with this binary; pass --paper, or embed the library with your own ProtocolEngine"
        );
    }

    let engine: Arc<dyn ProtocolEngine> = Arc::new(PaperVenue::new(
        config.paper.clone(),
        config.subscription_instruments(),
        VenueCredentials::from_session(&config.session),
        config.session.heartbeat_secs,
    ));
    let (gateway, notices) =
        SessionGateway::new(config.gateway_settings(), config.session.authenticator(), engine);

    let shutdown = Arc::new(GracefulShutdown::new());
    install_signal_handlers(shutdown.clone()).await;

    let strategy = RandomStrategy::new(config.strategy.clone());
    let runner = StrategyRunner::new(&config, strategy, gateway, notices, shutdown);
    let summary = runner.run().await.context("strategy run failed")?;

    info!(
        reason = %summary.stop_reason,
        orders_sent = summary.gateway.orders_sent,
        fills = summary.ledger.stats.fills_applied,
        duplicates = summary.ledger.stats.duplicates_skipped,
        warnings = summary.ledger.stats.warnings,
        "Session finished"
    );
    Ok(())
}

/// Console logging plus an optional daily rolling file. The returned guard
/// flushes the file writer on drop.
fn init_logging(logging: &LoggingConfig) -> Option<WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info,fixflow=debug"));

    let mut guard = None;
    let file_layer = match &logging.dir {
        Some(dir) => match std::fs::create_dir_all(dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(dir, "fixflow.log");
                let (writer, file_guard) = tracing_appender::non_blocking(appender);
                guard = Some(file_guard);
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!(
                    "Warning: Could not create log directory {} ({}), file logging disabled",
                    dir.display(),
                    e
                );
                None
            }
        },
        None => None,
    };

    let (plain, json) = if logging.json {
        (None, Some(tracing_subscriber::fmt::layer().json().with_target(true)))
    } else {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
            None,
        )
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(json)
        .with(file_layer)
        .init();

    if let Some(dir) = &logging.dir {
        if guard.is_some() {
            eprintln!("Logging to: {}/fixflow.log", dir.display());
        }
    }
    guard
}

fn init_logging_simple() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}
