//! Service entry point: CLI, logging, configuration, database, supervisor.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use dotenv::dotenv;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use stockflow_backend::config::AppConfig;
use stockflow_backend::persist::Database;
use stockflow_backend::supervisor::{RunMode, Supervisor};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Fatal,
    Error,
    Warning,
    Info,
    Debug,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Fatal | LogLevel::Error => "error",
            LogLevel::Warning => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Realtime,
    Daily,
    Both,
}

impl From<Mode> for RunMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Realtime => RunMode::Realtime,
            Mode::Daily => RunMode::Daily,
            Mode::Both => RunMode::Both,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "stockflow", about = "Market-data ingestion service")]
struct Cli {
    /// Log level for stdout and the rotated file under logs/.
    #[arg(value_enum, ignore_case = true)]
    log_level: Option<LogLevel>,
    /// Which halves of the service to run.
    #[arg(value_enum, ignore_case = true)]
    mode: Option<Mode>,
}

fn init_tracing(level: LogLevel) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all("logs").context("failed to create logs directory")?;
    let file_appender = tracing_appender::rolling::daily("logs", "stockflow.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("stockflow_backend={}", level.directive())));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_level.unwrap_or(LogLevel::Info))?;

    info!("stockflow backend starting");

    let config_path = AppConfig::default_path();
    let cfg = AppConfig::load(&config_path)
        .with_context(|| format!("configuration fault ({})", config_path.display()))?;

    let db = Arc::new(
        Database::connect(&cfg.db)
            .await
            .context("database connection fault")?,
    );

    let supervisor = Supervisor::new(cfg, db);
    let shutdown = supervisor.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; shutting down");
            shutdown.request_stop();
        }
    });

    supervisor
        .run(cli.mode.unwrap_or(Mode::Realtime).into())
        .await?;

    info!("stockflow backend stopped");
    Ok(())
}
