//! ipmonitord entry point.
//!
//! Loads the daemon configuration and an optional services snapshot, starts
//! the reconciliation worker and runs until interrupted.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use ipmonitor::config::{MonitorConfig, ServicesSnapshot};
use ipmonitor::kernel::LoggingKernel;
use ipmonitor::reconcile::LoggingPublisher;
use ipmonitor::Monitor;
use log::{error, info, warn};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Primary service election and route reconciliation daemon
#[derive(Parser, Debug)]
#[command(name = "ipmonitord")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Daemon configuration file (JSON)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Services snapshot loaded as the initial configuration (JSON)
    #[arg(short = 's', long)]
    services: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Delay before posting a network change to consumers that have not acknowledged
    #[arg(long)]
    post_delay_ms: Option<u64>,

    /// Print the resulting state as JSON after the first batch and exit
    #[arg(long)]
    dump: bool,
}

fn init_logging(args: &Args) -> anyhow::Result<()> {
    match args.log_format {
        LogFormat::Text => {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
                .try_init()
                .context("failed to initialize logger")?;
        }
        LogFormat::Json => {
            let filter = tracing_subscriber::EnvFilter::try_from_default_env()
                .or_else(|_| tracing_subscriber::EnvFilter::try_new(&args.log_level))
                .context("invalid log level")?;
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to initialize logger: {}", e))?;
        }
    }
    Ok(())
}

async fn run_daemon(args: Args) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => MonitorConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => MonitorConfig::default(),
    };
    if let Some(delay) = args.post_delay_ms {
        config.post_delay_ms = delay;
    }
    config.validate()?;

    let snapshot = match &args.services {
        Some(path) => ServicesSnapshot::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ServicesSnapshot::new(),
    };

    info!("Post delay: {}ms", config.post_delay_ms);
    info!("Rank conflict policy: {:?}", config.rank_conflict_policy);
    info!(
        "Services: {}, interfaces: {}",
        snapshot.services.len(),
        snapshot.interfaces.len()
    );
    if config.netboot {
        info!("Netboot mode: ENABLED");
    }
    info!("Route changes are logged, not written to a routing socket");

    let (monitor, handle) = Monitor::new(&config, Arc::new(LoggingKernel), Arc::new(LoggingPublisher));
    let worker = monitor.spawn();
    handle.load(snapshot).await?;

    if args.dump {
        let snapshot = handle.snapshot().await?;
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        info!("Starting event loop...");
        match tokio::signal::ctrl_c().await {
            Ok(()) => warn!("Received SIGINT, shutting down gracefully..."),
            Err(err) => error!("Failed to listen for ctrl-c: {}", err),
        }
    }

    handle.shutdown().await?;
    worker.await.context("monitor worker panicked")?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = init_logging(&args) {
        eprintln!("ipmonitord: {:#}", e);
        return ExitCode::FAILURE;
    }

    info!("====================================================================");
    info!("Starting ipmonitord");
    info!("====================================================================");

    match run_daemon(args).await {
        Ok(()) => {
            info!("ipmonitord shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("ipmonitord exiting with error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
