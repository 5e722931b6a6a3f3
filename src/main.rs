//! Rotator - Entry Point
//!
//! Runs the supervisor in the foreground until SIGINT or SIGTERM.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rotator::cli::Cli;
use rotator::config::{Config, LogConfig};
use rotator::services::{CommandFetcher, Fetcher, FileFetcher};
use rotator::Supervisor;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::from_env().and_then(|mut config| {
        cli.apply(&mut config)?;
        Ok(config)
    }) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("rotator: {}", e);
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config.log);
    info!(
        listen = %config.proxy_addr(),
        list = %config.pool.list_path.display(),
        "Starting rotator"
    );

    let fetcher: Arc<dyn Fetcher> = match &config.supervisor.fetch_command {
        Some(command) => Arc::new(CommandFetcher::new(
            command.clone(),
            config.pool.list_path.clone(),
            config.supervisor.fetch_timeout,
        )),
        None => Arc::new(FileFetcher::new(config.pool.list_path.clone())),
    };

    let supervisor = Supervisor::new(config, fetcher);
    match supervisor.run(shutdown_signal()).await {
        Ok(()) => {
            info!("Rotator stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, fatal = e.is_fatal(), "Rotator exiting");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("rotator={}", log.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("json") {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
