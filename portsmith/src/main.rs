//! portsmith daemon entry point
//!
//! Loads the configuration, starts the forwarding engine, logs status
//! updates, and tears everything down on SIGINT/SIGTERM.

use std::path::PathBuf;
use std::process::ExitCode;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use portsmith::config::{self, Config};
use portsmith::{DynamicForwarder, HealthStatus};

const INSTALLED_HELPER_PATH: &str = "/usr/local/bin/portsmith-helper";

fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Prefer the installed helper, falling back to a local build.
fn find_helper() -> PathBuf {
    let installed = PathBuf::from(INSTALLED_HELPER_PATH);
    if installed.exists() {
        installed
    } else {
        PathBuf::from("bin/portsmith-helper")
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config_path = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => path,
        None => match config::find_config_path() {
            Ok(path) => path,
            Err(err) => {
                error!("failed to find config: {}", err);
                return ExitCode::FAILURE;
            }
        },
    };

    info!("loading configuration from {}", config_path.display());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            error!("failed to load config: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let mut forwarder = match DynamicForwarder::new(&config_path, config.hosts, find_helper()) {
        Ok(forwarder) => forwarder,
        Err(err) => {
            error!("failed to initialize forwarder: {}", err);
            return ExitCode::FAILURE;
        }
    };

    // Relay status updates into the log. The producer side drops on a full
    // channel, so this consumer can lag without stalling the data plane.
    if let Some(mut status_rx) = forwarder.take_status_rx() {
        tokio::spawn(async move {
            while let Some(update) = status_rx.recv().await {
                match update.health {
                    HealthStatus::Healthy => info!("status: {}", update.message),
                    HealthStatus::Degraded => warn!("status: {}", update.message),
                    HealthStatus::Error => error!("status: {}", update.message),
                }
            }
        });
    }

    info!("starting dynamic SSH forwarder");
    if let Err(err) = forwarder.start().await {
        error!("{}", err);
        return ExitCode::FAILURE;
    }

    wait_for_shutdown().await;

    info!("shutting down gracefully");
    if let Err(err) = forwarder.stop().await {
        warn!("shutdown error: {}", err);
    }
    ExitCode::SUCCESS
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                error!("failed to install SIGTERM handler: {}", err);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
