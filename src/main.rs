//! # OSD Bridge
//!
//! Normalize drone and remote-controller OSD telemetry and republish it over
//! MQTT or InfluxDB.
//!
//! # Usage
//!
//! ```bash
//! osd-bridge [CONFIG]
//! ```
//!
//! The configuration path is the first argument, else `$OSD_BRIDGE_CONFIG`,
//! else `config/default.toml`.
//!
//! # Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Clean shutdown after SIGINT/SIGTERM |
//! | 1 | Logging could not be initialized |
//! | 2 | Configuration missing or invalid |
//! | 3 | A sink or the inbound transport was unreachable at startup |

use anyhow::{anyhow, Context};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

use osd_bridge::bridge::Bridge;
use osd_bridge::config::{Config, LoggingConfig};
use osd_bridge::error::{EXIT_CONFIG, EXIT_OTHER};

/// Config file used when neither an argument nor the env var is given
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Env var naming the config file
const CONFIG_ENV: &str = "OSD_BRIDGE_CONFIG";

#[tokio::main]
async fn main() -> ExitCode {
    let path = config_path(std::env::args().nth(1), std::env::var(CONFIG_ENV).ok());

    let config = match Config::load(&path) {
        Ok(config) => config,
        Err(e) => {
            // Logging is configured by the file we could not load
            let _guard = init_logging(&LoggingConfig::default()).ok();
            error!(path = %path, error = %e, "Failed to load configuration");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let _guard = match init_logging(&config.logging) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("osd-bridge: {:#}", e);
            return ExitCode::from(EXIT_OTHER);
        }
    };

    info!("OSD Bridge v{} starting...", env!("CARGO_PKG_VERSION"));
    info!(path = %path, "Configuration loaded");

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let bridge = match Bridge::start(&config, cancel).await {
        Ok(bridge) => bridge,
        Err(e) => {
            error!(error = %e, "Startup failed");
            return ExitCode::from(e.exit_code());
        }
    };

    let report = bridge.run().await;
    info!(
        received = report.packets.received,
        normalized = report.packets.normalized,
        "Exiting"
    );

    ExitCode::SUCCESS
}

/// Pick the config file: argument, then env var, then the default
fn config_path(arg: Option<String>, env: Option<String>) -> String {
    arg.or(env)
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
}

/// Install the global subscriber
///
/// `RUST_LOG` wins over `logging.level`. Output goes to stdout, or to a
/// daily-rotated file when `logging.directory` is set. The returned guard
/// flushes the non-blocking writer on drop and must live until exit.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .with_context(|| format!("invalid log level '{}'", config.level))?;

    let (writer, guard) = match &config.directory {
        Some(directory) => {
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("osd-bridge")
                .filename_suffix("log")
                .build(directory)
                .with_context(|| format!("cannot write logs to {}", directory))?;
            tracing_appender::non_blocking(appender)
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(config.directory.is_none())
        .try_init()
        .map_err(|e| anyhow!(e))?;

    Ok(guard)
}

/// Cancel `cancel` on SIGINT or SIGTERM
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable, listening for Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
