//! Kiosk Diagnostics Agent
//!
//! Wires configuration, logging, the Prometheus exporter, the event store and
//! the diagnostic service together for the `kiosk-agent` binary.

mod commands;
mod config;

pub use commands::{execute, Operation};
pub use config::{AgentConfig, LoggingConfig, MetricsConfig, ENV_PREFIX};

use metrics_exporter_prometheus::PrometheusBuilder;
use obd_driver::ObdDriver;
use obd_session::DiagnosticService;
use std::str::FromStr;
use thiserror::Error;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Invalid log level: {0}")]
    LogLevel(String),

    #[error("Failed to set tracing subscriber: {0}")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("Failed to start metrics exporter: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),
}

/// Initialize logging
pub fn init_logging(config: &LoggingConfig) -> Result<(), AgentError> {
    let level =
        Level::from_str(&config.level).map_err(|_| AgentError::LogLevel(config.level.clone()))?;
    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr);

    if config.json {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }
    Ok(())
}

/// Serve `/metrics` when enabled. Must run inside the tokio runtime.
pub fn install_metrics(config: &MetricsConfig) -> Result<(), AgentError> {
    if !config.enabled {
        return Ok(());
    }
    PrometheusBuilder::new()
        .with_http_listener(config.listen)
        .install()?;
    info!("Prometheus exporter listening on {}", config.listen);
    Ok(())
}

/// Driver, store and session from a resolved configuration
pub async fn build_service(config: &AgentConfig) -> anyhow::Result<DiagnosticService> {
    let driver = ObdDriver::from_config(config.driver.clone(), None)?;
    let store = storage::open_store(&config.storage).await;
    info!("Event store: {}", store.describe());
    Ok(DiagnosticService::new(driver, store, config.session.clone()))
}
