//! Kiosk Diagnostics Agent - Main Entry Point

use anyhow::{Context, Result};
use clap::Parser;
use kiosk_agent::{build_service, execute, init_logging, install_metrics, AgentConfig, Operation};
use obd_driver::CancelSignal;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "kiosk-agent")]
#[command(about = "Run one OBD-II diagnostic operation and print the result as JSON")]
struct Args {
    /// Configuration file (TOML); KIOSK_AGENT_* variables override it
    #[arg(short, long, env = "KIOSK_AGENT_CONFIG")]
    config: Option<String>,

    /// Pretty-print the JSON output
    #[arg(long)]
    pretty: bool,

    #[command(subcommand)]
    operation: Operation,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = AgentConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    init_logging(&config.logging)?;
    install_metrics(&config.metrics)?;

    info!("=== Kiosk Agent v{} ===", env!("CARGO_PKG_VERSION"));

    let service = build_service(&config).await?;
    if args.operation.needs_adapter() {
        service
            .connect(CancelSignal::never())
            .await
            .context("Failed to connect to the adapter")?;
    }

    let output = execute(&service, &args.operation).await;
    if args.operation.needs_adapter() {
        service.disconnect().await;
    }
    let output = output?;

    let text = if args.pretty {
        serde_json::to_string_pretty(&output)?
    } else {
        serde_json::to_string(&output)?
    };
    println!("{}", text);
    Ok(())
}
