//! Adapter initialisation sequence

use crate::config::DriverConfig;
use crate::error::ConnectError;
use crate::metrics::SharedMetrics;
use crate::queue::CommandQueue;
use obd_protocol::ObdProtocol;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Reset first, then echo off, spaces off, headers on, automatic protocol
const INIT_SEQUENCE: &[&str] = &["ATE0", "ATS0", "ATH1", "ATSP0"];

const RESET_COMMAND: &str = "ATZ";
const DESCRIBE_PROTOCOL_COMMAND: &str = "ATDPN";
/// Generic ELM327 identify, asked when the vendor command gives nothing
const IDENTIFY_COMMAND: &str = "ATI";

/// What the adapter told us while initialising
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HandshakeReport {
    /// Reset banner, e.g. "ELM327 v1.5"
    pub banner: Option<String>,
    pub firmware: Option<String>,
    pub protocol: Option<ObdProtocol>,
    /// The vendor extended-protocol command was accepted
    pub extended_protocol: bool,
}

fn rejected(reply: &str) -> bool {
    let reply = reply.trim().to_ascii_uppercase();
    reply == "?" || reply == "NO DATA" || reply.contains("ERROR")
}

async fn mandatory(
    queue: &CommandQueue,
    command: &str,
    timeout: std::time::Duration,
) -> Result<String, ConnectError> {
    let reply = queue
        .submit(command, timeout)
        .await
        .map_err(|e| ConnectError::Handshake {
            command: command.to_string(),
            reason: e.to_string(),
        })?;
    if rejected(&reply) {
        return Err(ConnectError::Handshake {
            command: command.to_string(),
            reason: format!("adapter replied {:?}", reply),
        });
    }
    debug!("{} -> {:?}", command, reply);
    Ok(reply)
}

/// Best-effort command: failures are logged and swallowed
async fn optional(queue: &CommandQueue, command: &str) -> Option<String> {
    match queue.send(command).await {
        Ok(reply) if !reply.is_empty() && !rejected(&reply) => Some(reply),
        Ok(reply) => {
            debug!("{} not supported ({:?})", command, reply);
            None
        }
        Err(e) => {
            warn!("{} failed: {}", command, e);
            None
        }
    }
}

/// Run the init sequence on a freshly opened link.
///
/// Every step is an ordinary queued command, so nothing else can reach the
/// adapter until this returns.
pub(crate) async fn run_handshake(
    queue: &CommandQueue,
    config: &DriverConfig,
    metrics: &SharedMetrics,
) -> Result<HandshakeReport, ConnectError> {
    let mut report = HandshakeReport::default();

    let banner = mandatory(queue, RESET_COMMAND, config.reset_timeout()).await?;
    report.banner = Some(banner).filter(|b| !b.is_empty());
    tokio::time::sleep(config.post_reset_delay()).await;

    for command in INIT_SEQUENCE {
        mandatory(queue, command, config.command_timeout()).await?;
    }

    if config.extended_protocol && !config.extended_protocol_command.is_empty() {
        report.extended_protocol = optional(queue, &config.extended_protocol_command)
            .await
            .is_some();
    }

    if !config.firmware_command.is_empty() {
        report.firmware = optional(queue, &config.firmware_command).await;
    }
    if report.firmware.is_none() && config.firmware_command != IDENTIFY_COMMAND {
        report.firmware = optional(queue, IDENTIFY_COMMAND).await;
    }
    if report.firmware.is_none() {
        report.firmware = report.banner.clone();
    }

    if let Some(reply) = optional(queue, DESCRIBE_PROTOCOL_COMMAND).await {
        match ObdProtocol::from_dpn(&reply) {
            Ok(protocol) => report.protocol = Some(protocol),
            Err(e) => debug!("Unrecognised protocol reply: {}", e),
        }
    }

    {
        let mut metrics = metrics.lock();
        metrics.firmware_version = report.firmware.clone();
        metrics.protocol = report.protocol.map(|p| p.description().to_string());
    }

    info!(
        "Adapter ready: firmware={:?} protocol={:?} extended={}",
        report.firmware, report.protocol, report.extended_protocol
    );
    Ok(report)
}
