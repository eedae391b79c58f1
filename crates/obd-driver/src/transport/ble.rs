//! BLE characteristic pair link

use super::{transport_channel, Transport, TransportEvents, TransportSenders};
use crate::ble::BleCentral;
use crate::error::TransportError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Writes to the TX characteristic, streams RX notifications
pub struct BleTransport {
    central: Arc<dyn BleCentral>,
    peripheral: String,
    tx_uuid: String,
    rx_uuid: String,
    /// Use acknowledged writes when the TX characteristic supports them
    with_response: bool,
    pump: Option<JoinHandle<()>>,
}

impl BleTransport {
    pub fn new(
        central: Arc<dyn BleCentral>,
        peripheral: impl Into<String>,
        tx_uuid: impl Into<String>,
        rx_uuid: impl Into<String>,
        with_response: bool,
    ) -> Self {
        Self {
            central,
            peripheral: peripheral.into(),
            tx_uuid: tx_uuid.into(),
            rx_uuid: rx_uuid.into(),
            with_response,
            pump: None,
        }
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn open(&mut self) -> Result<TransportEvents, TransportError> {
        let notifications = self.central.subscribe(&self.peripheral, &self.rx_uuid).await?;
        let notice = self.central.disconnect_notice(&self.peripheral);
        debug!("Subscribed to {} on {}", self.rx_uuid, self.peripheral);

        let (senders, events) = transport_channel();
        self.pump = Some(tokio::spawn(pump(notifications, notice, senders)));
        Ok(events)
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.pump.is_none() {
            return Err(TransportError::NotOpen);
        }
        self.central
            .write(&self.peripheral, &self.tx_uuid, bytes, self.with_response)
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.central.disconnect(&self.peripheral).await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("ble:{}", self.peripheral)
    }
}

async fn pump(
    mut notifications: mpsc::Receiver<Vec<u8>>,
    mut notice: oneshot::Receiver<()>,
    senders: TransportSenders,
) {
    loop {
        tokio::select! {
            value = notifications.recv() => match value {
                Some(bytes) => {
                    if senders.data.send(bytes).await.is_err() {
                        return;
                    }
                }
                None => {
                    warn!("Notification stream ended");
                    let _ = senders
                        .errors
                        .send(TransportError::Io("notification stream ended".to_string()))
                        .await;
                    break;
                }
            },
            _ = &mut notice => break,
        }
    }
    let _ = senders.closed.send(());
}
