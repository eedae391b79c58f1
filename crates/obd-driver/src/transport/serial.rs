//! Serial port link (USB/RS-232 ELM327 adapters)

use super::{transport_channel, Transport, TransportEvents, TransportSenders};
use crate::connection::{EstablishContext, LinkFactory, LinkInfo};
use crate::error::{ConnectError, TransportError};
use crate::events::LinkState;
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 256;

pub struct SerialTransport {
    path: String,
    baud_rate: u32,
    writer: Option<WriteHalf<SerialStream>>,
    reader: Option<JoinHandle<()>>,
}

impl SerialTransport {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            writer: None,
            reader: None,
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> Result<TransportEvents, TransportError> {
        info!("Opening serial link {} @ {} baud", self.path, self.baud_rate);
        let stream = tokio_serial::new(&self.path, self.baud_rate).open_native_async()?;
        let (read_half, write_half) = tokio::io::split(stream);

        let (senders, events) = transport_channel();
        self.reader = Some(tokio::spawn(read_loop(read_half, senders)));
        self.writer = Some(write_half);
        Ok(events)
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let writer = self.writer.as_mut().ok_or(TransportError::NotOpen)?;
        writer
            .write_all(bytes)
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(mut writer) = self.writer.take() {
            writer.shutdown().await?;
        }
        debug!("Serial link {} closed", self.path);
        Ok(())
    }

    fn describe(&self) -> String {
        format!("serial:{}", self.path)
    }
}

async fn read_loop(mut port: ReadHalf<SerialStream>, senders: TransportSenders) {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match port.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if senders.data.send(chunk[..n].to_vec()).await.is_err() {
                    // nobody is listening any more
                    return;
                }
            }
            Err(e) => {
                warn!("Serial read failed: {}", e);
                let _ = senders.errors.send(TransportError::from(e)).await;
                break;
            }
        }
    }
    let _ = senders.closed.send(());
}

/// Link factory for a wired adapter; there is nothing to discover
pub struct SerialLink {
    path: String,
    baud_rate: u32,
}

impl SerialLink {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
        }
    }
}

#[async_trait]
impl LinkFactory for SerialLink {
    async fn establish(
        &self,
        ctx: EstablishContext,
    ) -> Result<(Box<dyn Transport>, LinkInfo), ConnectError> {
        ctx.set_state(LinkState::Connecting);
        Ok((
            Box::new(SerialTransport::new(self.path.clone(), self.baud_rate)),
            LinkInfo {
                device_id: self.path.clone(),
                device_name: None,
                rssi: None,
            },
        ))
    }
}
