//! Byte links to the adapter
//!
//! A [`Transport`] knows nothing about the protocol: it opens a link, writes
//! bytes and pushes whatever arrives onto the channels of
//! [`TransportEvents`]. Implementations:
//! - [`SerialTransport`] for USB/RS-232 adapters
//! - [`BleTransport`] for a BLE notify/write characteristic pair
//! - [`mock::MockTransport`] for tests

mod ble;
pub mod mock;
mod serial;

pub use ble::BleTransport;
pub use serial::{SerialLink, SerialTransport};

use crate::error::TransportError;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

/// Capacity of the incoming data channel
const CHANNEL_CAPACITY: usize = 64;

/// Push side of an open link, one channel per event kind
#[derive(Debug)]
pub struct TransportEvents {
    /// Raw bytes as they arrive
    pub data: mpsc::Receiver<Vec<u8>>,
    /// Fires once when the link goes away
    pub closed: oneshot::Receiver<()>,
    /// Non-fatal link errors
    pub errors: mpsc::Receiver<TransportError>,
}

/// Producer half handed to the task that reads the link
#[derive(Debug)]
pub struct TransportSenders {
    pub data: mpsc::Sender<Vec<u8>>,
    pub closed: oneshot::Sender<()>,
    pub errors: mpsc::Sender<TransportError>,
}

/// Create a connected sender/receiver set
pub fn transport_channel() -> (TransportSenders, TransportEvents) {
    let (data_tx, data_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (closed_tx, closed_rx) = oneshot::channel();
    let (errors_tx, errors_rx) = mpsc::channel(CHANNEL_CAPACITY);
    (
        TransportSenders {
            data: data_tx,
            closed: closed_tx,
            errors: errors_tx,
        },
        TransportEvents {
            data: data_rx,
            closed: closed_rx,
            errors: errors_rx,
        },
    )
}

/// Byte-oriented link to an adapter
#[async_trait]
pub trait Transport: Send {
    /// Open the link and return its event channels
    async fn open(&mut self) -> Result<TransportEvents, TransportError>;

    /// Write raw bytes; resolves once the link accepted them
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;

    /// Human readable link description for logs
    fn describe(&self) -> String;
}
