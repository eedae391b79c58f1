//! OBD-II Adapter Driver
//!
//! Turns a half-duplex byte link to an ELM327-class adapter into a
//! request/response API:
//!
//! - [`transport`]: byte links (serial port, BLE characteristic pair, mock)
//! - [`ResponseFramer`]: splits the byte stream on the `>` prompt
//! - [`CommandQueue`]: one in-flight command, FIFO, per-command deadlines
//! - [`ConnectionManager`]: discovery, handshake, watchdog and reconnection
//! - [`ObdDriver`]: typed diagnostic reads on top of all of the above

pub mod ble;
mod cancel;
mod config;
mod connection;
mod driver;
mod error;
mod events;
mod framer;
mod handshake;
mod metrics;
mod queue;
pub mod transport;

pub use ble::{BleCentral, BleLink};
pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use config::{DriverConfig, LinkKind};
pub use connection::{ConnectionManager, ConnectionSnapshot, EstablishContext, LinkFactory, LinkInfo};
pub use driver::ObdDriver;
pub use error::{BleError, ConnectError, DriverError, QueueError, TransportError};
pub use events::{DisconnectReason, DriverEvent, LinkState, ScanPhase};
pub use framer::ResponseFramer;
pub use handshake::HandshakeReport;
pub use metrics::{ConnectionMetrics, SharedMetrics};
pub use queue::{CommandQueue, LinkNotice};
pub use transport::{SerialLink, Transport};
