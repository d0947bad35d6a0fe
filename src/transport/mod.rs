//! Transport seam over the platform BLE stack.
//!
//! The session never talks to a BLE API directly; it drives a [`Transport`]
//! through the narrow surface below. A production implementation wraps the
//! platform GATT client; [`mock::MockTransport`] provides a scripted
//! in-memory double for tests and examples.
//!
//! The service and characteristic identifiers are vendor-fixed for one
//! product family and are not configurable.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;

pub mod mock;

pub use mock::{MockHandle, MockTransport};

/// GATT service exposed by the remote device.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x7a230001_b87f_49f2_a382_db25e29cc7ab);

/// Outbound (write-with-response) characteristic.
pub const TX_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x7a230002_b87f_49f2_a382_db25e29cc7ab);

/// Inbound (notification) characteristic.
pub const RX_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x7a230003_b87f_49f2_a382_db25e29cc7ab);

/// How `open()` picks a peripheral. First match wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSelector {
    /// Exact advertised name.
    Name(String),
    /// Advertised name prefix.
    NamePrefix(String),
    /// Any peripheral advertising the fixed service UUID.
    ServiceOnly,
}

/// Asynchronous events delivered by a subscribed transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Raw bytes from one notification on the RX characteristic.
    Notification(Bytes),
    /// The link dropped, whether requested or external.
    Disconnected,
}

/// Black-box interface to the platform BLE stack.
///
/// Implementations hold the peripheral handle between calls so a retry can
/// reconnect to the same device without re-running selection. The write
/// primitive is write-with-response: it completes only once the remote has
/// acknowledged the write, which the framing layer relies on for ordering.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Resolve a peripheral by selector and retain its handle.
    /// Returns a display identifier for the chosen device.
    async fn connect(&mut self, selector: &DeviceSelector) -> Result<String>;

    /// Identifier of the currently held peripheral, if any.
    fn held_device(&self) -> Option<String>;

    /// Drop the peripheral handle so the next `connect` re-runs selection.
    fn forget_device(&mut self);

    /// Open the GATT link to the held peripheral.
    async fn open_link(&mut self) -> Result<()>;

    /// Resolve the service and its TX/RX characteristics.
    async fn resolve_characteristics(&mut self, service: Uuid, tx: Uuid, rx: Uuid) -> Result<()>;

    /// Enable RX notifications and return the event stream.
    ///
    /// Each call replaces any previous subscription; a retried attempt must
    /// not stack subscriptions.
    async fn subscribe(&mut self) -> Result<mpsc::Receiver<TransportEvent>>;

    /// Write bytes to the TX characteristic, awaiting the link-layer
    /// acknowledgment.
    async fn write_with_response(&mut self, bytes: &[u8]) -> Result<()>;

    /// Tear down link, characteristics and subscription while keeping the
    /// peripheral handle. Restores the clean precondition between retries.
    async fn release(&mut self);

    /// Request disconnection. Completion is signalled asynchronously via
    /// [`TransportEvent::Disconnected`].
    async fn disconnect(&mut self);
}
