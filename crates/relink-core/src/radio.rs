//! BLE radio abstraction.
//!
//! The tracker talks to the platform Bluetooth stack only through [`Radio`].
//! Two implementations exist:
//!
//! - [`BluezRadio`] (feature `bluetooth`): BlueZ over D-Bus via `bluer`
//! - [`MockRadio`] (feature `mock-radio`, and in tests): scriptable, in-process

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use uuid::Uuid;

use crate::types::{CharacteristicRef, ConnectionEvent, DeviceId, DiscoveryEvent};

#[cfg(feature = "bluetooth")]
mod bluez;
#[cfg(any(test, feature = "mock-radio"))]
mod mock;

#[cfg(feature = "bluetooth")]
pub use bluez::BluezRadio;
#[cfg(any(test, feature = "mock-radio"))]
pub use mock::{ConnectBehavior, MockRadio};

/// The radio the binaries run against.
///
/// # Errors
///
/// Returns an error if the adapter is missing or powered off.
#[cfg(feature = "bluetooth")]
pub async fn platform_radio(adapter: Option<String>) -> RadioResult<Arc<dyn Radio>> {
    Ok(Arc::new(BluezRadio::new(adapter).await?))
}

/// The radio the binaries run against. Built without `bluetooth`, this is an
/// in-memory radio that never discovers anything.
///
/// # Errors
///
/// Never fails; the signature matches the BlueZ build.
#[cfg(all(not(feature = "bluetooth"), any(test, feature = "mock-radio")))]
#[allow(clippy::unused_async)]
pub async fn platform_radio(adapter: Option<String>) -> RadioResult<Arc<dyn Radio>> {
    tracing::warn!(
        adapter = ?adapter,
        "Built without the bluetooth feature; using the in-memory radio"
    );
    Ok(Arc::new(MockRadio::new()))
}

/// Wrap `rx` so dropping the stream cancels `token`, stopping the tasks that
/// feed it. The token is also cancelled once `rx` runs dry.
#[cfg(any(test, feature = "bluetooth"))]
pub(crate) fn cancel_on_drop<T: Send + 'static>(
    rx: futures::channel::mpsc::UnboundedReceiver<T>,
    token: &tokio_util::sync::CancellationToken,
) -> BoxStream<'static, T> {
    use futures::StreamExt;

    let guard = token.clone().drop_guard();
    futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        let item = rx.next().await?;
        Some((item, (rx, guard)))
    })
    .boxed()
}

/// Radio-level errors.
#[derive(Debug, Error)]
pub enum RadioError {
    /// No Bluetooth adapter is present.
    #[error("No Bluetooth adapter found")]
    AdapterNotFound,

    /// The adapter exists but is powered off.
    #[error("Bluetooth adapter is powered off")]
    AdapterPoweredOff,

    /// The platform refused to start or stop a scan.
    #[error("Scan rejected: {0}")]
    ScanRejected(String),

    /// A connection attempt was rejected.
    #[error("Connection to {device_id} rejected: {reason}")]
    ConnectRejected {
        /// Target device.
        device_id: DeviceId,
        /// Platform reason.
        reason: String,
    },

    /// The platform does not know this device.
    #[error("Device {device_id} not found")]
    DeviceNotFound {
        /// Requested device.
        device_id: DeviceId,
    },

    /// The operation needs a live link.
    #[error("Device {device_id} is not connected")]
    NotConnected {
        /// Requested device.
        device_id: DeviceId,
    },

    /// The characteristic is not exposed by the device.
    #[error("Characteristic {characteristic} not found")]
    CharacteristicNotFound {
        /// Requested characteristic.
        characteristic: CharacteristicRef,
    },

    /// Any other platform failure.
    #[error("Radio operation failed: {0}")]
    Operation(String),
}

impl RadioError {
    /// Whether the adapter itself is unusable (as opposed to one operation failing).
    #[must_use]
    pub const fn is_adapter_unavailable(&self) -> bool {
        matches!(self, Self::AdapterNotFound | Self::AdapterPoweredOff)
    }
}

/// Result type for radio operations.
pub type RadioResult<T> = std::result::Result<T, RadioError>;

/// The platform BLE stack.
///
/// Streams end when the underlying platform subscription ends. Dropping a
/// stream releases the platform subscription.
#[async_trait]
pub trait Radio: Send + Sync {
    /// Start scanning. Yields a [`DiscoveryEvent`] per advertisement seen.
    async fn start_scan(&self) -> RadioResult<BoxStream<'static, DiscoveryEvent>>;

    /// Stop any active scan. Idempotent.
    async fn stop_scan(&self) -> RadioResult<()>;

    /// Open a link to `device_id`. Returns once the link is up.
    async fn connect(&self, device_id: &DeviceId) -> RadioResult<()>;

    /// Close the link to `device_id`. Idempotent.
    async fn disconnect(&self, device_id: &DeviceId) -> RadioResult<()>;

    /// Link changes for every device, including ones this process did not start.
    async fn connection_events(&self) -> RadioResult<BoxStream<'static, ConnectionEvent>>;

    /// Create an OS-level bond.
    async fn pair(&self, device_id: &DeviceId) -> RadioResult<()>;

    /// Remove an OS-level bond.
    async fn unpair(&self, device_id: &DeviceId) -> RadioResult<()>;

    /// Primary service UUIDs of a connected device.
    async fn discover_services(&self, device_id: &DeviceId) -> RadioResult<Vec<Uuid>>;

    /// Read a characteristic value.
    async fn read(
        &self,
        device_id: &DeviceId,
        characteristic: &CharacteristicRef,
    ) -> RadioResult<Vec<u8>>;

    /// Write a characteristic value.
    async fn write(
        &self,
        device_id: &DeviceId,
        characteristic: &CharacteristicRef,
        value: &[u8],
    ) -> RadioResult<()>;

    /// Subscribe to notifications or indications of a characteristic.
    async fn subscribe(
        &self,
        device_id: &DeviceId,
        characteristic: &CharacteristicRef,
    ) -> RadioResult<BoxStream<'static, Vec<u8>>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_dropping_the_stream_cancels_its_feeders() {
        let token = CancellationToken::new();
        let (tx, rx) = futures::channel::mpsc::unbounded();
        let mut stream = cancel_on_drop(rx, &token);

        tx.unbounded_send(1).unwrap();
        assert_eq!(stream.next().await, Some(1));
        assert!(!token.is_cancelled());

        drop(stream);
        assert!(token.is_cancelled());
        assert!(tx.unbounded_send(2).is_err());
    }

    #[tokio::test]
    async fn test_stream_end_cancels_the_token() {
        let token = CancellationToken::new();
        let (tx, rx) = futures::channel::mpsc::unbounded::<u8>();
        let mut stream = cancel_on_drop(rx, &token);

        drop(tx);
        assert_eq!(stream.next().await, None);
        assert!(token.is_cancelled());
    }
}
