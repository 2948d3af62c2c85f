//! Radio transport abstraction.
//!
//! The connection state machine talks to the radio only through the
//! [`Transport`] trait. Operation results double as acknowledgements;
//! unsolicited radio activity (scan results, link drops, notifications,
//! adapter power changes) arrives on the stream returned by
//! [`Transport::events`].

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Stable transport address of a peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wrap a transport address.
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// The address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(address: &str) -> Self {
        Self::new(address)
    }
}

impl From<String> for DeviceId {
    fn from(address: String) -> Self {
        Self(address)
    }
}

/// A peripheral reported by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Transport address.
    pub identity: DeviceId,
    /// Advertised name, if any.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
}

impl DiscoveredDevice {
    /// Create a device record without signal strength.
    pub fn new(identity: impl Into<DeviceId>, name: Option<&str>) -> Self {
        Self {
            identity: identity.into(),
            name: name.map(str::to_string),
            rssi: None,
        }
    }

    /// Name to show for the device, falling back to its address.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or_else(|| self.identity.as_str())
    }
}

/// One endpoint exposed by a connected peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Capability {
    /// Service the endpoint belongs to.
    pub service: Uuid,
    /// Endpoint (characteristic) UUID.
    pub endpoint: Uuid,
}

/// Unsolicited activity reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A scan reported a peripheral. May repeat for the same peripheral.
    DeviceDiscovered(DiscoveredDevice),
    /// The running scan failed.
    ScanFailed {
        /// Transport-specific failure code.
        code: i32,
    },
    /// The link to `identity` went down.
    LinkDown {
        /// Peripheral whose link dropped.
        identity: DeviceId,
    },
    /// Bytes notified on `endpoint`.
    Notification {
        /// Source endpoint.
        endpoint: Uuid,
        /// Notified bytes.
        data: Vec<u8>,
    },
    /// The adapter was switched on.
    AdapterPoweredOn,
    /// The adapter was switched off.
    AdapterPoweredOff,
}

/// The radio operations the connection state machine depends on.
///
/// At most one link is open at a time. Implementations must be cheap to
/// share across tasks; the state machine holds them in an `Arc`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether the adapter is present and powered.
    fn adapter_enabled(&self) -> Result<bool>;

    /// Start reporting nearby peripherals as [`TransportEvent::DeviceDiscovered`].
    async fn start_scan(&self) -> Result<()>;

    /// Stop a running scan. Stopping when idle is not an error.
    async fn stop_scan(&self) -> Result<()>;

    /// Open a link to `identity`. Resolves once the link is up.
    async fn open_link(&self, identity: &DeviceId) -> Result<()>;

    /// Close the open link, if any.
    async fn close_link(&self) -> Result<()>;

    /// Request a transport unit of `size` bytes.
    ///
    /// Returns the granted size, or `None` if the platform manages it.
    async fn negotiate_transport_unit(&self, size: u16) -> Result<Option<u16>>;

    /// List the endpoints exposed by the linked peripheral.
    async fn discover_capabilities(&self) -> Result<Vec<Capability>>;

    /// Write `payload` to `endpoint`, resolving on acknowledgement.
    async fn write_endpoint(&self, endpoint: Uuid, payload: &[u8]) -> Result<()>;

    /// Subscribe to notifications on `endpoint`, resolving on acknowledgement.
    async fn enable_notifications(&self, endpoint: Uuid) -> Result<()>;

    /// Stream of unsolicited transport activity.
    ///
    /// Called once by the state machine when it starts.
    fn events(&self) -> BoxStream<'static, TransportEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_serializes_as_string() {
        let id = DeviceId::from("AA:BB:CC:DD:EE:FF");
        assert_eq!(
            serde_json::to_string(&id).unwrap(),
            "\"AA:BB:CC:DD:EE:FF\""
        );
        assert_eq!(id.to_string(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_display_name_falls_back_to_address() {
        let named = DiscoveredDevice::new("01", Some("SmartBottle"));
        let unnamed = DiscoveredDevice::new("02", None);
        assert_eq!(named.display_name(), "SmartBottle");
        assert_eq!(unnamed.display_name(), "02");
    }
}
