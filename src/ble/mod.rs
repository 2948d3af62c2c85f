//! BLE communication module.
//!
//! The [`Transport`] trait abstracts the radio; [`BtleplugTransport`] drives
//! the system adapter and [`MockTransport`] stands in for it in tests. The
//! remaining modules hold the connection state, the device registry and the
//! reconnection policy used by the state machine.

pub mod connection;
pub mod mock;
pub mod platform;
pub mod reconnect;
pub mod registry;
pub mod transport;
pub mod uuids;

pub use connection::{ConnectionState, FailureReason};
pub use mock::{MockTransport, TransportCall};
pub use platform::BtleplugTransport;
pub use reconnect::{ReconnectDecision, ReconnectPolicy};
pub use registry::DeviceRegistry;
pub use transport::{Capability, DeviceId, DiscoveredDevice, Transport, TransportEvent};
pub use uuids::*;
