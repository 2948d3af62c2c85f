// Allow holding locks across await points - we use parking_lot which is designed for this
#![allow(clippy::await_holding_lock)]
// Allow derivable impls for clarity
#![allow(clippy::derivable_impls)]
// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # smart-bottle-ble
//!
//! A cross-platform Rust library for talking to a smart water bottle over
//! Bluetooth Low Energy.
//!
//! The bottle streams newline-delimited JSON telemetry (water temperature,
//! device clock and, on newer firmware, UV-cycle, battery and flow figures)
//! once an authentication handshake has completed.
//!
//! ## Features
//!
//! - **Discovery**: Time-boxed scans with de-duplicated device lists
//! - **Handshake**: Auth token write, notification enable and clock sync
//! - **Telemetry**: Frame reassembly across notification chunks and a
//!   bounded history of recent readings
//! - **Reconnection**: Linear backoff to a remembered bottle after link loss
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use smart_bottle_ble::{DeviceManager, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Remembers the bottle so a restart reconnects to it.
//!     let manager = DeviceManager::with_identity_file("smart-bottle.json").await?;
//!     manager.begin_scan().await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!
//!     if let Some(device) = manager.discovered_devices().first() {
//!         println!("Connecting to {}", device.display_name());
//!         manager.connect(device.identity.clone()).await?;
//!     }
//!
//!     let mut readings = manager.subscribe_readings();
//!     while let Ok(reading) = readings.recv().await {
//!         println!("Water temperature: {:.1}°C", reading.temperature);
//!     }
//!
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.

// Public modules
pub mod access;
pub mod ble;
pub mod callback;
pub mod config;
pub mod data;
pub mod device_manager;
pub mod error;
pub mod protocol;
pub mod store;
pub mod timer;
pub mod utils;

mod state_machine;

// Re-exports for convenience
pub use access::{AccessGate, AlwaysGranted};
pub use callback::CallbackHandle;
pub use config::ManagerConfig;
pub use device_manager::DeviceManager;
pub use error::{Error, Result};
pub use store::{IdentityStore, JsonFileIdentityStore, MemoryIdentityStore};
pub use utils::celsius_to_fahrenheit;

// Re-export commonly used types from submodules
pub use ble::{
    BtleplugTransport, ConnectionState, DeviceId, DiscoveredDevice, FailureReason, MockTransport,
    Transport, TransportEvent,
};
pub use data::{ReadingHistory, TelemetryRecord};
pub use protocol::{decode_frame, FrameAssembler};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        let _ = std::any::TypeId::of::<DeviceManager>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<ConnectionState>();
        let _ = std::any::TypeId::of::<TelemetryRecord>();
        let _ = std::any::TypeId::of::<MockTransport>();
        let _ = std::any::TypeId::of::<ManagerConfig>();
    }

    #[test]
    fn test_temperature_conversion() {
        assert!((celsius_to_fahrenheit(100.0) - 212.0).abs() < 0.001);
    }
}
