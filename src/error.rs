//! Error types for the smart-bottle-ble crate.

use thiserror::Error;
use uuid::Uuid;

use crate::protocol::handshake::HandshakeStep;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// The host has not granted the access required to scan or connect.
    #[error("Missing Bluetooth permissions")]
    PermissionDenied,

    /// The Bluetooth adapter is not available or is switched off.
    #[error("Bluetooth disabled")]
    AdapterDisabled,

    /// The transport reported a scan failure.
    #[error("Scan failed: {code}")]
    ScanFailed {
        /// Transport-specific failure code.
        code: i32,
    },

    /// A scan window elapsed without a single device being reported.
    #[error("No devices found")]
    ScanTimeoutNoDevices,

    /// A step of the post-connect handshake failed.
    #[error("Handshake failed at {step}")]
    HandshakeStepFailed {
        /// The step that failed.
        step: HandshakeStep,
    },

    /// A telemetry frame could not be decoded.
    #[error("Invalid frame: {context}")]
    FrameParse {
        /// Description of what was wrong with the frame.
        context: String,
    },

    /// An endpoint the handshake needs is not exposed by the peripheral.
    #[error("Endpoint not found: {endpoint}")]
    CapabilityMissing {
        /// The endpoint that was looked up.
        endpoint: Uuid,
    },

    /// The requested peripheral is unknown to the transport.
    #[error("Device not found: {identity}")]
    DeviceNotFound {
        /// The identity that was searched for.
        identity: String,
    },

    /// A connection attempt for this peripheral is already running.
    #[error("Connection already in progress for {identity}")]
    ConnectionInProgress {
        /// The peripheral being connected.
        identity: String,
    },

    /// Scanning was requested while a link is open or opening.
    #[error("A link is active; disconnect before scanning")]
    LinkActive,

    /// Operation requires an open link.
    #[error("Not connected")]
    NotConnected,

    /// Reading or writing the identity store failed.
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// The identity store contents could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The manager's background task is no longer running.
    #[error("Device manager stopped")]
    ManagerStopped,

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
