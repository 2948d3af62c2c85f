//! Connection lifecycle states.
//!
//! [`ConnectionState`] is the single observable state of the link to the
//! bottle. It is only ever changed by the connection state machine.

use uuid::Uuid;

use crate::ble::uuids::endpoint_name;
use crate::error::Error;
use crate::protocol::handshake::{HandshakeFailure, HandshakeStep};

/// Why the connection entered the error state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// The host has not granted Bluetooth access.
    PermissionDenied,
    /// The adapter is off or missing.
    AdapterDisabled,
    /// The scan could not be started (`None`) or the transport reported a code.
    ScanFailed(Option<i32>),
    /// The scan window passed without any device.
    ScanTimeoutNoDevices,
    /// A required handshake step failed.
    HandshakeStepFailed(HandshakeStep),
    /// The peripheral does not expose a required endpoint.
    CapabilityMissing(Uuid),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PermissionDenied => write!(f, "missing Bluetooth permissions"),
            Self::AdapterDisabled => write!(f, "Bluetooth disabled"),
            Self::ScanFailed(Some(code)) => write!(f, "scan failed: {}", code),
            Self::ScanFailed(None) => write!(f, "scan failed"),
            Self::ScanTimeoutNoDevices => write!(f, "no devices found"),
            Self::HandshakeStepFailed(step) => write!(f, "{} failed", step),
            Self::CapabilityMissing(endpoint) => {
                write!(f, "{} endpoint not found", endpoint_name(endpoint))
            }
        }
    }
}

impl From<HandshakeFailure> for FailureReason {
    fn from(failure: HandshakeFailure) -> Self {
        match failure {
            HandshakeFailure::StepFailed(step) => Self::HandshakeStepFailed(step),
            HandshakeFailure::CapabilityMissing(endpoint) => Self::CapabilityMissing(endpoint),
        }
    }
}

impl From<FailureReason> for Error {
    fn from(reason: FailureReason) -> Self {
        match reason {
            FailureReason::PermissionDenied => Error::PermissionDenied,
            FailureReason::AdapterDisabled => Error::AdapterDisabled,
            FailureReason::ScanFailed(code) => Error::ScanFailed {
                code: code.unwrap_or(-1),
            },
            FailureReason::ScanTimeoutNoDevices => Error::ScanTimeoutNoDevices,
            FailureReason::HandshakeStepFailed(step) => Error::HandshakeStepFailed { step },
            FailureReason::CapabilityMissing(endpoint) => Error::CapabilityMissing { endpoint },
        }
    }
}

/// Connection state of the bottle link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No link and no scan.
    #[default]
    Disconnected,
    /// Scanning for peripherals.
    Scanning,
    /// Opening the link, negotiating and discovering endpoints.
    Connecting,
    /// Waiting for the auth token to be accepted.
    Authenticating,
    /// Enabling telemetry notifications.
    SubscribingNotifications,
    /// Writing the clock.
    SyncingTime,
    /// Handshake completed; telemetry is flowing.
    Connected,
    /// The last operation failed.
    Error(FailureReason),
}

impl ConnectionState {
    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if a link attempt is underway but not finished.
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Authenticating | Self::SubscribingNotifications | Self::SyncingTime
        )
    }

    /// Check if scanning.
    pub fn is_scanning(&self) -> bool {
        matches!(self, Self::Scanning)
    }

    /// The failure reason, when in the error state.
    pub fn failure(&self) -> Option<FailureReason> {
        match self {
            Self::Error(reason) => Some(*reason),
            _ => None,
        }
    }

    /// State reported while the handshake sits at `step`.
    ///
    /// Returns `None` for the terminal steps, whose state the state machine
    /// decides itself.
    pub fn for_handshake_step(step: HandshakeStep) -> Option<Self> {
        match step {
            HandshakeStep::LinkUp
            | HandshakeStep::NegotiateTransportUnit
            | HandshakeStep::DiscoverCapabilities => Some(Self::Connecting),
            HandshakeStep::WriteAuthToken => Some(Self::Authenticating),
            HandshakeStep::EnableNotifications => Some(Self::SubscribingNotifications),
            HandshakeStep::SyncClock => Some(Self::SyncingTime),
            HandshakeStep::Ready | HandshakeStep::Failed => None,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Authenticating => write!(f, "Authenticating"),
            Self::SubscribingNotifications => write!(f, "Subscribing"),
            Self::SyncingTime => write!(f, "Syncing time"),
            Self::Connected => write!(f, "Connected"),
            Self::Error(reason) => write!(f, "Error: {}", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::AUTH_KEY_CHARACTERISTIC_UUID;

    #[test]
    fn test_connection_state() {
        assert!(!ConnectionState::Disconnected.is_connected());
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());

        assert!(ConnectionState::Connecting.is_transitioning());
        assert!(ConnectionState::SyncingTime.is_transitioning());
        assert!(!ConnectionState::Connected.is_transitioning());
        assert!(!ConnectionState::Scanning.is_transitioning());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(format!("{}", ConnectionState::Connected), "Connected");
        assert_eq!(format!("{}", ConnectionState::Disconnected), "Disconnected");
        assert_eq!(
            format!("{}", ConnectionState::Error(FailureReason::ScanTimeoutNoDevices)),
            "Error: no devices found"
        );
    }

    #[test]
    fn test_failure_reason_display() {
        assert_eq!(FailureReason::ScanTimeoutNoDevices.to_string(), "no devices found");
        assert_eq!(FailureReason::ScanFailed(Some(2)).to_string(), "scan failed: 2");
        assert_eq!(
            FailureReason::HandshakeStepFailed(HandshakeStep::WriteAuthToken).to_string(),
            "auth token write failed"
        );
        assert_eq!(
            FailureReason::CapabilityMissing(AUTH_KEY_CHARACTERISTIC_UUID).to_string(),
            "auth endpoint not found"
        );
    }

    #[test]
    fn test_state_for_handshake_step() {
        assert_eq!(
            ConnectionState::for_handshake_step(HandshakeStep::DiscoverCapabilities),
            Some(ConnectionState::Connecting)
        );
        assert_eq!(
            ConnectionState::for_handshake_step(HandshakeStep::WriteAuthToken),
            Some(ConnectionState::Authenticating)
        );
        assert_eq!(ConnectionState::for_handshake_step(HandshakeStep::Ready), None);
    }

    #[test]
    fn test_failure_converts_to_error() {
        let err: Error = FailureReason::AdapterDisabled.into();
        assert!(matches!(err, Error::AdapterDisabled));
        let reason: FailureReason =
            HandshakeFailure::CapabilityMissing(AUTH_KEY_CHARACTERISTIC_UUID).into();
        assert_eq!(
            reason,
            FailureReason::CapabilityMissing(AUTH_KEY_CHARACTERISTIC_UUID)
        );
    }
}
