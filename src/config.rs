//! Device manager configuration.

use std::time::Duration;

use crate::ble::reconnect::{DEFAULT_BACKOFF_STEP, DEFAULT_MAX_RECONNECT_ATTEMPTS};
use crate::data::DEFAULT_HISTORY_CAPACITY;
use crate::protocol::handshake::{HandshakeParams, DEFAULT_SETTLE_DELAY, DEFAULT_TRANSPORT_UNIT};

/// Shared secret provisioned on shipping bottles.
pub const DEFAULT_AUTH_TOKEN: &[u8] = b"mysecretkey123";

/// Default length of a scan window.
pub const DEFAULT_SCAN_WINDOW: Duration = Duration::from_secs(15);

/// Default pause between stopping and restarting a scan.
pub const DEFAULT_SCAN_RESTART_DELAY: Duration = Duration::from_millis(750);

/// Default wait between a scan match and the automatic connect.
pub const DEFAULT_CONNECT_SETTLE: Duration = Duration::from_millis(500);

/// Tunables for a [`DeviceManager`](crate::DeviceManager).
///
/// The defaults match the bottle firmware. Use the `with_*` methods to
/// override individual values:
///
/// ```
/// use std::time::Duration;
/// use smart_bottle_ble::ManagerConfig;
///
/// let config = ManagerConfig::default()
///     .with_scan_window(Duration::from_secs(30))
///     .with_auth_token(b"factory-secret".to_vec());
/// assert_eq!(config.max_reconnect_attempts, 6);
/// ```
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How long a scan runs before it is evaluated.
    pub scan_window: Duration,
    /// Pause used by [`restart_scan`](crate::DeviceManager::restart_scan).
    pub scan_restart_delay: Duration,
    /// Wait between a scan match for the remembered bottle and connecting.
    pub connect_settle: Duration,
    /// Wait after the transport unit step of the handshake.
    pub settle_after_transport_unit: Duration,
    /// Wait after telemetry notifications are enabled.
    pub settle_after_notifications: Duration,
    /// Cap on automatic reconnect attempts.
    pub max_reconnect_attempts: u32,
    /// The n-th reconnect attempt waits `n × reconnect_backoff_step`.
    pub reconnect_backoff_step: Duration,
    /// Transport unit requested during the handshake.
    pub transport_unit: u16,
    /// Number of records kept in the reading history.
    pub history_capacity: usize,
    /// Secret written to the auth endpoint.
    pub auth_token: Vec<u8>,
    /// Hide devices that advertise no name from the discovered list. Off by
    /// default; hidden devices still count as found and still match the
    /// remembered bottle.
    pub require_device_name: bool,
    /// Clear the reading history on a user disconnect.
    pub clear_readings_on_disconnect: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            scan_window: DEFAULT_SCAN_WINDOW,
            scan_restart_delay: DEFAULT_SCAN_RESTART_DELAY,
            connect_settle: DEFAULT_CONNECT_SETTLE,
            settle_after_transport_unit: DEFAULT_SETTLE_DELAY,
            settle_after_notifications: DEFAULT_SETTLE_DELAY,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_backoff_step: DEFAULT_BACKOFF_STEP,
            transport_unit: DEFAULT_TRANSPORT_UNIT,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            auth_token: DEFAULT_AUTH_TOKEN.to_vec(),
            require_device_name: false,
            clear_readings_on_disconnect: false,
        }
    }
}

impl ManagerConfig {
    /// Set the scan window.
    pub fn with_scan_window(mut self, window: Duration) -> Self {
        self.scan_window = window;
        self
    }

    /// Set the scan restart pause.
    pub fn with_scan_restart_delay(mut self, delay: Duration) -> Self {
        self.scan_restart_delay = delay;
        self
    }

    /// Set the wait before auto-connecting to a scan match.
    pub fn with_connect_settle(mut self, delay: Duration) -> Self {
        self.connect_settle = delay;
        self
    }

    /// Set both handshake settle waits.
    pub fn with_handshake_settle(mut self, delay: Duration) -> Self {
        self.settle_after_transport_unit = delay;
        self.settle_after_notifications = delay;
        self
    }

    /// Set the reconnect cap and backoff step.
    pub fn with_reconnect(mut self, max_attempts: u32, backoff_step: Duration) -> Self {
        self.max_reconnect_attempts = max_attempts;
        self.reconnect_backoff_step = backoff_step;
        self
    }

    /// Set the requested transport unit.
    pub fn with_transport_unit(mut self, size: u16) -> Self {
        self.transport_unit = size;
        self
    }

    /// Set the history capacity.
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }

    /// Set the auth secret.
    pub fn with_auth_token(mut self, token: Vec<u8>) -> Self {
        self.auth_token = token;
        self
    }

    /// Only list devices that advertise a name.
    pub fn with_named_devices_only(mut self, named_only: bool) -> Self {
        self.require_device_name = named_only;
        self
    }

    /// Clear readings when the user disconnects.
    pub fn with_clear_readings_on_disconnect(mut self, clear: bool) -> Self {
        self.clear_readings_on_disconnect = clear;
        self
    }

    /// Handshake parameters derived from this configuration.
    pub(crate) fn handshake_params(&self) -> HandshakeParams {
        HandshakeParams {
            auth_token: self.auth_token.clone(),
            transport_unit: self.transport_unit,
            settle_after_transport_unit: self.settle_after_transport_unit,
            settle_after_notifications: self.settle_after_notifications,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.scan_window, Duration::from_secs(15));
        assert_eq!(config.scan_restart_delay, Duration::from_millis(750));
        assert_eq!(config.max_reconnect_attempts, 6);
        assert_eq!(config.reconnect_backoff_step, Duration::from_secs(2));
        assert_eq!(config.transport_unit, 512);
        assert_eq!(config.history_capacity, 100);
        assert_eq!(config.auth_token, b"mysecretkey123");
        assert!(!config.require_device_name);
        assert!(!config.clear_readings_on_disconnect);
    }

    #[test]
    fn test_builders() {
        let config = ManagerConfig::default()
            .with_handshake_settle(Duration::ZERO)
            .with_reconnect(3, Duration::from_secs(1))
            .with_named_devices_only(true);
        assert_eq!(config.settle_after_notifications, Duration::ZERO);
        assert_eq!(config.max_reconnect_attempts, 3);
        assert!(config.require_device_name);

        let params = config.handshake_params();
        assert_eq!(params.settle_after_transport_unit, Duration::ZERO);
        assert_eq!(params.transport_unit, 512);
    }
}
