//! Scripted in-memory transport.
//!
//! [`MockTransport`] records every operation the state machine performs,
//! lets a test inject transport events, and can be told to fail specific
//! operations. It is used by the crate's own tests and by the demo when no
//! radio is available.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::ble::transport::{Capability, DeviceId, DiscoveredDevice, Transport, TransportEvent};
use crate::ble::uuids::{
    AUTH_KEY_CHARACTERISTIC_UUID, BOTTLE_SERVICE_UUID, TELEMETRY_CHARACTERISTIC_UUID,
    TIME_SYNC_CHARACTERISTIC_UUID,
};
use crate::error::{Error, Result};

/// One operation performed on the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    /// `start_scan`
    StartScan,
    /// `stop_scan`
    StopScan,
    /// `open_link`
    OpenLink(DeviceId),
    /// `close_link`
    CloseLink,
    /// `negotiate_transport_unit`
    NegotiateTransportUnit(u16),
    /// `discover_capabilities`
    DiscoverCapabilities,
    /// `write_endpoint`
    Write {
        /// Target endpoint.
        endpoint: Uuid,
        /// Bytes written.
        payload: Vec<u8>,
    },
    /// `enable_notifications`
    EnableNotifications(Uuid),
}

#[derive(Debug)]
struct MockState {
    adapter_enabled: bool,
    fail_start_scan: bool,
    /// Number of upcoming `open_link` calls to fail.
    failing_opens: usize,
    fail_close: bool,
    fail_transport_unit: bool,
    fail_discovery: bool,
    fail_notifications: bool,
    /// How long `enable_notifications` takes to acknowledge.
    notifications_ack_delay: Duration,
    failing_writes: HashSet<Uuid>,
    capabilities: Vec<Capability>,
    /// Devices reported whenever a scan starts.
    advertising: Vec<DiscoveredDevice>,
    linked: Option<DeviceId>,
    calls: Vec<(Instant, TransportCall)>,
    event_tx: Option<mpsc::UnboundedSender<TransportEvent>>,
}

/// In-memory [`Transport`] for tests and demos.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Create a mock with the adapter on and a bottle exposing every endpoint.
    pub fn new() -> Self {
        let capabilities = [
            TELEMETRY_CHARACTERISTIC_UUID,
            AUTH_KEY_CHARACTERISTIC_UUID,
            TIME_SYNC_CHARACTERISTIC_UUID,
        ]
        .into_iter()
        .map(|endpoint| Capability {
            service: BOTTLE_SERVICE_UUID,
            endpoint,
        })
        .collect();

        Self {
            state: Arc::new(Mutex::new(MockState {
                adapter_enabled: true,
                fail_start_scan: false,
                failing_opens: 0,
                fail_close: false,
                fail_transport_unit: false,
                fail_discovery: false,
                fail_notifications: false,
                notifications_ack_delay: Duration::ZERO,
                failing_writes: HashSet::new(),
                capabilities,
                advertising: Vec::new(),
                linked: None,
                calls: Vec::new(),
                event_tx: None,
            })),
        }
    }

    // === Failure knobs ===

    /// Report the adapter as on or off.
    pub fn set_adapter_enabled(&self, enabled: bool) {
        self.state.lock().adapter_enabled = enabled;
    }

    /// Make `start_scan` fail.
    pub fn set_fail_start_scan(&self, fail: bool) {
        self.state.lock().fail_start_scan = fail;
    }

    /// Make every `open_link` fail, or none.
    pub fn set_fail_open(&self, fail: bool) {
        self.state.lock().failing_opens = if fail { usize::MAX } else { 0 };
    }

    /// Make the next `count` calls to `open_link` fail.
    pub fn fail_next_opens(&self, count: usize) {
        self.state.lock().failing_opens = count;
    }

    /// Make `close_link` fail.
    pub fn set_fail_close(&self, fail: bool) {
        self.state.lock().fail_close = fail;
    }

    /// Make transport unit negotiation fail.
    pub fn set_fail_transport_unit(&self, fail: bool) {
        self.state.lock().fail_transport_unit = fail;
    }

    /// Make capability discovery fail.
    pub fn set_fail_discovery(&self, fail: bool) {
        self.state.lock().fail_discovery = fail;
    }

    /// Make enabling notifications fail.
    pub fn set_fail_notifications(&self, fail: bool) {
        self.state.lock().fail_notifications = fail;
    }

    /// Delay the acknowledgement of `enable_notifications`.
    pub fn set_notifications_ack_delay(&self, delay: Duration) {
        self.state.lock().notifications_ack_delay = delay;
    }

    /// Reject every write to `endpoint`.
    pub fn fail_writes_to(&self, endpoint: Uuid) {
        self.state.lock().failing_writes.insert(endpoint);
    }

    /// Stop exposing `endpoint`.
    pub fn remove_capability(&self, endpoint: Uuid) {
        self.state
            .lock()
            .capabilities
            .retain(|c| c.endpoint != endpoint);
    }

    /// Report `identity` every time a scan starts.
    pub fn advertise(&self, identity: &str, name: Option<&str>) {
        self.state
            .lock()
            .advertising
            .push(DiscoveredDevice::new(identity, name));
    }

    /// Stop reporting any device on scan start.
    pub fn clear_advertising(&self) {
        self.state.lock().advertising.clear();
    }

    // === Event injection ===

    /// Push a transport event to the state machine.
    pub fn emit(&self, event: TransportEvent) {
        match &self.state.lock().event_tx {
            Some(tx) => {
                let _ = tx.unbounded_send(event);
            }
            None => debug!("No event listener, dropping {:?}", event),
        }
    }

    /// Report a scan result.
    pub fn discover(&self, identity: &str, name: Option<&str>) {
        self.emit(TransportEvent::DeviceDiscovered(DiscoveredDevice::new(
            identity, name,
        )));
    }

    /// Drop the open link as if the peripheral went out of range.
    pub fn drop_link(&self) {
        let linked = self.state.lock().linked.take();
        if let Some(identity) = linked {
            self.emit(TransportEvent::LinkDown { identity });
        }
    }

    /// Notify `data` on the telemetry endpoint.
    pub fn notify(&self, data: &[u8]) {
        self.emit(TransportEvent::Notification {
            endpoint: TELEMETRY_CHARACTERISTIC_UUID,
            data: data.to_vec(),
        });
    }

    /// Switch the adapter off. The open link is lost with it.
    pub fn power_off(&self) {
        {
            let mut state = self.state.lock();
            state.adapter_enabled = false;
            state.linked = None;
        }
        self.emit(TransportEvent::AdapterPoweredOff);
    }

    /// Switch the adapter back on.
    pub fn power_on(&self) {
        self.state.lock().adapter_enabled = true;
        self.emit(TransportEvent::AdapterPoweredOn);
    }

    // === Inspection ===

    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<TransportCall> {
        self.state.lock().calls.iter().map(|(_, c)| c.clone()).collect()
    }

    /// Every call so far with the (tokio) time it was made.
    pub fn timed_calls(&self) -> Vec<(Instant, TransportCall)> {
        self.state.lock().calls.clone()
    }

    /// Number of calls matching `predicate`.
    pub fn count_calls(&self, predicate: impl Fn(&TransportCall) -> bool) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|(_, c)| predicate(c))
            .count()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Peripheral currently linked, if any.
    pub fn linked(&self) -> Option<DeviceId> {
        self.state.lock().linked.clone()
    }

    fn record(&self, call: TransportCall) {
        self.state.lock().calls.push((Instant::now(), call));
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn adapter_enabled(&self) -> Result<bool> {
        Ok(self.state.lock().adapter_enabled)
    }

    async fn start_scan(&self) -> Result<()> {
        self.record(TransportCall::StartScan);
        let advertising = {
            let state = self.state.lock();
            if state.fail_start_scan {
                return Err(Error::ScanFailed { code: 1 });
            }
            state.advertising.clone()
        };
        for device in advertising {
            self.emit(TransportEvent::DeviceDiscovered(device));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record(TransportCall::StopScan);
        Ok(())
    }

    async fn open_link(&self, identity: &DeviceId) -> Result<()> {
        self.record(TransportCall::OpenLink(identity.clone()));
        let mut state = self.state.lock();
        if state.failing_opens > 0 || !state.adapter_enabled {
            state.failing_opens = state.failing_opens.saturating_sub(1);
            return Err(Error::DeviceNotFound {
                identity: identity.to_string(),
            });
        }
        state.linked = Some(identity.clone());
        Ok(())
    }

    async fn close_link(&self) -> Result<()> {
        self.record(TransportCall::CloseLink);
        let mut state = self.state.lock();
        state.linked = None;
        if state.fail_close {
            return Err(Error::Internal("close failed".to_string()));
        }
        Ok(())
    }

    async fn negotiate_transport_unit(&self, size: u16) -> Result<Option<u16>> {
        self.record(TransportCall::NegotiateTransportUnit(size));
        if self.state.lock().fail_transport_unit {
            return Err(Error::Internal("transport unit rejected".to_string()));
        }
        Ok(Some(size))
    }

    async fn discover_capabilities(&self) -> Result<Vec<Capability>> {
        self.record(TransportCall::DiscoverCapabilities);
        let state = self.state.lock();
        if state.fail_discovery {
            return Err(Error::Internal("service discovery failed".to_string()));
        }
        Ok(state.capabilities.clone())
    }

    async fn write_endpoint(&self, endpoint: Uuid, payload: &[u8]) -> Result<()> {
        self.record(TransportCall::Write {
            endpoint,
            payload: payload.to_vec(),
        });
        if self.state.lock().failing_writes.contains(&endpoint) {
            return Err(Error::Internal(format!("write to {} rejected", endpoint)));
        }
        Ok(())
    }

    async fn enable_notifications(&self, endpoint: Uuid) -> Result<()> {
        self.record(TransportCall::EnableNotifications(endpoint));
        let delay = self.state.lock().notifications_ack_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.state.lock().fail_notifications {
            return Err(Error::Internal("descriptor write failed".to_string()));
        }
        Ok(())
    }

    fn events(&self) -> BoxStream<'static, TransportEvent> {
        let (tx, rx) = mpsc::unbounded();
        self.state.lock().event_tx = Some(tx);
        rx.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_calls() {
        let mock = MockTransport::new();
        mock.start_scan().await.unwrap();
        mock.open_link(&DeviceId::from("AA")).await.unwrap();

        assert_eq!(
            mock.calls(),
            vec![
                TransportCall::StartScan,
                TransportCall::OpenLink(DeviceId::from("AA"))
            ]
        );
        assert_eq!(mock.linked(), Some(DeviceId::from("AA")));
    }

    #[tokio::test]
    async fn test_events_reach_stream() {
        let mock = MockTransport::new();
        let mut events = mock.events();

        mock.discover("AA", Some("Bottle"));
        mock.notify(b"{}\n");

        assert!(matches!(
            events.next().await,
            Some(TransportEvent::DeviceDiscovered(_))
        ));
        assert!(matches!(
            events.next().await,
            Some(TransportEvent::Notification { .. })
        ));
    }

    #[tokio::test]
    async fn test_failure_knobs() {
        let mock = MockTransport::new();
        mock.fail_writes_to(AUTH_KEY_CHARACTERISTIC_UUID);
        mock.remove_capability(TIME_SYNC_CHARACTERISTIC_UUID);
        mock.set_fail_open(true);

        assert!(mock
            .write_endpoint(AUTH_KEY_CHARACTERISTIC_UUID, b"x")
            .await
            .is_err());
        assert!(mock
            .write_endpoint(TIME_SYNC_CHARACTERISTIC_UUID, b"x")
            .await
            .is_ok());
        assert_eq!(mock.discover_capabilities().await.unwrap().len(), 2);
        assert!(mock.open_link(&DeviceId::from("AA")).await.is_err());
    }

    #[tokio::test]
    async fn test_advertised_devices_reported_on_scan() {
        let mock = MockTransport::new();
        let mut events = mock.events();
        mock.advertise("AA", Some("Bottle"));
        mock.start_scan().await.unwrap();

        assert_eq!(
            events.next().await,
            Some(TransportEvent::DeviceDiscovered(DiscoveredDevice::new(
                "AA",
                Some("Bottle")
            )))
        );
    }

    #[tokio::test]
    async fn test_fail_next_opens() {
        let mock = MockTransport::new();
        mock.fail_next_opens(2);
        let id = DeviceId::from("AA");
        assert!(mock.open_link(&id).await.is_err());
        assert!(mock.open_link(&id).await.is_err());
        assert!(mock.open_link(&id).await.is_ok());
    }

    #[tokio::test]
    async fn test_drop_link_emits_link_down() {
        let mock = MockTransport::new();
        let mut events = mock.events();
        mock.open_link(&DeviceId::from("AA")).await.unwrap();
        mock.drop_link();

        assert_eq!(
            events.next().await,
            Some(TransportEvent::LinkDown {
                identity: DeviceId::from("AA")
            })
        );
        assert_eq!(mock.linked(), None);
    }
}
