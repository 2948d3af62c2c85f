//! [`Transport`] implementation on the system Bluetooth stack via `btleplug`.
//!
//! A background task listens to the adapter's central events and turns them
//! into [`TransportEvent`]s: advertisements while scanning, disconnects of
//! the linked peripheral, and adapter power changes. A second task per link
//! forwards characteristic notifications.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::channel::mpsc;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::transport::{Capability, DeviceId, DiscoveredDevice, Transport, TransportEvent};
use crate::ble::uuids::endpoint_name;
use crate::error::{Error, Result};

type EventSender = Arc<RwLock<Option<mpsc::UnboundedSender<TransportEvent>>>>;

/// The open link.
struct Link {
    identity: DeviceId,
    peripheral: Peripheral,
    /// Characteristics found by the last discovery, by UUID.
    characteristics: HashMap<Uuid, Characteristic>,
    /// Forwards notifications while subscribed.
    notification_task: Option<JoinHandle<()>>,
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(task) = self.notification_task.take() {
            task.abort();
        }
    }
}

/// Bluetooth LE transport on the first system adapter.
pub struct BtleplugTransport {
    /// The BLE adapter.
    adapter: Adapter,
    /// Peripherals seen while scanning, by identity.
    peripherals: Arc<RwLock<HashMap<String, Peripheral>>>,
    /// The open link, if any.
    link: Arc<RwLock<Option<Link>>>,
    /// Last reported adapter power state.
    powered: Arc<AtomicBool>,
    /// Whether advertisements should be reported.
    scanning: Arc<AtomicBool>,
    /// Sink for transport events.
    event_tx: EventSender,
    /// Handle to the central event task.
    central_task: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugTransport {
    /// Open the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdapterDisabled`] if no adapter is present.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(Error::AdapterDisabled)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        let state = adapter.adapter_state().await;
        let transport = Self::with_adapter(adapter);
        transport
            .powered
            .store(is_powered(state), Ordering::SeqCst);
        Ok(transport)
    }

    /// Use a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            link: Arc::new(RwLock::new(None)),
            powered: Arc::new(AtomicBool::new(true)),
            scanning: Arc::new(AtomicBool::new(false)),
            event_tx: Arc::new(RwLock::new(None)),
            central_task: Mutex::new(None),
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    fn linked_peripheral(&self) -> Result<Peripheral> {
        self.link
            .read()
            .as_ref()
            .map(|link| link.peripheral.clone())
            .ok_or(Error::NotConnected)
    }

    fn characteristic(&self, endpoint: &Uuid) -> Result<(Peripheral, Characteristic)> {
        let link = self.link.read();
        let link = link.as_ref().ok_or(Error::NotConnected)?;
        let characteristic = link
            .characteristics
            .get(endpoint)
            .cloned()
            .ok_or(Error::CapabilityMissing {
                endpoint: *endpoint,
            })?;
        Ok((link.peripheral.clone(), characteristic))
    }

    async fn find_peripheral(&self, identity: &DeviceId) -> Result<Peripheral> {
        if let Some(peripheral) = self.peripherals.read().get(identity.as_str()).cloned() {
            return Ok(peripheral);
        }

        // Not seen in this session; ask the adapter for anything it knows.
        self.adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == identity.as_str())
            .ok_or_else(|| Error::DeviceNotFound {
                identity: identity.to_string(),
            })
    }

    /// Handle a BLE central event.
    async fn handle_central_event(
        event: CentralEvent,
        adapter: &Adapter,
        peripherals: &RwLock<HashMap<String, Peripheral>>,
        link: &RwLock<Option<Link>>,
        powered: &AtomicBool,
        scanning: &AtomicBool,
        event_tx: &EventSender,
    ) {
        let send = |event: TransportEvent| {
            if let Some(tx) = event_tx.read().as_ref() {
                let _ = tx.unbounded_send(event);
            }
        };

        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                if !scanning.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(device) = Self::describe_peripheral(adapter, &id, peripherals).await {
                    send(TransportEvent::DeviceDiscovered(device));
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                let identity = id.to_string();
                let dropped = {
                    let mut link = link.write();
                    match link.as_ref() {
                        Some(current) if current.identity.as_str() == identity => link.take(),
                        _ => None,
                    }
                };
                match dropped {
                    Some(dropped) => {
                        warn!("Peripheral {} disconnected", identity);
                        send(TransportEvent::LinkDown {
                            identity: dropped.identity.clone(),
                        });
                    }
                    None => debug!("Device disconnected: {}", identity),
                }
            }
            CentralEvent::StateUpdate(CentralState::PoweredOn) => {
                info!("Bluetooth adapter powered on");
                powered.store(true, Ordering::SeqCst);
                send(TransportEvent::AdapterPoweredOn);
            }
            CentralEvent::StateUpdate(CentralState::PoweredOff) => {
                warn!("Bluetooth adapter powered off");
                powered.store(false, Ordering::SeqCst);
                send(TransportEvent::AdapterPoweredOff);
            }
            _ => {}
        }
    }

    /// Look up a peripheral's advertised properties and cache its handle.
    async fn describe_peripheral(
        adapter: &Adapter,
        id: &PeripheralId,
        peripherals: &RwLock<HashMap<String, Peripheral>>,
    ) -> Option<DiscoveredDevice> {
        let peripheral = match adapter.peripheral(id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return None;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return None,
        };

        let identity = id.to_string();
        peripherals.write().insert(identity.clone(), peripheral);

        Some(DiscoveredDevice {
            identity: DeviceId::new(identity),
            name: properties.local_name,
            rssi: properties.rssi,
        })
    }
}

/// Whether an adapter state reading means the radio can be used.
///
/// Only an explicit power-off counts as off; an unknown or unreadable state
/// lets the scan attempt report its own error.
fn is_powered(state: btleplug::Result<CentralState>) -> bool {
    match state {
        Ok(CentralState::PoweredOff) => {
            warn!("Bluetooth adapter is powered off");
            false
        }
        Ok(CentralState::PoweredOn) => true,
        Ok(state) => {
            debug!("Bluetooth adapter state {:?}, assuming on", state);
            true
        }
        Err(e) => {
            debug!("Could not read adapter state, assuming on: {}", e);
            true
        }
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    fn adapter_enabled(&self) -> Result<bool> {
        Ok(self.powered.load(Ordering::SeqCst))
    }

    async fn start_scan(&self) -> Result<()> {
        info!("Starting BLE scan");
        self.adapter.start_scan(ScanFilter::default()).await?;
        self.scanning.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        if !self.scanning.swap(false, Ordering::SeqCst) {
            debug!("Not scanning, ignoring stop request");
            return Ok(());
        }
        info!("Stopping BLE scan");
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn open_link(&self, identity: &DeviceId) -> Result<()> {
        let peripheral = self.find_peripheral(identity).await?;

        debug!("Connecting to {}", identity);
        peripheral.connect().await?;

        *self.link.write() = Some(Link {
            identity: identity.clone(),
            peripheral,
            characteristics: HashMap::new(),
            notification_task: None,
        });

        Ok(())
    }

    async fn close_link(&self) -> Result<()> {
        let Some(link) = self.link.write().take() else {
            return Ok(());
        };

        let peripheral = link.peripheral.clone();
        drop(link);

        if peripheral.is_connected().await.unwrap_or(false) {
            peripheral.disconnect().await?;
        }
        debug!("Link closed");
        Ok(())
    }

    async fn negotiate_transport_unit(&self, size: u16) -> Result<Option<u16>> {
        // btleplug negotiates the ATT MTU itself during connection.
        debug!("Transport unit of {} bytes left to the platform", size);
        Ok(None)
    }

    async fn discover_capabilities(&self) -> Result<Vec<Capability>> {
        let peripheral = self.linked_peripheral()?;
        peripheral.discover_services().await?;

        let mut capabilities = Vec::new();
        let mut characteristics = HashMap::new();

        for service in peripheral.services() {
            for characteristic in service.characteristics {
                debug!(
                    "Found characteristic: {} in service {}",
                    characteristic.uuid, service.uuid
                );
                capabilities.push(Capability {
                    service: service.uuid,
                    endpoint: characteristic.uuid,
                });
                characteristics.insert(characteristic.uuid, characteristic);
            }
        }

        if let Some(link) = self.link.write().as_mut() {
            link.characteristics = characteristics;
        }

        debug!("Discovered {} characteristics", capabilities.len());
        Ok(capabilities)
    }

    async fn write_endpoint(&self, endpoint: Uuid, payload: &[u8]) -> Result<()> {
        let (peripheral, characteristic) = self.characteristic(&endpoint)?;

        peripheral
            .write(&characteristic, payload, WriteType::WithResponse)
            .await?;

        trace!(
            "Wrote {} bytes to {} endpoint",
            payload.len(),
            endpoint_name(&endpoint)
        );
        Ok(())
    }

    async fn enable_notifications(&self, endpoint: Uuid) -> Result<()> {
        let (peripheral, characteristic) = self.characteristic(&endpoint)?;

        peripheral.subscribe(&characteristic).await?;
        let mut notifications = peripheral.notifications().await?;

        let event_tx = self.event_tx.clone();
        let task = tokio::spawn(async move {
            debug!("Notification listener started");
            while let Some(notification) = notifications.next().await {
                trace!(
                    "Notification from {}: {} bytes",
                    notification.uuid,
                    notification.value.len()
                );
                if let Some(tx) = event_tx.read().as_ref() {
                    let _ = tx.unbounded_send(TransportEvent::Notification {
                        endpoint: notification.uuid,
                        data: notification.value,
                    });
                }
            }
            debug!("Notification listener stopped");
        });

        match self.link.write().as_mut() {
            Some(link) => {
                if let Some(previous) = link.notification_task.replace(task) {
                    previous.abort();
                }
            }
            None => task.abort(),
        }

        debug!("Subscribed to {} notifications", endpoint_name(&endpoint));
        Ok(())
    }

    fn events(&self) -> BoxStream<'static, TransportEvent> {
        let (tx, rx) = mpsc::unbounded();
        *self.event_tx.write() = Some(tx);

        let adapter = self.adapter.clone();
        let peripherals = self.peripherals.clone();
        let link = self.link.clone();
        let powered = self.powered.clone();
        let scanning = self.scanning.clone();
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to get adapter events: {}", e);
                    return;
                }
            };

            while let Some(event) = events.next().await {
                Self::handle_central_event(
                    event,
                    &adapter,
                    &peripherals,
                    &link,
                    &powered,
                    &scanning,
                    &event_tx,
                )
                .await;
            }

            debug!("Central event loop ended");
        });

        if let Some(previous) = self.central_task.lock().replace(handle) {
            previous.abort();
        }

        rx.boxed()
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        if let Some(task) = self.central_task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_powered_off_adapter_reads_as_off() {
        assert!(!is_powered(Ok(CentralState::PoweredOff)));
        assert!(is_powered(Ok(CentralState::PoweredOn)));
        assert!(is_powered(Ok(CentralState::Unknown)));
        assert!(is_powered(Err(btleplug::Error::NotSupported(
            "adapter state".to_string()
        ))));
    }

    #[test]
    fn test_transport_is_shareable() {
        fn assert_send_sync<T: Send + Sync + 'static>() {}
        assert_send_sync::<BtleplugTransport>();
    }
}
