//! Device manager for discovering and connecting to a smart bottle.
//!
//! [`DeviceManager`] is the public handle over the connection state machine.
//! Operations are forwarded to the state machine's task and return once it
//! has acted on them; observable state is read from snapshots without
//! waiting on the task.

use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info};

use crate::access::{AccessGate, AlwaysGranted};
use crate::ble::connection::ConnectionState;
use crate::ble::platform::BtleplugTransport;
use crate::ble::transport::{DeviceId, DiscoveredDevice, Transport};
use crate::callback::CallbackHandle;
use crate::config::ManagerConfig;
use crate::data::TelemetryRecord;
use crate::error::{Error, Result};
use crate::state_machine::{self, Command, Input, Shared};
use crate::store::{IdentityStore, JsonFileIdentityStore, MemoryIdentityStore};

/// Central manager for the connection to one smart bottle.
pub struct DeviceManager {
    /// Snapshots written by the state machine.
    shared: Arc<Shared>,
    /// Queue into the state machine.
    tx: mpsc::UnboundedSender<Input>,
    /// Callback ID counter.
    callback_counter: AtomicU64,
    /// State machine task handle.
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DeviceManager {
    /// Create a manager on the system Bluetooth adapter.
    ///
    /// The remembered device is kept in memory only and is forgotten when the
    /// process exits. Use [`with_identity_file`](Self::with_identity_file) to
    /// reconnect to the same bottle across restarts.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let transport = BtleplugTransport::new().await?;
        Ok(Self::with_collaborators(
            Arc::new(transport),
            Arc::new(MemoryIdentityStore::new()),
            Arc::new(AlwaysGranted),
            ManagerConfig::default(),
        ))
    }

    /// Create a manager on the system Bluetooth adapter that remembers the
    /// last connected bottle in the JSON file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn with_identity_file(path: impl Into<PathBuf>) -> Result<Self> {
        let transport = BtleplugTransport::new().await?;
        Ok(Self::persistent(Arc::new(transport), path))
    }

    /// Create a manager on `transport` that remembers the last connected
    /// bottle in the JSON file at `path`, with default access and config.
    pub fn persistent(transport: Arc<dyn Transport>, path: impl Into<PathBuf>) -> Self {
        Self::with_collaborators(
            transport,
            Arc::new(JsonFileIdentityStore::new(path)),
            Arc::new(AlwaysGranted),
            ManagerConfig::default(),
        )
    }

    /// Create a manager from explicit collaborators.
    ///
    /// The remembered device is read from `store` once, here. Must be called
    /// from within a Tokio runtime.
    pub fn with_collaborators(
        transport: Arc<dyn Transport>,
        store: Arc<dyn IdentityStore>,
        access: Arc<dyn AccessGate>,
        config: ManagerConfig,
    ) -> Self {
        let spawned = state_machine::spawn(transport, store, access, config);

        Self {
            shared: spawned.shared,
            tx: spawned.tx,
            callback_counter: AtomicU64::new(0),
            task: Mutex::new(Some(spawned.task)),
        }
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Input::Command(command(reply_tx)))
            .map_err(|_| Error::ManagerStopped)?;
        reply_rx.await.map_err(|_| Error::ManagerStopped)
    }

    // === Operations ===

    /// Start a scan window.
    ///
    /// Any running scan is cancelled and the discovered list is cleared.
    ///
    /// # Errors
    ///
    /// [`Error::PermissionDenied`] or [`Error::AdapterDisabled`] (the state
    /// also moves to `Error`), [`Error::LinkActive`] while a link exists, or
    /// the transport error if the scan could not start.
    pub async fn begin_scan(&self) -> Result<()> {
        self.request(Command::BeginScan).await?
    }

    /// Stop any scan, wait briefly, then [`begin_scan`](Self::begin_scan).
    ///
    /// Returns once the restart is scheduled; failures of the delayed scan
    /// surface through the connection state.
    pub async fn restart_scan(&self) -> Result<()> {
        self.request(Command::RestartScan).await?
    }

    /// Stop an active scan.
    pub async fn stop_scan(&self) -> Result<()> {
        self.request(Command::StopScan).await?
    }

    /// Connect to a peripheral and run the handshake.
    ///
    /// Returns once the attempt has started; watch
    /// [`connection_state`](Self::connection_state) for the outcome. The
    /// identity is remembered for automatic reconnection.
    ///
    /// # Errors
    ///
    /// [`Error::ConnectionInProgress`] if an attempt for the same identity is
    /// still running.
    pub async fn connect(&self, identity: impl Into<DeviceId>) -> Result<()> {
        let identity = identity.into();
        self.request(|reply| Command::Connect(identity, reply))
            .await?
    }

    /// Close the link and turn automatic reconnection off until the next
    /// [`connect`](Self::connect).
    pub async fn disconnect(&self) -> Result<()> {
        self.request(Command::Disconnect).await?
    }

    /// Connect to the remembered peripheral, if there is one.
    pub async fn restore_last_device(&self) -> Result<Option<DeviceId>> {
        self.request(Command::RestoreLastDevice).await?
    }

    /// Drop every stored reading.
    pub async fn clear_readings(&self) -> Result<()> {
        self.request(Command::ClearReadings).await
    }

    /// Close the link, stop scanning and stop the state machine.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down device manager");

        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(Input::Command(Command::Shutdown(Some(reply_tx))))
            .is_ok()
        {
            let _ = reply_rx.await;
        }

        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        Ok(())
    }

    // === Observable state ===

    /// Current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    /// Check if connected.
    pub fn is_connected(&self) -> bool {
        self.connection_state().is_connected()
    }

    /// Most recent reading.
    pub fn current_reading(&self) -> Option<TelemetryRecord> {
        self.shared.history.read().latest().cloned()
    }

    /// Recent readings, newest first.
    pub fn readings(&self) -> Vec<TelemetryRecord> {
        self.shared.history.read().to_vec()
    }

    /// Devices found by the current or last scan, in discovery order.
    pub fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        self.shared.devices.read().clone()
    }

    /// The remembered peripheral.
    pub fn remembered_device(&self) -> Option<DeviceId> {
        self.shared.remembered.read().clone()
    }

    /// Automatic reconnect attempts since the last successful connection.
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Telemetry frames dropped as malformed.
    pub fn rejected_frames(&self) -> u64 {
        self.shared.rejected_frames.load(Ordering::SeqCst)
    }

    // === Subscriptions ===

    /// Subscribe to connection state changes.
    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Subscribe to new readings.
    pub fn subscribe_readings(&self) -> broadcast::Receiver<TelemetryRecord> {
        self.shared.reading_tx.subscribe()
    }

    /// Subscribe to newly listed devices.
    pub fn subscribe_devices(&self) -> broadcast::Receiver<DiscoveredDevice> {
        self.shared.device_tx.subscribe()
    }

    /// Register a callback for connection state changes.
    pub fn on_state_changed<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.forward(self.shared.state_tx.subscribe(), callback)
    }

    /// Register a callback for new readings.
    pub fn on_reading<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(TelemetryRecord) + Send + Sync + 'static,
    {
        self.forward(self.shared.reading_tx.subscribe(), callback)
    }

    /// Register a callback for newly listed devices.
    pub fn on_device_discovered<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(DiscoveredDevice) + Send + Sync + 'static,
    {
        self.forward(self.shared.device_tx.subscribe(), callback)
    }

    fn forward<T, F>(&self, mut rx: broadcast::Receiver<T>, callback: F) -> CallbackHandle
    where
        T: Clone + Send + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(value) => callback(value),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Callback {} lagged by {} events", callback_id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        let _ = self.tx.send(Input::Command(Command::Shutdown(None)));
    }
}
