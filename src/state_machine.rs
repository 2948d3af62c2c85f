//! Connection lifecycle state machine.
//!
//! A single task owns every piece of mutable connection state and consumes
//! one queue of [`Input`]s: public commands, transport events, results of
//! transport operations and timer firings. Nothing else writes the state, so
//! the handlers below never race with each other.
//!
//! Transport operations that belong to the handshake are spawned and report
//! back as [`Completion`]s tagged with the link attempt that issued them;
//! completions from an attempt that has since been torn down are dropped.
//! Scan start/stop and link close are awaited inline.
//!
//! Consumers see the state through [`Shared`], a set of snapshots behind
//! `RwLock`s plus broadcast channels, all written only from here.

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use futures::stream::StreamExt;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::access::AccessGate;
use crate::ble::connection::{ConnectionState, FailureReason};
use crate::ble::reconnect::{ReconnectDecision, ReconnectPolicy};
use crate::ble::registry::DeviceRegistry;
use crate::ble::transport::{Capability, DeviceId, DiscoveredDevice, Transport, TransportEvent};
use crate::ble::uuids::TELEMETRY_CHARACTERISTIC_UUID;
use crate::config::ManagerConfig;
use crate::data::{ReadingHistory, TelemetryRecord};
use crate::error::{Error, Result};
use crate::protocol::frame::FrameAssembler;
use crate::protocol::handshake::{
    HandshakeFailure, HandshakeRequest, HandshakeSequencer, HandshakeStep, Transition,
};
use crate::store::IdentityStore;
use crate::timer::{TimerFired, TimerKind, TimerService};

/// Capacity of the broadcast channels.
const STATE_CHANNEL_CAPACITY: usize = 32;
const READING_CHANNEL_CAPACITY: usize = 256;
const DEVICE_CHANNEL_CAPACITY: usize = 64;

/// Snapshots published by the state machine.
pub(crate) struct Shared {
    pub(crate) state: RwLock<ConnectionState>,
    pub(crate) history: RwLock<ReadingHistory>,
    pub(crate) devices: RwLock<Vec<DiscoveredDevice>>,
    pub(crate) remembered: RwLock<Option<DeviceId>>,
    pub(crate) reconnect_attempts: AtomicU32,
    pub(crate) rejected_frames: AtomicU64,
    pub(crate) state_tx: broadcast::Sender<ConnectionState>,
    pub(crate) reading_tx: broadcast::Sender<TelemetryRecord>,
    pub(crate) device_tx: broadcast::Sender<DiscoveredDevice>,
}

impl Shared {
    fn new(history_capacity: usize, remembered: Option<DeviceId>) -> Self {
        let (state_tx, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        let (reading_tx, _) = broadcast::channel(READING_CHANNEL_CAPACITY);
        let (device_tx, _) = broadcast::channel(DEVICE_CHANNEL_CAPACITY);

        Self {
            state: RwLock::new(ConnectionState::Disconnected),
            history: RwLock::new(ReadingHistory::with_capacity(history_capacity)),
            devices: RwLock::new(Vec::new()),
            remembered: RwLock::new(remembered),
            reconnect_attempts: AtomicU32::new(0),
            rejected_frames: AtomicU64::new(0),
            state_tx,
            reading_tx,
            device_tx,
        }
    }
}

/// Public operations, each with its reply channel.
pub(crate) enum Command {
    BeginScan(oneshot::Sender<Result<()>>),
    RestartScan(oneshot::Sender<Result<()>>),
    StopScan(oneshot::Sender<Result<()>>),
    Connect(DeviceId, oneshot::Sender<Result<()>>),
    Disconnect(oneshot::Sender<Result<()>>),
    RestoreLastDevice(oneshot::Sender<Result<Option<DeviceId>>>),
    ClearReadings(oneshot::Sender<()>),
    Shutdown(Option<oneshot::Sender<()>>),
}

/// Result of a spawned transport operation.
pub(crate) enum Completion {
    LinkOpened(Result<()>),
    TransportUnit(Result<Option<u16>>),
    Capabilities(Result<Vec<Capability>>),
    WriteAck { endpoint: Uuid, result: Result<()> },
    NotificationsEnabled { endpoint: Uuid, result: Result<()> },
}

/// Everything the state machine reacts to.
pub(crate) enum Input {
    Command(Command),
    Transport(TransportEvent),
    Completion { attempt: u64, completion: Completion },
    Timer(TimerFired),
}

impl From<TimerFired> for Input {
    fn from(fired: TimerFired) -> Self {
        Input::Timer(fired)
    }
}

/// Who asked for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectOrigin {
    /// A caller of the public API.
    Explicit,
    /// The reconnection policy, after a scan match.
    Auto,
}

/// One try at linking to a peripheral.
struct LinkAttempt {
    id: u64,
    identity: DeviceId,
    /// `None` until the link is up.
    handshake: Option<HandshakeSequencer>,
    assembler: FrameAssembler,
}

impl LinkAttempt {
    fn is_ready(&self) -> bool {
        self.handshake
            .as_ref()
            .is_some_and(|h| h.step() == HandshakeStep::Ready)
    }

    fn accepts_telemetry(&self) -> bool {
        self.handshake
            .as_ref()
            .is_some_and(HandshakeSequencer::accepts_telemetry)
    }
}

/// Handles returned by [`spawn`].
pub(crate) struct Spawned {
    pub(crate) shared: Arc<Shared>,
    pub(crate) tx: mpsc::UnboundedSender<Input>,
    pub(crate) task: JoinHandle<()>,
}

/// Start the state machine on the current Tokio runtime.
///
/// The remembered identity is read from `store` here, once.
pub(crate) fn spawn(
    transport: Arc<dyn Transport>,
    store: Arc<dyn IdentityStore>,
    access: Arc<dyn AccessGate>,
    config: ManagerConfig,
) -> Spawned {
    let remembered = match store.load() {
        Ok(remembered) => remembered,
        Err(e) => {
            warn!("Failed to load remembered device: {}", e);
            None
        }
    };
    if let Some(identity) = &remembered {
        debug!("Remembered device: {}", identity);
    }

    let shared = Arc::new(Shared::new(config.history_capacity, remembered.clone()));
    let (tx, rx) = mpsc::unbounded_channel();

    // Subscribe before returning so no event emitted afterwards is missed.
    let mut events = transport.events();
    let pump_tx = tx.clone();
    let pump = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if pump_tx.send(Input::Transport(event)).is_err() {
                break;
            }
        }
        trace!("Transport event pump ended");
    });

    let machine = StateMachine {
        policy: ReconnectPolicy::new(config.max_reconnect_attempts, config.reconnect_backoff_step),
        timers: TimerService::new(tx.clone()),
        config,
        transport,
        store,
        access,
        shared: shared.clone(),
        tx: tx.clone(),
        registry: DeviceRegistry::new(),
        remembered,
        scanning: false,
        attempt: None,
        next_attempt_id: 0,
        pending_auto_connect: None,
    };

    let task = tokio::spawn(async move {
        machine.run(rx).await;
        pump.abort();
    });

    Spawned { shared, tx, task }
}

struct StateMachine {
    config: ManagerConfig,
    transport: Arc<dyn Transport>,
    store: Arc<dyn IdentityStore>,
    access: Arc<dyn AccessGate>,
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Input>,
    timers: TimerService<Input>,
    registry: DeviceRegistry,
    policy: ReconnectPolicy,
    remembered: Option<DeviceId>,
    scanning: bool,
    attempt: Option<LinkAttempt>,
    next_attempt_id: u64,
    /// Identity to connect to when the connect settle timer fires.
    pending_auto_connect: Option<DeviceId>,
}

impl StateMachine {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Input>) {
        debug!("Connection state machine started");

        while let Some(input) = rx.recv().await {
            match input {
                Input::Command(command) => {
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                Input::Transport(event) => self.handle_transport_event(event).await,
                Input::Completion {
                    attempt,
                    completion,
                } => self.handle_completion(attempt, completion).await,
                Input::Timer(fired) => {
                    if self.timers.accept(fired) {
                        self.handle_timer(fired.kind).await;
                    }
                }
            }
        }

        self.timers.cancel_all();
        debug!("Connection state machine stopped");
    }

    // === Commands ===

    /// Returns `false` once the machine should stop.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::BeginScan(reply) => {
                let _ = reply.send(self.begin_scan().await);
            }
            Command::RestartScan(reply) => {
                let _ = reply.send(self.restart_scan().await);
            }
            Command::StopScan(reply) => {
                self.stop_scan().await;
                let _ = reply.send(Ok(()));
            }
            Command::Connect(identity, reply) => {
                let _ = reply.send(self.connect(identity, ConnectOrigin::Explicit).await);
            }
            Command::Disconnect(reply) => {
                self.disconnect().await;
                let _ = reply.send(Ok(()));
            }
            Command::RestoreLastDevice(reply) => {
                let _ = reply.send(self.restore_last_device().await);
            }
            Command::ClearReadings(reply) => {
                self.clear_readings();
                let _ = reply.send(());
            }
            Command::Shutdown(reply) => {
                self.shutdown().await;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                return false;
            }
        }
        true
    }

    async fn begin_scan(&mut self) -> Result<()> {
        if self.attempt.is_some() {
            return Err(Error::LinkActive);
        }

        if !self.access.has_required_access() {
            warn!("Missing Bluetooth permissions, not scanning");
            self.set_state(ConnectionState::Error(FailureReason::PermissionDenied));
            return Err(Error::PermissionDenied);
        }

        match self.transport.adapter_enabled() {
            Ok(true) => {}
            Ok(false) => {
                warn!("Bluetooth adapter is off, not scanning");
                self.set_state(ConnectionState::Error(FailureReason::AdapterDisabled));
                return Err(Error::AdapterDisabled);
            }
            Err(e) => {
                warn!("Bluetooth adapter unavailable: {}", e);
                self.set_state(ConnectionState::Error(FailureReason::AdapterDisabled));
                return Err(Error::AdapterDisabled);
            }
        }

        if self.scanning {
            debug!("Cancelling outstanding scan");
            self.halt_scan().await;
        }
        self.timers.cancel(TimerKind::ScanRestart);
        self.timers.cancel(TimerKind::ReconnectBackoff);
        self.timers.cancel(TimerKind::ConnectSettle);
        self.pending_auto_connect = None;

        self.registry.reset();
        self.shared.devices.write().clear();
        self.set_state(ConnectionState::Scanning);

        if let Err(e) = self.transport.start_scan().await {
            error!("Failed to start scan: {}", e);
            self.set_state(ConnectionState::Error(FailureReason::ScanFailed(None)));
            return Err(e);
        }

        self.scanning = true;
        self.timers
            .schedule(TimerKind::ScanWindow, self.config.scan_window);
        info!("Scanning for {:?}", self.config.scan_window);

        Ok(())
    }

    async fn restart_scan(&mut self) -> Result<()> {
        if self.attempt.is_some() {
            return Err(Error::LinkActive);
        }
        if self.scanning {
            self.halt_scan().await;
        }
        debug!(
            "Restarting scan in {:?}",
            self.config.scan_restart_delay
        );
        self.timers
            .schedule(TimerKind::ScanRestart, self.config.scan_restart_delay);
        Ok(())
    }

    async fn stop_scan(&mut self) {
        self.timers.cancel(TimerKind::ScanRestart);
        if !self.scanning {
            return;
        }
        self.halt_scan().await;
        info!("Scan stopped");
        if self.attempt.is_none() {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Stop the transport scan and its window without touching the state.
    async fn halt_scan(&mut self) {
        self.timers.cancel(TimerKind::ScanWindow);
        self.scanning = false;
        if let Err(e) = self.transport.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
    }

    async fn connect(&mut self, identity: DeviceId, origin: ConnectOrigin) -> Result<()> {
        if let Some(attempt) = &self.attempt {
            if attempt.identity == identity {
                if attempt.is_ready() {
                    debug!("Already connected to {}", identity);
                    return Ok(());
                }
                return Err(Error::ConnectionInProgress {
                    identity: identity.to_string(),
                });
            }
            info!(
                "Closing link to {} before connecting to {}",
                attempt.identity, identity
            );
            self.close_attempt().await;
        }

        if origin == ConnectOrigin::Explicit {
            self.policy.on_explicit_connect();
            self.publish_attempts();
        }

        self.timers.cancel(TimerKind::ScanWindow);
        self.timers.cancel(TimerKind::ScanRestart);
        self.timers.cancel(TimerKind::ConnectSettle);
        self.timers.cancel(TimerKind::ReconnectBackoff);
        self.pending_auto_connect = None;
        if self.scanning {
            self.halt_scan().await;
        }

        self.remember(&identity);

        self.next_attempt_id += 1;
        let attempt_id = self.next_attempt_id;
        self.attempt = Some(LinkAttempt {
            id: attempt_id,
            identity: identity.clone(),
            handshake: None,
            assembler: FrameAssembler::new(),
        });
        self.set_state(ConnectionState::Connecting);
        info!("Connecting to {} ({:?})", identity, origin);

        let transport = self.transport.clone();
        self.spawn_completion(attempt_id, async move {
            Completion::LinkOpened(transport.open_link(&identity).await)
        });

        Ok(())
    }

    async fn disconnect(&mut self) {
        info!("Disconnecting");

        self.timers.cancel_all();
        self.pending_auto_connect = None;
        if self.scanning {
            self.halt_scan().await;
        }
        self.close_attempt().await;

        self.policy.on_user_disconnect();
        self.publish_attempts();
        self.set_state(ConnectionState::Disconnected);

        if self.config.clear_readings_on_disconnect {
            self.clear_readings();
        }
    }

    async fn restore_last_device(&mut self) -> Result<Option<DeviceId>> {
        match self.remembered.clone() {
            Some(identity) => {
                info!("Restoring connection to {}", identity);
                self.connect(identity.clone(), ConnectOrigin::Explicit)
                    .await?;
                Ok(Some(identity))
            }
            None => {
                debug!("No remembered device to restore");
                Ok(None)
            }
        }
    }

    fn clear_readings(&mut self) {
        self.shared.history.write().clear();
        debug!("Cleared all readings");
    }

    async fn shutdown(&mut self) {
        info!("Shutting down connection state machine");
        self.timers.cancel_all();
        if self.scanning {
            self.halt_scan().await;
        }
        self.close_attempt().await;
        self.set_state(ConnectionState::Disconnected);
    }

    // === Transport events ===

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::DeviceDiscovered(device) => self.on_device_discovered(device).await,
            TransportEvent::ScanFailed { code } => {
                if !self.scanning {
                    debug!("Ignoring scan failure {} while not scanning", code);
                    return;
                }
                error!("Scan failed with code {}", code);
                self.timers.cancel(TimerKind::ScanWindow);
                self.scanning = false;
                self.set_state(ConnectionState::Error(FailureReason::ScanFailed(Some(code))));
            }
            TransportEvent::LinkDown { identity } => {
                match &self.attempt {
                    Some(attempt) if attempt.identity == identity => {
                        warn!("Link to {} lost", identity);
                        self.on_link_lost();
                    }
                    _ => debug!("Ignoring link down for {}", identity),
                }
            }
            TransportEvent::Notification { endpoint, data } => {
                self.on_notification(endpoint, &data)
            }
            TransportEvent::AdapterPoweredOff => {
                warn!("Bluetooth adapter switched off");
                if self.scanning {
                    self.timers.cancel(TimerKind::ScanWindow);
                    self.scanning = false;
                    self.set_state(ConnectionState::Error(FailureReason::AdapterDisabled));
                }
                if self.attempt.is_some() {
                    self.on_link_lost();
                }
            }
            TransportEvent::AdapterPoweredOn => {
                info!("Bluetooth adapter switched on");
                if self.attempt.is_some() {
                    return;
                }
                let decision = self.policy.on_power_restored(self.remembered.is_some());
                self.apply_reconnect_decision(decision);
            }
        }
    }

    async fn on_device_discovered(&mut self, device: DiscoveredDevice) {
        if !self.scanning {
            trace!("Ignoring {} seen outside a scan", device.identity);
            return;
        }

        if self.registry.observe(&device) {
            if device.name.is_some() || !self.config.require_device_name {
                info!(
                    "Found device: {} ({})",
                    device.display_name(),
                    device.identity
                );
                self.shared.devices.write().push(device.clone());
                let _ = self.shared.device_tx.send(device.clone());
            } else {
                trace!("Not listing unnamed device {}", device.identity);
            }
        }

        let is_remembered = self.remembered.as_ref() == Some(&device.identity);
        if is_remembered
            && self.policy.allows_auto_connect()
            && self.pending_auto_connect.is_none()
        {
            info!("Remembered device {} in range", device.identity);
            self.halt_scan().await;
            self.pending_auto_connect = Some(device.identity);
            self.timers
                .schedule(TimerKind::ConnectSettle, self.config.connect_settle);
        }
    }

    fn on_notification(&mut self, endpoint: Uuid, data: &[u8]) {
        let Some(attempt) = self.attempt.as_mut() else {
            trace!("Dropping notification without a link");
            return;
        };
        if endpoint != TELEMETRY_CHARACTERISTIC_UUID || !attempt.accepts_telemetry() {
            trace!("Dropping notification from {}", endpoint);
            return;
        }

        let rejected_before = attempt.assembler.rejected_frames();
        let records = attempt.assembler.feed(data);
        let rejected = attempt.assembler.rejected_frames() - rejected_before;
        if rejected > 0 {
            self.shared
                .rejected_frames
                .fetch_add(rejected, Ordering::SeqCst);
        }

        for record in records {
            debug!("Reading: {}", record);
            self.shared.history.write().push(record.clone());
            let _ = self.shared.reading_tx.send(record);
        }
    }

    /// Unsolicited loss of the current attempt.
    fn on_link_lost(&mut self) {
        self.timers.cancel(TimerKind::HandshakeSettle);
        self.attempt = None;
        self.set_state(ConnectionState::Disconnected);

        let decision = self.policy.on_link_lost(self.remembered.is_some());
        self.apply_reconnect_decision(decision);
    }

    fn apply_reconnect_decision(&mut self, decision: ReconnectDecision) {
        self.publish_attempts();
        match decision {
            ReconnectDecision::Retry { delay, .. } => {
                self.timers.schedule(TimerKind::ReconnectBackoff, delay);
            }
            ReconnectDecision::Suppressed
            | ReconnectDecision::NoPeripheral
            | ReconnectDecision::Exhausted { .. } => {}
        }
    }

    // === Completions ===

    async fn handle_completion(&mut self, attempt_id: u64, completion: Completion) {
        if self.attempt.as_ref().map(|a| a.id) != Some(attempt_id) {
            trace!("Dropping result for stale attempt #{}", attempt_id);
            return;
        }

        let transition = match completion {
            Completion::LinkOpened(result) => match self.on_link_opened(result) {
                Some(transition) => transition,
                None => return,
            },
            other => {
                let Some(handshake) = self.attempt.as_mut().and_then(|a| a.handshake.as_mut())
                else {
                    return;
                };
                match other {
                    Completion::TransportUnit(result) => handshake.on_transport_unit(result),
                    Completion::Capabilities(result) => handshake.on_capabilities(result),
                    Completion::WriteAck { endpoint, result } => {
                        handshake.on_write_ack(endpoint, result)
                    }
                    Completion::NotificationsEnabled { endpoint, result } => {
                        handshake.on_notifications_enabled(endpoint, result)
                    }
                    Completion::LinkOpened(_) => Transition::Ignored,
                }
            }
        };

        self.drive(transition).await;
    }

    /// Start the handshake once the link is up. A failed open counts as link loss.
    fn on_link_opened(&mut self, result: Result<()>) -> Option<Transition> {
        let params = self.config.handshake_params();
        let attempt = self.attempt.as_mut()?;

        match result {
            Ok(()) => {
                info!("Link to {} is up", attempt.identity);
                let handshake = attempt.handshake.insert(HandshakeSequencer::new(params));
                Some(handshake.start())
            }
            Err(e) => {
                warn!("Failed to open link to {}: {}", attempt.identity, e);
                self.on_link_lost();
                None
            }
        }
    }

    async fn drive(&mut self, transition: Transition) {
        match transition {
            Transition::Issue(request) => {
                self.sync_handshake_state();
                self.issue(request);
            }
            Transition::Deferred(delay) => {
                self.sync_handshake_state();
                self.timers.schedule(TimerKind::HandshakeSettle, delay);
            }
            Transition::Ready => self.on_handshake_ready(),
            Transition::Failed(failure) => self.on_handshake_failed(failure).await,
            Transition::Ignored => {}
        }
    }

    fn sync_handshake_state(&self) {
        let step = self
            .attempt
            .as_ref()
            .and_then(|a| a.handshake.as_ref())
            .map(HandshakeSequencer::step);
        if let Some(state) = step.and_then(ConnectionState::for_handshake_step) {
            self.set_state(state);
        }
    }

    fn issue(&self, request: HandshakeRequest) {
        let Some(attempt) = &self.attempt else {
            return;
        };
        let attempt_id = attempt.id;
        let transport = self.transport.clone();

        match request {
            HandshakeRequest::NegotiateTransportUnit { size } => {
                self.spawn_completion(attempt_id, async move {
                    Completion::TransportUnit(transport.negotiate_transport_unit(size).await)
                });
            }
            HandshakeRequest::DiscoverCapabilities => {
                self.spawn_completion(attempt_id, async move {
                    Completion::Capabilities(transport.discover_capabilities().await)
                });
            }
            HandshakeRequest::Write { endpoint, payload } => {
                self.spawn_completion(attempt_id, async move {
                    let result = transport.write_endpoint(endpoint, &payload).await;
                    Completion::WriteAck { endpoint, result }
                });
            }
            HandshakeRequest::EnableNotifications { endpoint } => {
                self.spawn_completion(attempt_id, async move {
                    let result = transport.enable_notifications(endpoint).await;
                    Completion::NotificationsEnabled { endpoint, result }
                });
            }
        }
    }

    fn on_handshake_ready(&mut self) {
        self.policy.on_connected();
        self.publish_attempts();
        self.set_state(ConnectionState::Connected);
        if let Some(attempt) = &self.attempt {
            info!("Connected to {}", attempt.identity);
        }
    }

    async fn on_handshake_failed(&mut self, failure: HandshakeFailure) {
        let reason = FailureReason::from(failure);
        error!("Handshake failed: {}", reason);
        self.close_attempt().await;
        self.set_state(ConnectionState::Error(reason));
    }

    // === Timers ===

    async fn handle_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::ScanWindow => {
                if !self.scanning {
                    return;
                }
                self.halt_scan().await;
                // Counted from the registry: unlisted unnamed devices were still found.
                let found = self.registry.len();
                if found == 0 {
                    warn!("Scan window elapsed without finding a device");
                    self.set_state(ConnectionState::Error(FailureReason::ScanTimeoutNoDevices));
                } else {
                    info!("Scan window elapsed, {} device(s) found", found);
                    self.set_state(ConnectionState::Disconnected);
                }
            }
            TimerKind::ScanRestart => {
                if let Err(e) = self.begin_scan().await {
                    warn!("Scan restart failed: {}", e);
                }
            }
            TimerKind::HandshakeSettle => {
                let transition = match self.attempt.as_mut().and_then(|a| a.handshake.as_mut()) {
                    Some(handshake) => handshake.take_deferred(),
                    None => return,
                };
                self.drive(transition).await;
            }
            TimerKind::ReconnectBackoff => {
                if self.attempt.is_some() {
                    return;
                }
                if let Err(e) = self.begin_scan().await {
                    warn!("Reconnect scan failed: {}", e);
                }
            }
            TimerKind::ConnectSettle => {
                if let Some(identity) = self.pending_auto_connect.take() {
                    if let Err(e) = self.connect(identity, ConnectOrigin::Auto).await {
                        warn!("Automatic connect failed: {}", e);
                    }
                }
            }
        }
    }

    // === Helpers ===

    /// Close the current attempt's link. The resulting link-down is expected
    /// and does not trigger reconnection.
    async fn close_attempt(&mut self) {
        self.timers.cancel(TimerKind::HandshakeSettle);
        if let Some(attempt) = self.attempt.take() {
            debug!("Closing link to {}", attempt.identity);
            if let Err(e) = self.transport.close_link().await {
                warn!("Error closing link, treating as closed: {}", e);
            }
        }
    }

    fn remember(&mut self, identity: &DeviceId) {
        self.remembered = Some(identity.clone());
        *self.shared.remembered.write() = Some(identity.clone());
        if let Err(e) = self.store.save(identity) {
            warn!("Failed to persist last device: {}", e);
        }
    }

    fn publish_attempts(&self) {
        self.shared
            .reconnect_attempts
            .store(self.policy.attempts(), Ordering::SeqCst);
    }

    fn spawn_completion<F>(&self, attempt: u64, operation: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let completion = operation.await;
            let _ = tx.send(Input::Completion {
                attempt,
                completion,
            });
        });
    }

    fn set_state(&self, new_state: ConnectionState) {
        let old_state = {
            let mut state = self.shared.state.write();
            std::mem::replace(&mut *state, new_state)
        };

        if old_state != new_state {
            debug!("Connection state changed: {} -> {}", old_state, new_state);
            let _ = self.shared.state_tx.send(new_state);
        }
    }
}
