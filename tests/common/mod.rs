//! Shared setup for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use smart_bottle_ble::{
    AccessGate, AlwaysGranted, ConnectionState, DeviceManager, IdentityStore, ManagerConfig,
    MemoryIdentityStore, MockTransport,
};
use tracing_subscriber::EnvFilter;

/// Time the default handshake needs to reach `Connected`, with margin.
pub const HANDSHAKE_TIME: Duration = Duration::from_secs(2);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn manager(mock: &MockTransport) -> DeviceManager {
    manager_with(mock, Arc::new(MemoryIdentityStore::new()), ManagerConfig::default())
}

pub fn manager_with(
    mock: &MockTransport,
    store: Arc<dyn IdentityStore>,
    config: ManagerConfig,
) -> DeviceManager {
    init_tracing();
    let access: Arc<dyn AccessGate> = Arc::new(AlwaysGranted);
    DeviceManager::with_collaborators(Arc::new(mock.clone()), store, access, config)
}

/// Connect to `identity` and wait for the handshake to finish.
pub async fn connect_ready(manager: &DeviceManager, identity: &str) {
    manager.connect(identity).await.unwrap();
    tokio::time::sleep(HANDSHAKE_TIME).await;
    assert_eq!(manager.connection_state(), ConnectionState::Connected);
}

/// Let queued inputs drain without moving far in time.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
