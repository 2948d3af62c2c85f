//! Per-scan device deduplication.

use std::collections::HashSet;

use crate::ble::transport::{DeviceId, DiscoveredDevice};

/// Tracks which peripherals have been seen during the current scan pass.
///
/// Scanners report the same peripheral many times; only the first sighting
/// after a [`reset`](Self::reset) counts as new.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    seen: HashSet<DeviceId>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget every sighting. Called once at the start of each scan.
    pub fn reset(&mut self) {
        self.seen.clear();
    }

    /// Record a sighting. Returns `true` on the first sighting since the last reset.
    pub fn observe(&mut self, device: &DiscoveredDevice) -> bool {
        self.seen.insert(device.identity.clone())
    }

    /// Whether `identity` was seen since the last reset.
    pub fn contains(&self, identity: &DeviceId) -> bool {
        self.seen.contains(identity)
    }

    /// Number of distinct peripherals seen.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Check if nothing was seen yet.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_is_new_once_per_identity() {
        let mut registry = DeviceRegistry::new();
        let a = DiscoveredDevice::new("AA", Some("Bottle"));
        let b = DiscoveredDevice::new("BB", None);

        assert!(registry.observe(&a));
        assert!(!registry.observe(&a));
        assert!(registry.observe(&b));
        assert!(!registry.observe(&b));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_dedup_ignores_name_changes() {
        let mut registry = DeviceRegistry::new();
        assert!(registry.observe(&DiscoveredDevice::new("AA", None)));
        assert!(!registry.observe(&DiscoveredDevice::new("AA", Some("Bottle"))));
    }

    #[test]
    fn test_reset_forgets_sightings() {
        let mut registry = DeviceRegistry::new();
        let a = DiscoveredDevice::new("AA", None);
        registry.observe(&a);
        registry.reset();

        assert!(registry.is_empty());
        assert!(!registry.contains(&a.identity));
        assert!(registry.observe(&a));
    }
}
