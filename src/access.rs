//! Host permission check.

/// Reports whether the host has granted the access needed to scan and connect.
///
/// Asking the user for access is left to the application; the state machine
/// only refuses to scan while access is missing.
pub trait AccessGate: Send + Sync {
    /// Whether scanning and connecting are currently allowed.
    fn has_required_access(&self) -> bool;
}

/// Gate for platforms without a runtime permission model.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysGranted;

impl AccessGate for AlwaysGranted {
    fn has_required_access(&self) -> bool {
        true
    }
}

impl<F> AccessGate for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn has_required_access(&self) -> bool {
        self()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_closure_gate() {
        let granted = Arc::new(AtomicBool::new(false));
        let flag = granted.clone();
        let gate = move || flag.load(Ordering::SeqCst);

        assert!(!gate.has_required_access());
        granted.store(true, Ordering::SeqCst);
        assert!(gate.has_required_access());
        assert!(AlwaysGranted.has_required_access());
    }
}
