//! Cancellable timed continuations for the connection state machine.
//!
//! Every delay the state machine needs (scan window, settle waits, reconnect
//! backoff) goes through [`TimerService`]. A timer is a spawned
//! `tokio::time::sleep` that posts a [`TimerFired`] message back into the
//! state machine's queue. At most one timer per [`TimerKind`] is live;
//! scheduling again replaces it. A firing that raced with a cancel is
//! recognised by its token and dropped in [`TimerService::accept`].

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

/// The delays the state machine schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// End of the scan window.
    ScanWindow,
    /// Pause between stopping and restarting a scan.
    ScanRestart,
    /// Settle wait inside the handshake.
    HandshakeSettle,
    /// Wait before a reconnect scan.
    ReconnectBackoff,
    /// Wait between a scan match and the automatic connect.
    ConnectSettle,
}

/// Message posted when a timer elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    /// Which timer.
    pub kind: TimerKind,
    /// Token returned by [`TimerService::schedule`].
    pub token: u64,
}

/// Owns every live timer of one state machine.
pub struct TimerService<T> {
    tx: mpsc::UnboundedSender<T>,
    next_token: u64,
    active: HashMap<TimerKind, (u64, JoinHandle<()>)>,
}

impl<T> TimerService<T>
where
    T: From<TimerFired> + Send + 'static,
{
    /// Create a service posting firings into `tx`.
    pub fn new(tx: mpsc::UnboundedSender<T>) -> Self {
        Self {
            tx,
            next_token: 0,
            active: HashMap::new(),
        }
    }

    /// Start a timer, replacing any live timer of the same kind.
    pub fn schedule(&mut self, kind: TimerKind, delay: Duration) -> u64 {
        self.cancel(kind);

        self.next_token += 1;
        let token = self.next_token;
        let tx = self.tx.clone();

        trace!("Scheduling {:?} timer #{} in {:?}", kind, token, delay);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(T::from(TimerFired { kind, token }));
        });

        self.active.insert(kind, (token, handle));
        token
    }

    /// Cancel the live timer of `kind`, if any.
    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some((token, handle)) = self.active.remove(&kind) {
            trace!("Cancelling {:?} timer #{}", kind, token);
            handle.abort();
        }
    }

    /// Cancel every live timer.
    pub fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.active.drain() {
            handle.abort();
        }
    }

    /// Whether a timer of `kind` is live.
    pub fn is_pending(&self, kind: TimerKind) -> bool {
        self.active.contains_key(&kind)
    }

    /// Check a firing against the live timers.
    ///
    /// Returns `true` and retires the timer if the firing is current; `false`
    /// if the timer was cancelled or replaced in the meantime.
    pub fn accept(&mut self, fired: TimerFired) -> bool {
        match self.active.get(&fired.kind) {
            Some((token, _)) if *token == fired.token => {
                self.active.remove(&fired.kind);
                true
            }
            _ => {
                trace!("Dropping stale {:?} timer #{}", fired.kind, fired.token);
                false
            }
        }
    }
}

impl<T> Drop for TimerService<T> {
    fn drop(&mut self) {
        for (_, (_, handle)) in self.active.drain() {
            handle.abort();
        }
    }
}
