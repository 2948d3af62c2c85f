//! Post-connect handshake sequencing.
//!
//! After the link comes up the bottle expects a fixed setup sequence before
//! it starts streaming telemetry:
//!
//! 1. transport unit (MTU) negotiation, best-effort
//! 2. capability (service) discovery
//! 3. auth token write, which must be acknowledged
//! 4. enabling notifications on the telemetry endpoint
//! 5. clock sync write, best-effort
//!
//! [`HandshakeSequencer`] is a pure state machine: it never touches the
//! transport itself. Each input returns a [`Transition`] telling the caller
//! which request to issue next, how long to wait before resuming, or that
//! the sequence finished. One sequencer exists per link attempt, so results
//! from an older attempt must be filtered out before they reach it.

use std::collections::HashSet;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ble::transport::Capability;
use crate::ble::uuids::{
    endpoint_name, AUTH_KEY_CHARACTERISTIC_UUID, BOTTLE_SERVICE_UUID,
    TELEMETRY_CHARACTERISTIC_UUID, TIME_SYNC_CHARACTERISTIC_UUID,
};
use crate::error::Result;
use crate::utils::epoch_seconds_now;

/// Transport unit requested from the peripheral, in bytes.
pub const DEFAULT_TRANSPORT_UNIT: u16 = 512;

/// Default wait after the transport unit step and after enabling notifications.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Steps of the handshake, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HandshakeStep {
    /// Link is up, nothing issued yet.
    #[default]
    LinkUp,
    /// Waiting for the transport unit negotiation.
    NegotiateTransportUnit,
    /// Waiting for the capability list.
    DiscoverCapabilities,
    /// Waiting for the auth token write to be acknowledged.
    WriteAuthToken,
    /// Waiting for the notification subscription to be acknowledged.
    EnableNotifications,
    /// Waiting for the clock write to be acknowledged.
    SyncClock,
    /// Sequence completed.
    Ready,
    /// Sequence aborted.
    Failed,
}

impl std::fmt::Display for HandshakeStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LinkUp => write!(f, "link up"),
            Self::NegotiateTransportUnit => write!(f, "transport unit negotiation"),
            Self::DiscoverCapabilities => write!(f, "capability discovery"),
            Self::WriteAuthToken => write!(f, "auth token write"),
            Self::EnableNotifications => write!(f, "notification subscription"),
            Self::SyncClock => write!(f, "clock sync"),
            Self::Ready => write!(f, "ready"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A transport operation the caller must perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeRequest {
    /// Ask for a transport unit of `size` bytes.
    NegotiateTransportUnit {
        /// Requested size in bytes.
        size: u16,
    },
    /// List the services and endpoints of the peripheral.
    DiscoverCapabilities,
    /// Write `payload` to `endpoint` with acknowledgement.
    Write {
        /// Target endpoint.
        endpoint: Uuid,
        /// Bytes to write.
        payload: Vec<u8>,
    },
    /// Subscribe to notifications on `endpoint`.
    EnableNotifications {
        /// Endpoint to subscribe to.
        endpoint: Uuid,
    },
}

/// Why a handshake aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeFailure {
    /// A required step failed.
    StepFailed(HandshakeStep),
    /// A required endpoint is not exposed by the peripheral.
    CapabilityMissing(Uuid),
}

/// Result of feeding an input to the sequencer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Perform this request and report its result back.
    Issue(HandshakeRequest),
    /// Wait this long, then call [`HandshakeSequencer::take_deferred`].
    Deferred(Duration),
    /// The handshake completed.
    Ready,
    /// The handshake aborted.
    Failed(HandshakeFailure),
    /// The input does not belong to the current step.
    Ignored,
}

/// Tunables for one handshake run.
#[derive(Debug, Clone)]
pub struct HandshakeParams {
    /// Secret written to the auth endpoint.
    pub auth_token: Vec<u8>,
    /// Transport unit to request.
    pub transport_unit: u16,
    /// Wait after the transport unit step.
    pub settle_after_transport_unit: Duration,
    /// Wait after notifications are enabled.
    pub settle_after_notifications: Duration,
}

/// Drives the handshake for a single link attempt.
#[derive(Debug)]
pub struct HandshakeSequencer {
    params: HandshakeParams,
    step: HandshakeStep,
    /// Endpoints exposed by the bottle service.
    endpoints: HashSet<Uuid>,
    /// Set while a settle delay is running.
    deferred: bool,
    negotiated_unit: Option<u16>,
}

impl HandshakeSequencer {
    /// Create a sequencer for a freshly opened link.
    pub fn new(params: HandshakeParams) -> Self {
        Self {
            params,
            step: HandshakeStep::LinkUp,
            endpoints: HashSet::new(),
            deferred: false,
            negotiated_unit: None,
        }
    }

    /// Current step.
    pub fn step(&self) -> HandshakeStep {
        self.step
    }

    /// Whether telemetry from the peripheral should be accepted.
    ///
    /// True from the moment the subscription is requested: the peripheral
    /// may start notifying before its acknowledgement is processed.
    pub fn accepts_telemetry(&self) -> bool {
        matches!(
            self.step,
            HandshakeStep::EnableNotifications | HandshakeStep::SyncClock | HandshakeStep::Ready
        )
    }

    /// Whether the sequence reached [`HandshakeStep::Ready`] or failed.
    pub fn is_finished(&self) -> bool {
        matches!(self.step, HandshakeStep::Ready | HandshakeStep::Failed)
    }

    /// Transport unit granted by the peripheral, if one was reported.
    pub fn negotiated_transport_unit(&self) -> Option<u16> {
        self.negotiated_unit
    }

    /// Begin the sequence. Only valid right after link-up.
    pub fn start(&mut self) -> Transition {
        if self.step != HandshakeStep::LinkUp {
            return Transition::Ignored;
        }
        self.step = HandshakeStep::NegotiateTransportUnit;
        debug!("Requesting transport unit of {} bytes", self.params.transport_unit);
        Transition::Issue(HandshakeRequest::NegotiateTransportUnit {
            size: self.params.transport_unit,
        })
    }

    /// Result of the transport unit negotiation.
    ///
    /// Failure is logged and the default unit stays in use.
    pub fn on_transport_unit(&mut self, result: Result<Option<u16>>) -> Transition {
        if self.step != HandshakeStep::NegotiateTransportUnit {
            return Transition::Ignored;
        }

        match result {
            Ok(Some(unit)) => {
                debug!("Transport unit negotiated: {} bytes", unit);
                self.negotiated_unit = Some(unit);
            }
            Ok(None) => debug!("Transport unit left to the platform"),
            Err(e) => warn!("Transport unit negotiation failed, using default: {}", e),
        }

        self.step = HandshakeStep::DiscoverCapabilities;
        self.defer(self.params.settle_after_transport_unit)
    }

    /// Result of capability discovery.
    pub fn on_capabilities(&mut self, result: Result<Vec<Capability>>) -> Transition {
        if self.step != HandshakeStep::DiscoverCapabilities || self.deferred {
            return Transition::Ignored;
        }

        let capabilities = match result {
            Ok(capabilities) => capabilities,
            Err(e) => {
                warn!("Capability discovery failed: {}", e);
                return self.fail(HandshakeFailure::StepFailed(
                    HandshakeStep::DiscoverCapabilities,
                ));
            }
        };

        self.endpoints = capabilities
            .into_iter()
            .filter(|c| c.service == BOTTLE_SERVICE_UUID)
            .map(|c| c.endpoint)
            .collect();
        debug!("Bottle service exposes {} endpoints", self.endpoints.len());

        if !self.endpoints.contains(&AUTH_KEY_CHARACTERISTIC_UUID) {
            return self.fail(HandshakeFailure::CapabilityMissing(
                AUTH_KEY_CHARACTERISTIC_UUID,
            ));
        }

        self.step = HandshakeStep::WriteAuthToken;
        Transition::Issue(HandshakeRequest::Write {
            endpoint: AUTH_KEY_CHARACTERISTIC_UUID,
            payload: self.params.auth_token.clone(),
        })
    }

    /// Acknowledgement of a write on `endpoint`.
    pub fn on_write_ack(&mut self, endpoint: Uuid, result: Result<()>) -> Transition {
        match self.step {
            HandshakeStep::WriteAuthToken if endpoint == AUTH_KEY_CHARACTERISTIC_UUID => {
                if let Err(e) = result {
                    warn!("Auth token write rejected: {}", e);
                    return self.fail(HandshakeFailure::StepFailed(HandshakeStep::WriteAuthToken));
                }
                info!("Authenticated with peripheral");

                if !self.endpoints.contains(&TELEMETRY_CHARACTERISTIC_UUID) {
                    return self.fail(HandshakeFailure::CapabilityMissing(
                        TELEMETRY_CHARACTERISTIC_UUID,
                    ));
                }

                self.step = HandshakeStep::EnableNotifications;
                Transition::Issue(HandshakeRequest::EnableNotifications {
                    endpoint: TELEMETRY_CHARACTERISTIC_UUID,
                })
            }
            HandshakeStep::SyncClock
                if endpoint == TIME_SYNC_CHARACTERISTIC_UUID && !self.deferred =>
            {
                match result {
                    Ok(()) => debug!("Clock synced"),
                    Err(e) => warn!("Clock sync failed: {}", e),
                }
                self.step = HandshakeStep::Ready;
                Transition::Ready
            }
            _ => {
                debug!(
                    "Ignoring write ack for {} endpoint during {}",
                    endpoint_name(&endpoint),
                    self.step
                );
                Transition::Ignored
            }
        }
    }

    /// Acknowledgement of a notification subscription on `endpoint`.
    pub fn on_notifications_enabled(&mut self, endpoint: Uuid, result: Result<()>) -> Transition {
        if self.step != HandshakeStep::EnableNotifications
            || endpoint != TELEMETRY_CHARACTERISTIC_UUID
        {
            return Transition::Ignored;
        }

        if let Err(e) = result {
            warn!("Enabling notifications failed: {}", e);
            return self.fail(HandshakeFailure::StepFailed(
                HandshakeStep::EnableNotifications,
            ));
        }

        debug!("Telemetry notifications enabled");
        self.step = HandshakeStep::SyncClock;
        self.defer(self.params.settle_after_notifications)
    }

    /// Resume after a settle delay.
    ///
    /// Builds the request for the current step at call time, so the clock
    /// payload reflects the moment it is sent.
    pub fn take_deferred(&mut self) -> Transition {
        if !self.deferred {
            return Transition::Ignored;
        }
        self.deferred = false;

        match self.step {
            HandshakeStep::DiscoverCapabilities => {
                Transition::Issue(HandshakeRequest::DiscoverCapabilities)
            }
            HandshakeStep::SyncClock => {
                if !self.endpoints.contains(&TIME_SYNC_CHARACTERISTIC_UUID) {
                    warn!("Clock sync endpoint not exposed, skipping");
                    self.step = HandshakeStep::Ready;
                    return Transition::Ready;
                }
                let payload = epoch_seconds_now().to_string().into_bytes();
                Transition::Issue(HandshakeRequest::Write {
                    endpoint: TIME_SYNC_CHARACTERISTIC_UUID,
                    payload,
                })
            }
            _ => Transition::Ignored,
        }
    }

    fn defer(&mut self, delay: Duration) -> Transition {
        self.deferred = true;
        Transition::Deferred(delay)
    }

    fn fail(&mut self, failure: HandshakeFailure) -> Transition {
        self.step = HandshakeStep::Failed;
        self.deferred = false;
        Transition::Failed(failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use pretty_assertions::assert_eq;

    fn params() -> HandshakeParams {
        HandshakeParams {
            auth_token: b"mysecretkey123".to_vec(),
            transport_unit: DEFAULT_TRANSPORT_UNIT,
            settle_after_transport_unit: DEFAULT_SETTLE_DELAY,
            settle_after_notifications: DEFAULT_SETTLE_DELAY,
        }
    }

    fn capabilities(endpoints: &[Uuid]) -> Vec<Capability> {
        endpoints
            .iter()
            .map(|&endpoint| Capability {
                service: BOTTLE_SERVICE_UUID,
                endpoint,
            })
            .collect()
    }

    fn all_endpoints() -> Vec<Capability> {
        capabilities(&[
            TELEMETRY_CHARACTERISTIC_UUID,
            AUTH_KEY_CHARACTERISTIC_UUID,
            TIME_SYNC_CHARACTERISTIC_UUID,
        ])
    }

    /// Drive a sequencer up to the auth write.
    fn through_discovery(caps: Vec<Capability>) -> (HandshakeSequencer, Transition) {
        let mut seq = HandshakeSequencer::new(params());
        seq.start();
        assert_eq!(seq.on_transport_unit(Ok(Some(247))), Transition::Deferred(DEFAULT_SETTLE_DELAY));
        assert_eq!(
            seq.take_deferred(),
            Transition::Issue(HandshakeRequest::DiscoverCapabilities)
        );
        let t = seq.on_capabilities(Ok(caps));
        (seq, t)
    }

    #[test]
    fn test_full_sequence() {
        let mut seq = HandshakeSequencer::new(params());
        assert_eq!(
            seq.start(),
            Transition::Issue(HandshakeRequest::NegotiateTransportUnit { size: 512 })
        );
        assert_eq!(seq.step(), HandshakeStep::NegotiateTransportUnit);

        assert_eq!(
            seq.on_transport_unit(Ok(Some(247))),
            Transition::Deferred(DEFAULT_SETTLE_DELAY)
        );
        assert_eq!(seq.negotiated_transport_unit(), Some(247));
        assert_eq!(
            seq.take_deferred(),
            Transition::Issue(HandshakeRequest::DiscoverCapabilities)
        );

        assert_eq!(
            seq.on_capabilities(Ok(all_endpoints())),
            Transition::Issue(HandshakeRequest::Write {
                endpoint: AUTH_KEY_CHARACTERISTIC_UUID,
                payload: b"mysecretkey123".to_vec(),
            })
        );
        assert_eq!(seq.step(), HandshakeStep::WriteAuthToken);
        assert!(!seq.accepts_telemetry());

        assert_eq!(
            seq.on_write_ack(AUTH_KEY_CHARACTERISTIC_UUID, Ok(())),
            Transition::Issue(HandshakeRequest::EnableNotifications {
                endpoint: TELEMETRY_CHARACTERISTIC_UUID
            })
        );
        // Subscription requested but not yet acknowledged.
        assert!(seq.accepts_telemetry());

        assert_eq!(
            seq.on_notifications_enabled(TELEMETRY_CHARACTERISTIC_UUID, Ok(())),
            Transition::Deferred(DEFAULT_SETTLE_DELAY)
        );
        assert!(seq.accepts_telemetry());

        let before = epoch_seconds_now();
        match seq.take_deferred() {
            Transition::Issue(HandshakeRequest::Write { endpoint, payload }) => {
                assert_eq!(endpoint, TIME_SYNC_CHARACTERISTIC_UUID);
                let sent: i64 = String::from_utf8(payload).unwrap().parse().unwrap();
                assert!(sent >= before);
            }
            other => panic!("expected clock write, got {:?}", other),
        }

        assert_eq!(
            seq.on_write_ack(TIME_SYNC_CHARACTERISTIC_UUID, Ok(())),
            Transition::Ready
        );
        assert_eq!(seq.step(), HandshakeStep::Ready);
        assert!(seq.is_finished());
    }

    #[test]
    fn test_transport_unit_failure_is_not_fatal() {
        let mut seq = HandshakeSequencer::new(params());
        seq.start();
        let t = seq.on_transport_unit(Err(Error::Internal("unsupported".into())));
        assert_eq!(t, Transition::Deferred(DEFAULT_SETTLE_DELAY));
        assert_eq!(seq.step(), HandshakeStep::DiscoverCapabilities);
        assert_eq!(seq.negotiated_transport_unit(), None);
    }

    #[test]
    fn test_discovery_failure_is_fatal() {
        let mut seq = HandshakeSequencer::new(params());
        seq.start();
        seq.on_transport_unit(Ok(None));
        seq.take_deferred();
        assert_eq!(
            seq.on_capabilities(Err(Error::Internal("gatt 133".into()))),
            Transition::Failed(HandshakeFailure::StepFailed(
                HandshakeStep::DiscoverCapabilities
            ))
        );
        assert_eq!(seq.step(), HandshakeStep::Failed);
    }

    #[test]
    fn test_capabilities_ignored_while_settling() {
        let mut seq = HandshakeSequencer::new(params());
        seq.start();
        seq.on_transport_unit(Ok(None));
        assert_eq!(seq.on_capabilities(Ok(all_endpoints())), Transition::Ignored);
    }

    #[test]
    fn test_missing_auth_endpoint() {
        let (seq, t) = through_discovery(capabilities(&[TELEMETRY_CHARACTERISTIC_UUID]));
        assert_eq!(
            t,
            Transition::Failed(HandshakeFailure::CapabilityMissing(
                AUTH_KEY_CHARACTERISTIC_UUID
            ))
        );
        assert_eq!(seq.step(), HandshakeStep::Failed);
    }

    #[test]
    fn test_endpoints_outside_bottle_service_do_not_count() {
        let foreign = vec![Capability {
            service: Uuid::from_u128(0x1800),
            endpoint: AUTH_KEY_CHARACTERISTIC_UUID,
        }];
        let (_, t) = through_discovery(foreign);
        assert_eq!(
            t,
            Transition::Failed(HandshakeFailure::CapabilityMissing(
                AUTH_KEY_CHARACTERISTIC_UUID
            ))
        );
    }

    #[test]
    fn test_auth_failure_halts_sequence() {
        let (mut seq, _) = through_discovery(all_endpoints());
        assert_eq!(
            seq.on_write_ack(
                AUTH_KEY_CHARACTERISTIC_UUID,
                Err(Error::Internal("rejected".into()))
            ),
            Transition::Failed(HandshakeFailure::StepFailed(HandshakeStep::WriteAuthToken))
        );
        // Nothing moves after a failure.
        assert_eq!(
            seq.on_notifications_enabled(TELEMETRY_CHARACTERISTIC_UUID, Ok(())),
            Transition::Ignored
        );
        assert_eq!(seq.take_deferred(), Transition::Ignored);
    }

    #[test]
    fn test_ack_for_other_endpoint_is_ignored() {
        let (mut seq, _) = through_discovery(all_endpoints());
        assert_eq!(
            seq.on_write_ack(TIME_SYNC_CHARACTERISTIC_UUID, Ok(())),
            Transition::Ignored
        );
        assert_eq!(seq.step(), HandshakeStep::WriteAuthToken);
    }

    #[test]
    fn test_missing_telemetry_endpoint() {
        let (mut seq, _) = through_discovery(capabilities(&[AUTH_KEY_CHARACTERISTIC_UUID]));
        assert_eq!(
            seq.on_write_ack(AUTH_KEY_CHARACTERISTIC_UUID, Ok(())),
            Transition::Failed(HandshakeFailure::CapabilityMissing(
                TELEMETRY_CHARACTERISTIC_UUID
            ))
        );
    }

    #[test]
    fn test_notification_failure() {
        let (mut seq, _) = through_discovery(all_endpoints());
        seq.on_write_ack(AUTH_KEY_CHARACTERISTIC_UUID, Ok(()));
        assert_eq!(
            seq.on_notifications_enabled(
                TELEMETRY_CHARACTERISTIC_UUID,
                Err(Error::Internal("cccd".into()))
            ),
            Transition::Failed(HandshakeFailure::StepFailed(
                HandshakeStep::EnableNotifications
            ))
        );
    }

    #[test]
    fn test_clock_sync_is_best_effort() {
        let (mut seq, _) = through_discovery(all_endpoints());
        seq.on_write_ack(AUTH_KEY_CHARACTERISTIC_UUID, Ok(()));
        seq.on_notifications_enabled(TELEMETRY_CHARACTERISTIC_UUID, Ok(()));
        assert!(matches!(seq.take_deferred(), Transition::Issue(_)));
        assert_eq!(
            seq.on_write_ack(
                TIME_SYNC_CHARACTERISTIC_UUID,
                Err(Error::Internal("busy".into()))
            ),
            Transition::Ready
        );
    }

    #[test]
    fn test_missing_clock_endpoint_goes_ready() {
        let (mut seq, _) = through_discovery(capabilities(&[
            AUTH_KEY_CHARACTERISTIC_UUID,
            TELEMETRY_CHARACTERISTIC_UUID,
        ]));
        seq.on_write_ack(AUTH_KEY_CHARACTERISTIC_UUID, Ok(()));
        seq.on_notifications_enabled(TELEMETRY_CHARACTERISTIC_UUID, Ok(()));
        assert_eq!(seq.take_deferred(), Transition::Ready);
        assert_eq!(seq.step(), HandshakeStep::Ready);
    }

    #[test]
    fn test_start_twice_is_ignored() {
        let mut seq = HandshakeSequencer::new(params());
        seq.start();
        assert_eq!(seq.start(), Transition::Ignored);
    }

    #[test]
    fn test_step_display() {
        assert_eq!(HandshakeStep::WriteAuthToken.to_string(), "auth token write");
        assert_eq!(
            HandshakeStep::DiscoverCapabilities.to_string(),
            "capability discovery"
        );
    }
}
