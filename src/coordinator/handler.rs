//! Coordinator event handling
//!
//! Every inbound payload goes through [`Coordinator::handle`]:
//!
//! 1. Drop it if the kind is invalid, it claims to come from the
//!    coordinator itself, or it is older than the freshness window
//! 2. Register the sender and record its location
//! 3. For a critical reading, send an `adjust-course` to the nearest
//!    other located peer
//!
//! Nothing here retries. Dropped events are logged and forgotten, and the
//! outcome never reaches the sender.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::peer::PeerRegistry;
use crate::protocol::{FleetMessage, Kind, PeerId};
use crate::transport::MessageHandler;

// ─────────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────────

/// Decision parameters for the coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Reserved sender id of the coordinator
    pub coordinator_id: PeerId,

    /// Events older than this are dropped
    pub freshness: Duration,

    /// Readings strictly below this level are critical
    pub critical_ozone_level: f64,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            coordinator_id: 0,
            freshness: Duration::from_secs(20),
            critical_ozone_level: 0.4,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Outcomes
// ─────────────────────────────────────────────────────────────────

/// Why an event was discarded
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DropReason {
    /// Kind was missing or unrecognized
    InvalidKind,
    /// Sender id equals the coordinator id
    SelfSent,
    /// Event is older than the freshness window
    Stale { age: Duration },
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DropReason::InvalidKind => write!(f, "invalid kind"),
            DropReason::SelfSent => write!(f, "sent by coordinator id"),
            DropReason::Stale { age } => write!(f, "stale ({:.1}s old)", age.as_secs_f64()),
        }
    }
}

/// Result of handling one event
#[derive(Debug, Clone, PartialEq)]
pub enum HandleOutcome {
    /// Event discarded before touching the registry
    Dropped(DropReason),

    /// Sender registered and located, nothing sent
    Recorded,

    /// An adjust-course command was queued for `target`
    Dispatched {
        target: PeerId,
        distance_km: f64,
        sequence_id: u64,
    },
}

/// Running totals since startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
    pub received: u64,
    pub dropped: u64,
    pub dispatched: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    dropped: AtomicU64,
    dispatched: AtomicU64,
}

// ─────────────────────────────────────────────────────────────────
// Coordinator
// ─────────────────────────────────────────────────────────────────

/// Ground station logic: peer tracking and corrective dispatch
pub struct Coordinator {
    settings: CoordinatorSettings,
    registry: Arc<PeerRegistry>,
    counters: Counters,
}

impl Coordinator {
    pub fn new(settings: CoordinatorSettings, registry: Arc<PeerRegistry>) -> Self {
        Self {
            settings,
            registry,
            counters: Counters::default(),
        }
    }

    /// Registry shared with this coordinator
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            received: self.counters.received.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
        }
    }

    /// Validate, record and, for critical readings, dispatch
    pub async fn handle(&self, message: FleetMessage) -> HandleOutcome {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        if let Some(reason) = self.validate(&message) {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                sender = message.sender_id,
                kind = %message.kind,
                reason = %reason,
                "Dropping event"
            );
            return HandleOutcome::Dropped(reason);
        }

        let sender = message.sender_id;
        self.registry.get_or_create(sender);
        if let Err(e) = self.registry.update_location(sender, message.location) {
            // The record was created just above and is never removed.
            warn!(sender, error = %e, "Failed to record location");
        }

        if message.kind != Kind::Reading || !self.is_critical(message.ozone_level) {
            debug!(
                sender,
                kind = %message.kind,
                ozone_level = message.ozone_level,
                "Event recorded"
            );
            return HandleOutcome::Recorded;
        }

        let Some((target, distance_km)) = self.registry.nearest_other(sender, &message.location)
        else {
            info!(
                sender,
                ozone_level = message.ozone_level,
                "Critical reading but no other located peer to redirect"
            );
            return HandleOutcome::Recorded;
        };

        let Some(queue) = self.registry.queue(target) else {
            return HandleOutcome::Recorded;
        };

        let command = FleetMessage::adjust_course(self.settings.coordinator_id, message.location);
        match queue.enqueue(command).await {
            Ok(sequence_id) => {
                self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
                info!(
                    sender,
                    target,
                    distance_km = %format!("{:.1}", distance_km),
                    sequence_id,
                    ozone_level = message.ozone_level,
                    "Dispatched adjust-course"
                );
                HandleOutcome::Dispatched {
                    target,
                    distance_km,
                    sequence_id,
                }
            }
            Err(e) => {
                warn!(target, error = %e, "Could not queue adjust-course");
                HandleOutcome::Recorded
            }
        }
    }

    fn validate(&self, message: &FleetMessage) -> Option<DropReason> {
        if message.kind == Kind::Invalid {
            return Some(DropReason::InvalidKind);
        }
        if message.sender_id == self.settings.coordinator_id {
            return Some(DropReason::SelfSent);
        }

        // Future timestamps give a negative age and pass.
        let age = (Utc::now() - message.timestamp).to_std().ok()?;
        if age > self.settings.freshness {
            return Some(DropReason::Stale { age });
        }

        None
    }

    fn is_critical(&self, ozone_level: f64) -> bool {
        ozone_level < self.settings.critical_ozone_level
    }
}

#[async_trait]
impl MessageHandler for Coordinator {
    async fn handle(&self, message: FleetMessage) {
        Coordinator::handle(self, message).await;
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{DeliveryConfig, RecordingTransport};
    use crate::peer::QueueFactory;
    use crate::protocol::Location;

    fn make_coordinator() -> (Coordinator, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::new());
        let factory = QueueFactory::new(
            transport.clone(),
            DeliveryConfig::default(),
            "http://localhost",
            9000,
        );
        let registry = Arc::new(PeerRegistry::new(factory));
        (Coordinator::new(CoordinatorSettings::default(), registry), transport)
    }

    async fn settle(coordinator: &Coordinator, peer: PeerId, count: u64) {
        let queue = coordinator.registry().queue(peer).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.stats().delivered < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_critical_reading_dispatches_to_nearest_other() {
        let (coordinator, transport) = make_coordinator();
        let a = Location::new(0.0, 0.0, 500.0);
        let b = Location::new(0.0, 1.0, 500.0);
        let c = Location::new(10.0, 10.0, 500.0);

        assert_eq!(coordinator.handle(FleetMessage::reading(1, a, 0.9)).await, HandleOutcome::Recorded);
        assert_eq!(coordinator.handle(FleetMessage::reading(2, b, 0.9)).await, HandleOutcome::Recorded);
        assert_eq!(coordinator.handle(FleetMessage::reading(3, c, 0.9)).await, HandleOutcome::Recorded);

        let outcome = coordinator.handle(FleetMessage::reading(1, a, 0.1)).await;
        match outcome {
            HandleOutcome::Dispatched {
                target,
                sequence_id,
                distance_km,
            } => {
                assert_eq!(target, 2);
                assert_eq!(sequence_id, 1);
                assert!(distance_km > 0.0);
            }
            other => panic!("expected dispatch, got {:?}", other),
        }

        settle(&coordinator, 2, 1).await;

        let to_b = transport.delivered_to("http://localhost:9002");
        assert_eq!(to_b.len(), 1);
        assert_eq!(to_b[0].data.kind, Kind::AdjustCourse);
        assert_eq!(to_b[0].data.sender_id, 0);
        assert_eq!(to_b[0].data.location, a);

        assert!(transport.delivered_to("http://localhost:9001").is_empty());
        assert!(transport.delivered_to("http://localhost:9003").is_empty());
        assert_eq!(coordinator.stats().dispatched, 1);
    }

    #[tokio::test]
    async fn test_stale_event_changes_nothing() {
        let (coordinator, transport) = make_coordinator();
        let mut msg = FleetMessage::reading(1, Location::new(1.0, 1.0, 0.0), 0.1);
        msg.timestamp = Utc::now() - chrono::Duration::seconds(25);

        let outcome = coordinator.handle(msg).await;

        assert!(matches!(outcome, HandleOutcome::Dropped(DropReason::Stale { age }) if age >= Duration::from_secs(25)));
        assert!(coordinator.registry().is_empty());
        assert!(transport.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_future_timestamp_is_accepted() {
        let (coordinator, _transport) = make_coordinator();
        let mut msg = FleetMessage::reading(1, Location::new(1.0, 1.0, 0.0), 0.9);
        msg.timestamp = Utc::now() + chrono::Duration::seconds(60);

        assert_eq!(coordinator.handle(msg).await, HandleOutcome::Recorded);
        assert_eq!(coordinator.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_self_sent_event_is_dropped() {
        let (coordinator, _transport) = make_coordinator();
        coordinator.handle(FleetMessage::reading(1, Location::default(), 0.9)).await;

        let outcome = coordinator
            .handle(FleetMessage::reading(0, Location::new(0.0, 0.5, 0.0), 0.0))
            .await;

        assert_eq!(outcome, HandleOutcome::Dropped(DropReason::SelfSent));
        assert_eq!(coordinator.registry().peer_ids(), vec![1]);
    }

    #[tokio::test]
    async fn test_invalid_kind_is_dropped() {
        let (coordinator, _transport) = make_coordinator();
        let mut msg = FleetMessage::reading(4, Location::default(), 0.1);
        msg.kind = Kind::Invalid;

        assert_eq!(
            coordinator.handle(msg).await,
            HandleOutcome::Dropped(DropReason::InvalidKind)
        );
        assert!(coordinator.registry().is_empty());
        assert_eq!(coordinator.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_critical_reading_with_no_other_peer_is_recorded() {
        let (coordinator, transport) = make_coordinator();

        let outcome = coordinator
            .handle(FleetMessage::reading(1, Location::new(3.0, 3.0, 0.0), 0.05))
            .await;

        assert_eq!(outcome, HandleOutcome::Recorded);
        assert_eq!(coordinator.registry().get(1).unwrap().location, Some(Location::new(3.0, 3.0, 0.0)));
        assert!(transport.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_threshold_is_exclusive() {
        let (coordinator, transport) = make_coordinator();
        coordinator.handle(FleetMessage::reading(1, Location::new(0.0, 0.0, 0.0), 0.9)).await;

        let outcome = coordinator
            .handle(FleetMessage::reading(2, Location::new(0.0, 1.0, 0.0), 0.4))
            .await;

        assert_eq!(outcome, HandleOutcome::Recorded);
        assert!(transport.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_adjust_course_from_peer_updates_location_only() {
        let (coordinator, transport) = make_coordinator();
        coordinator.handle(FleetMessage::reading(1, Location::new(0.0, 0.0, 0.0), 0.9)).await;

        let outcome = coordinator
            .handle(FleetMessage::adjust_course(2, Location::new(0.0, 0.1, 0.0)))
            .await;

        assert_eq!(outcome, HandleOutcome::Recorded);
        assert_eq!(coordinator.registry().len(), 2);
        assert!(transport.attempts().is_empty());
    }
}
