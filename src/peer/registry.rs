//! Peer registry, tracks known peers, their last location and their queue
//!
//! Records are created lazily the first time a peer is heard from and are
//! never removed while the process runs. Each record owns exactly one
//! [`DeliveryQueue`] for the lifetime of the registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::delivery::{DeliveryConfig, DeliveryQueue};
use crate::error::{Error, Result};
use crate::protocol::{Location, PeerId};
use crate::transport::Transport;

// ─────────────────────────────────────────────────────────────────
// Queue Factory
// ─────────────────────────────────────────────────────────────────

/// Builds the delivery queue for a newly seen peer
pub struct QueueFactory {
    transport: Arc<dyn Transport>,
    delivery: DeliveryConfig,
    peer_base_url: String,
    peer_base_port: u16,
}

impl QueueFactory {
    pub fn new(
        transport: Arc<dyn Transport>,
        delivery: DeliveryConfig,
        peer_base_url: impl Into<String>,
        peer_base_port: u16,
    ) -> Self {
        Self {
            transport,
            delivery,
            peer_base_url: peer_base_url.into().trim_end_matches('/').to_string(),
            peer_base_port,
        }
    }

    /// Inbound address of a peer: `{base_url}:{base_port + id}`
    pub fn endpoint_for(&self, id: PeerId) -> String {
        let port = u32::from(self.peer_base_port).saturating_add(id);
        format!("{}:{}", self.peer_base_url, port)
    }

    fn build(&self, id: PeerId) -> DeliveryQueue {
        DeliveryQueue::spawn(
            self.endpoint_for(id),
            self.transport.clone(),
            self.delivery.clone(),
        )
    }
}

// ─────────────────────────────────────────────────────────────────
// Peer Record
// ─────────────────────────────────────────────────────────────────

/// Registry entry for one peer
pub struct PeerRecord {
    /// Peer identifier
    pub id: PeerId,

    /// Last reported location; `None` until the first update
    pub location: Option<Location>,

    /// Outbound queue to this peer
    pub queue: Arc<DeliveryQueue>,
}

/// Copy of a record's data, safe to hold without the registry lock
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSnapshot {
    pub id: PeerId,
    pub location: Option<Location>,
    pub endpoint: String,
}

// ─────────────────────────────────────────────────────────────────
// Peer Registry
// ─────────────────────────────────────────────────────────────────

/// Thread-safe registry of known peers
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerId, PeerRecord>>,
    factory: QueueFactory,
}

impl PeerRegistry {
    /// Create a new empty registry
    pub fn new(factory: QueueFactory) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            factory,
        }
    }

    /// Queue for `id`, creating the record on first sight.
    ///
    /// Concurrent first calls for the same id observe the same queue.
    pub fn get_or_create(&self, id: PeerId) -> Arc<DeliveryQueue> {
        if let Some(record) = self.peers.read().get(&id) {
            return record.queue.clone();
        }

        let mut peers = self.peers.write();
        let record = peers.entry(id).or_insert_with(|| {
            let queue = Arc::new(self.factory.build(id));
            info!(peer = id, endpoint = %queue.endpoint(), "Registered new peer");
            PeerRecord {
                id,
                location: None,
                queue,
            }
        });
        record.queue.clone()
    }

    /// Record the last known location of an existing peer
    pub fn update_location(&self, id: PeerId, location: Location) -> Result<()> {
        let mut peers = self.peers.write();
        let record = peers.get_mut(&id).ok_or(Error::UnknownPeer(id))?;
        record.location = Some(location);

        debug!(peer = id, lat = location.lat, lng = location.lng, "Location updated");
        Ok(())
    }

    /// Closest located peer other than `exclude`, with its distance in km.
    ///
    /// Ties go to the lowest id.
    pub fn nearest_other(&self, exclude: PeerId, location: &Location) -> Option<(PeerId, f64)> {
        self.peers
            .read()
            .values()
            .filter(|r| r.id != exclude)
            .filter_map(|r| r.location.map(|loc| (r.id, location.distance(&loc))))
            .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
    }

    /// Get a copy of a peer's data
    pub fn get(&self, id: PeerId) -> Option<PeerSnapshot> {
        self.peers.read().get(&id).map(|r| PeerSnapshot {
            id: r.id,
            location: r.location,
            endpoint: r.queue.endpoint().to_string(),
        })
    }

    /// Queue for `id` if the peer is known
    pub fn queue(&self, id: PeerId) -> Option<Arc<DeliveryQueue>> {
        self.peers.read().get(&id).map(|r| r.queue.clone())
    }

    /// Known peer ids, ascending
    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Get count of known peers
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Stop every queue and return how many messages were left undelivered
    pub async fn shutdown_all(&self) -> usize {
        let queues: Vec<(PeerId, Arc<DeliveryQueue>)> = self
            .peers
            .read()
            .values()
            .map(|r| (r.id, r.queue.clone()))
            .collect();

        let mut total = 0;
        for (id, queue) in queues {
            let undelivered = queue.shutdown().await;
            if !undelivered.is_empty() {
                warn!(
                    peer = id,
                    endpoint = %queue.endpoint(),
                    undelivered = undelivered.len(),
                    "Discarding undelivered messages"
                );
            }
            total += undelivered.len();
        }

        info!(peers = self.len(), undelivered = total, "All delivery queues stopped");
        total
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
