//! Protocol message definitions
//!
//! Satellites and the ground station exchange a single payload type,
//! [`FleetMessage`], discriminated by [`Kind`]. On the wire every payload
//! travels inside an [`Envelope`] carrying the delivery-sequence id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::geo;

/// Identifier of a peer (satellite) or of the coordinator itself
pub type PeerId = u32;

// ─────────────────────────────────────────────────────────────────
// Message Kind
// ─────────────────────────────────────────────────────────────────

/// The kind of control message exchanged between satellites and the ground station
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Kind {
    /// Ozone reading for the sender's current location
    Reading,
    /// New target location for the receiving satellite
    AdjustCourse,
    /// Unset or unrecognized kind; never acted upon
    #[serde(other)]
    Invalid,
}

impl Kind {
    /// Get the wire name of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Invalid => "invalid",
            Kind::Reading => "reading",
            Kind::AdjustCourse => "adjust-course",
        }
    }
}

impl Default for Kind {
    fn default() -> Self {
        Kind::Invalid
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────
// Location
// ─────────────────────────────────────────────────────────────────

/// A point above the earth's surface
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    /// Latitude in degrees
    pub lat: f64,

    /// Longitude in degrees
    pub lng: f64,

    /// Altitude (ignored by distance)
    pub alt: f64,
}

impl Location {
    /// Create a location
    pub const fn new(lat: f64, lng: f64, alt: f64) -> Self {
        Self { lat, lng, alt }
    }

    /// Great-circle distance to `other` in km, altitude ignored
    pub fn distance(&self, other: &Location) -> f64 {
        geo::great_circle_km(self, other)
    }
}

// ─────────────────────────────────────────────────────────────────
// Payload
// ─────────────────────────────────────────────────────────────────

/// Application payload exchanged between satellites and the ground station
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetMessage {
    /// What this message means
    #[serde(default)]
    pub kind: Kind,

    /// Who sent it
    #[serde(rename = "senderID")]
    pub sender_id: PeerId,

    /// Sender location for readings, target location for course adjustments
    pub location: Location,

    /// Measured ozone level (readings only)
    #[serde(rename = "ozoneLevel", default)]
    pub ozone_level: f64,

    /// When the payload was produced
    pub timestamp: DateTime<Utc>,
}

impl FleetMessage {
    /// Create an ozone reading taken now
    pub fn reading(sender_id: PeerId, location: Location, ozone_level: f64) -> Self {
        Self {
            kind: Kind::Reading,
            sender_id,
            location,
            ozone_level,
            timestamp: Utc::now(),
        }
    }

    /// Create a course adjustment towards `target`, issued now
    pub fn adjust_course(sender_id: PeerId, target: Location) -> Self {
        Self {
            kind: Kind::AdjustCourse,
            sender_id,
            location: target,
            ozone_level: 0.0,
            timestamp: Utc::now(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────

/// Wire envelope wrapping one payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Delivery-sequence id, scoped to the sending queue
    pub id: u64,

    /// Enqueue time, refreshed on every send attempt
    pub timestamp: DateTime<Utc>,

    /// The payload
    pub data: FleetMessage,
}

impl Envelope {
    /// Wrap a payload with a sequence id, stamped now
    pub fn new(id: u64, data: FleetMessage) -> Self {
        Self {
            id,
            timestamp: Utc::now(),
            data,
        }
    }

    /// Serialize to JSON bytes
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from JSON bytes
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
