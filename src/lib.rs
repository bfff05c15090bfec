//! ozonewatch - ozone monitoring over an unreliable satellite link
//!
//! A ground station ([`coordinator`]) receives ozone readings from a fleet
//! of satellites over HTTP. When a reading is critically low it sends an
//! `adjust-course` command to the nearest other satellite. Every outbound
//! message goes through a per-destination [`delivery::DeliveryQueue`] that
//! keeps order, retries with linear backoff and applies backpressure.

pub mod cli;
pub mod config;
pub mod coordinator;
pub mod delivery;
pub mod error;
pub mod fleet;
pub mod logging;
pub mod peer;
pub mod protocol;
pub mod transport;
pub mod version;

pub use error::{Error, Result};
