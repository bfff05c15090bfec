//! Ground station
//!
//! Receives fleet events, tracks where each peer last reported from, and
//! redirects the nearest other peer when a reading is critical.

mod handler;

pub use handler::*;
