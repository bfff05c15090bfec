//! Protocol module for satellite / ground-station communication
//!
//! Defines the message types, the wire envelope and the distance helper.
//! The protocol uses JSON over HTTP.

pub mod geo;
mod messages;

pub use messages::*;
