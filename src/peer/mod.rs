//! Peer tracking
//!
//! The coordinator learns about peers from the messages they send and
//! keeps one outbound delivery queue per peer.

pub mod registry;

pub use registry::*;
