//! HTTP transport boundary
//!
//! Outbound: [`Transport`] delivers one envelope to one endpoint and
//! reports acknowledged or failed. Inbound: [`Listener`] decodes envelopes
//! posted to it and hands each payload to a [`MessageHandler`].

mod http;
mod listener;

pub use http::*;
pub use listener::*;

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::{Envelope, FleetMessage};

/// Request/response call used by the delivery loop
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `envelope` to `endpoint`.
    ///
    /// `Ok(())` means the endpoint acknowledged the envelope. Any error
    /// (encoding, connection, non-success status) is a failed attempt.
    async fn deliver(&self, endpoint: &str, envelope: &Envelope) -> Result<()>;
}

/// Callback invoked once per decoded inbound envelope
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle one payload. Validation failures are the handler's own
    /// concern and never change the acknowledgment sent to the caller.
    async fn handle(&self, message: FleetMessage);
}
