//! Outbound delivery
//!
//! Reliable, ordered, backpressured delivery of envelopes to one endpoint
//! per [`DeliveryQueue`], with a linear retry policy.

mod backoff;
#[cfg(test)]
mod mock;
mod queue;

pub use self::backoff::*;
#[cfg(test)]
pub use mock::*;
pub use queue::*;
