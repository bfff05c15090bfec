//! In-memory transport for unit tests
//!
//! Records every delivery attempt, can fail chosen envelopes a set number
//! of times, and can hold deliveries behind a gate to simulate a stalled
//! endpoint.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::error::{Error, Result};
use crate::protocol::Envelope;
use crate::transport::Transport;

/// One call into the transport
#[derive(Debug, Clone)]
pub struct Attempt {
    /// Destination of the call
    pub endpoint: String,

    /// Envelope as sent
    pub envelope: Envelope,

    /// Whether the call was acknowledged
    pub succeeded: bool,
}

/// Scripted transport that records what it was asked to send
#[derive(Default)]
pub struct RecordingTransport {
    attempts: Mutex<Vec<Attempt>>,
    scripted_failures: Mutex<HashMap<(String, u64), u32>>,
    fail_all: AtomicBool,
    latency: Duration,
    gate: Option<Semaphore>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    failure: Option<fn(&str) -> Error>,
}

impl RecordingTransport {
    /// Transport that acknowledges everything immediately
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call takes `latency` before answering
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Failed calls return `failure(endpoint)` instead of a 503 rejection
    pub fn with_failure(mut self, failure: fn(&str) -> Error) -> Self {
        self.failure = Some(failure);
        self
    }

    /// Calls block until [`open_gate`](Self::open_gate) releases them
    pub fn gated(mut self) -> Self {
        self.gate = Some(Semaphore::new(0));
        self
    }

    /// Let `calls` more gated calls through
    pub fn open_gate(&self, calls: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(calls);
        }
    }

    /// Fail the envelope `id` sent to `endpoint` for its next `times` attempts
    pub fn fail_times(&self, endpoint: &str, id: u64, times: u32) {
        self.scripted_failures
            .lock()
            .insert((endpoint.to_string(), id), times);
    }

    /// Fail every call until switched off again
    pub fn set_failing(&self, failing: bool) {
        self.fail_all.store(failing, Ordering::SeqCst);
    }

    /// All attempts so far, in call order
    pub fn attempts(&self) -> Vec<Attempt> {
        self.attempts.lock().clone()
    }

    /// Acknowledged envelopes, in call order
    pub fn delivered(&self) -> Vec<Envelope> {
        self.attempts
            .lock()
            .iter()
            .filter(|a| a.succeeded)
            .map(|a| a.envelope.clone())
            .collect()
    }

    /// Acknowledged envelopes for one endpoint, in call order
    pub fn delivered_to(&self, endpoint: &str) -> Vec<Envelope> {
        self.attempts
            .lock()
            .iter()
            .filter(|a| a.succeeded && a.endpoint == endpoint)
            .map(|a| a.envelope.clone())
            .collect()
    }

    /// Highest number of calls ever outstanding at once
    pub fn max_concurrency(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn should_fail(&self, endpoint: &str, id: u64) -> bool {
        if self.fail_all.load(Ordering::SeqCst) {
            return true;
        }

        let mut scripted = self.scripted_failures.lock();
        match scripted.get_mut(&(endpoint.to_string(), id)) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn deliver(&self, endpoint: &str, envelope: &Envelope) -> Result<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let succeeded = !self.should_fail(endpoint, envelope.id);
        self.attempts.lock().push(Attempt {
            endpoint: endpoint.to_string(),
            envelope: envelope.clone(),
            succeeded,
        });
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match (succeeded, self.failure) {
            (true, _) => Ok(()),
            (false, Some(failure)) => Err(failure(endpoint)),
            (false, None) => Err(Error::delivery_rejected(endpoint, 503)),
        }
    }
}
