//! Reliable per-destination delivery queue
//!
//! One [`DeliveryQueue`] per endpoint. Callers append payloads to a bounded
//! FIFO; a single background loop takes them one at a time and hands them
//! to the [`Transport`], retrying the same envelope with linear backoff
//! until it is acknowledged. That gives:
//!
//! - per-endpoint order: envelopes are attempted in enqueue order
//! - at most one call outstanding per endpoint
//! - backpressure: `enqueue` waits while the FIFO is full
//!
//! A message that keeps failing blocks everything queued behind it, unless
//! the transport reports an error that [`Error::is_retryable`] rejects.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{Envelope, FleetMessage};
use crate::transport::Transport;

use super::LinearBackoff;

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Configuration for one delivery queue
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Maximum number of envelopes waiting behind the in-flight one
    pub capacity: usize,

    /// Backoff step; the n-th consecutive failure waits `n * backoff_unit`
    pub backoff_unit: Duration,

    /// Give up on an envelope after this many retries (0 = never)
    pub max_retries: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            capacity: 20,
            backoff_unit: Duration::from_secs(1),
            max_retries: 0,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Statistics
// ─────────────────────────────────────────────────────────────────

/// Point-in-time view of a queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Envelopes acknowledged by the endpoint
    pub delivered: u64,

    /// Transport calls that failed
    pub failed_attempts: u64,

    /// Envelopes dropped after exhausting `max_retries`
    pub abandoned: u64,

    /// Consecutive failures of the current in-flight envelope
    pub retries: u32,

    /// Envelopes waiting in the FIFO
    pub pending: usize,
}

/// Counters written by the delivery loop only
#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    failed_attempts: AtomicU64,
    abandoned: AtomicU64,
    retries: AtomicU32,
}

// ─────────────────────────────────────────────────────────────────
// Delivery Queue
// ─────────────────────────────────────────────────────────────────

/// Ordered, retrying, backpressured sender for one endpoint
pub struct DeliveryQueue {
    endpoint: String,
    tx: mpsc::Sender<Envelope>,
    last_id: AsyncMutex<u64>,
    counters: Arc<Counters>,
    shutdown_tx: watch::Sender<bool>,
    task: parking_lot::Mutex<Option<JoinHandle<Vec<Envelope>>>>,
}

impl DeliveryQueue {
    /// Create the queue and start its delivery loop.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        endpoint: impl Into<String>,
        transport: Arc<dyn Transport>,
        config: DeliveryConfig,
    ) -> Self {
        let endpoint = endpoint.into();
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(Counters::default());

        let task = tokio::spawn(run_delivery_loop(
            endpoint.clone(),
            transport,
            rx,
            LinearBackoff::new(config.backoff_unit, config.max_retries),
            counters.clone(),
            shutdown_rx,
        ));

        debug!(endpoint = %endpoint, capacity = config.capacity, "Delivery queue started");

        Self {
            endpoint,
            tx,
            last_id: AsyncMutex::new(0),
            counters,
            shutdown_tx,
            task: parking_lot::Mutex::new(Some(task)),
        }
    }

    /// Endpoint this queue delivers to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Append a payload and return its sequence id.
    ///
    /// Waits while the FIFO is full. Sequence ids are assigned under the
    /// same lock as the FIFO push, so id order is attempt order.
    pub async fn enqueue(&self, payload: FleetMessage) -> Result<u64> {
        let mut last_id = self.last_id.lock().await;
        let id = *last_id + 1;

        self.tx
            .send(Envelope::new(id, payload))
            .await
            .map_err(|_| Error::QueueClosed {
                endpoint: self.endpoint.clone(),
            })?;
        *last_id = id;

        debug!(endpoint = %self.endpoint, id, "Message enqueued");
        Ok(id)
    }

    /// Current counters and FIFO depth
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            delivered: self.counters.delivered.load(Ordering::SeqCst),
            failed_attempts: self.counters.failed_attempts.load(Ordering::SeqCst),
            abandoned: self.counters.abandoned.load(Ordering::SeqCst),
            retries: self.counters.retries.load(Ordering::SeqCst),
            pending: self.tx.max_capacity() - self.tx.capacity(),
        }
    }

    /// Stop the delivery loop and return what it did not deliver.
    ///
    /// The in-flight envelope (if any) comes first, followed by the FIFO
    /// contents in order. A pending backoff sleep or transport call is
    /// abandoned. Later calls return an empty list.
    pub async fn shutdown(&self) -> Vec<Envelope> {
        let _ = self.shutdown_tx.send(true);

        let task = self.task.lock().take();
        match task {
            Some(task) => task.await.unwrap_or_else(|e| {
                error!(endpoint = %self.endpoint, error = %e, "Delivery loop panicked");
                Vec::new()
            }),
            None => Vec::new(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Delivery Loop
// ─────────────────────────────────────────────────────────────────

async fn run_delivery_loop(
    endpoint: String,
    transport: Arc<dyn Transport>,
    mut rx: mpsc::Receiver<Envelope>,
    mut backoff: LinearBackoff,
    counters: Arc<Counters>,
    mut shutdown: watch::Receiver<bool>,
) -> Vec<Envelope> {
    let mut in_flight: Option<Envelope> = None;
    let mut not_before: Option<Instant> = None;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let mut envelope = match in_flight.take() {
            Some(envelope) => envelope,
            None => tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                next = rx.recv() => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
            },
        };

        if let Some(deadline) = not_before {
            let waited = tokio::select! {
                biased;
                _ = shutdown.changed() => false,
                _ = tokio::time::sleep_until(deadline) => true,
            };
            if !waited {
                in_flight = Some(envelope);
                break;
            }
        }

        envelope.timestamp = Utc::now();
        let outcome = tokio::select! {
            biased;
            _ = shutdown.changed() => None,
            outcome = transport.deliver(&endpoint, &envelope) => Some(outcome),
        };
        let Some(outcome) = outcome else {
            in_flight = Some(envelope);
            break;
        };

        match outcome {
            Ok(()) => {
                backoff.reset();
                not_before = None;
                counters.retries.store(0, Ordering::SeqCst);
                counters.delivered.fetch_add(1, Ordering::SeqCst);
                info!(endpoint = %endpoint, id = envelope.id, "Message delivered");
            }
            Err(e) if !e.is_retryable() => {
                counters.failed_attempts.fetch_add(1, Ordering::SeqCst);
                counters.abandoned.fetch_add(1, Ordering::SeqCst);
                error!(
                    endpoint = %endpoint,
                    id = envelope.id,
                    error = %e.format_for_log(),
                    "Permanent delivery failure, abandoning message"
                );
                counters.retries.store(0, Ordering::SeqCst);
                backoff.reset();
                not_before = None;
            }
            Err(e) => {
                counters.failed_attempts.fetch_add(1, Ordering::SeqCst);

                match backoff.next_backoff() {
                    Some(delay) => {
                        counters.retries.store(backoff.retries(), Ordering::SeqCst);
                        not_before = Some(Instant::now() + delay);
                        warn!(
                            endpoint = %endpoint,
                            id = envelope.id,
                            retries = backoff.retries(),
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Delivery failed, will retry"
                        );
                        in_flight = Some(envelope);
                    }
                    None => {
                        error!(
                            endpoint = %endpoint,
                            id = envelope.id,
                            retries = backoff.retries() - 1,
                            error = %e,
                            "Retries exhausted, abandoning message"
                        );
                        counters.abandoned.fetch_add(1, Ordering::SeqCst);
                        counters.retries.store(0, Ordering::SeqCst);
                        backoff.reset();
                        not_before = None;
                    }
                }
            }
        }
    }

    rx.close();
    let mut undelivered: Vec<Envelope> = in_flight.into_iter().collect();
    while let Ok(envelope) = rx.try_recv() {
        undelivered.push(envelope);
    }

    info!(
        endpoint = %endpoint,
        undelivered = undelivered.len(),
        "Delivery loop stopped"
    );
    undelivered
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::RecordingTransport;
    use crate::protocol::{Kind, Location};

    const ENDPOINT: &str = "http://localhost:9001";

    fn reading(level: f64) -> FleetMessage {
        FleetMessage::reading(1, Location::new(0.0, 0.0, 0.0), level)
    }

    fn config(capacity: usize) -> DeliveryConfig {
        DeliveryConfig {
            capacity,
            backoff_unit: Duration::from_secs(1),
            max_retries: 0,
        }
    }

    async fn wait_for_delivered(queue: &DeliveryQueue, count: u64) {
        while queue.stats().delivered < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequence_ids_start_at_one_and_increase() {
        let transport = Arc::new(RecordingTransport::new());
        let queue = DeliveryQueue::spawn(ENDPOINT, transport.clone(), config(8));

        let ids = vec![
            queue.enqueue(reading(0.1)).await.unwrap(),
            queue.enqueue(reading(0.2)).await.unwrap(),
            queue.enqueue(reading(0.3)).await.unwrap(),
        ];

        assert_eq!(ids, vec![1, 2, 3]);
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivers_in_enqueue_order_without_overlap() {
        let transport = Arc::new(RecordingTransport::new().with_latency(Duration::from_millis(50)));
        let queue = DeliveryQueue::spawn(ENDPOINT, transport.clone(), config(4));

        for i in 0..10 {
            queue.enqueue(reading(i as f64 / 10.0)).await.unwrap();
        }
        wait_for_delivered(&queue, 10).await;

        let ids: Vec<u64> = transport.delivered().iter().map(|e| e.id).collect();
        assert_eq!(ids, (1..=10).collect::<Vec<_>>());
        assert_eq!(transport.max_concurrency(), 1);
        assert!(transport.attempts().iter().all(|a| a.endpoint == ENDPOINT));

        queue.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_get_ids_in_fifo_order() {
        let transport = Arc::new(RecordingTransport::new().with_latency(Duration::from_millis(1)));
        let queue = Arc::new(DeliveryQueue::spawn(ENDPOINT, transport.clone(), config(2)));

        let mut callers = tokio::task::JoinSet::new();
        for i in 0..64u32 {
            let queue = queue.clone();
            callers.spawn(async move {
                let id = queue.enqueue(reading(f64::from(i))).await.unwrap();
                (id, f64::from(i))
            });
        }
        let mut assigned = Vec::new();
        while let Some(joined) = callers.join_next().await {
            assigned.push(joined.unwrap());
        }

        tokio::time::timeout(Duration::from_secs(10), wait_for_delivered(&queue, 64))
            .await
            .unwrap();

        let delivered = transport.delivered();
        let ids: Vec<u64> = delivered.iter().map(|e| e.id).collect();
        assert_eq!(ids, (1..=64).collect::<Vec<_>>());
        assert_eq!(transport.max_concurrency(), 1);

        // Each caller's id travels with that caller's payload.
        for (id, level) in assigned {
            assert_eq!(delivered[(id - 1) as usize].data.ozone_level, level);
        }

        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_failed_message_before_later_ones() {
        let transport = Arc::new(RecordingTransport::new());
        transport.fail_times(ENDPOINT, 1, 3);
        let queue = DeliveryQueue::spawn(ENDPOINT, transport.clone(), config(4));

        queue.enqueue(reading(0.1)).await.unwrap();
        queue.enqueue(reading(0.2)).await.unwrap();
        wait_for_delivered(&queue, 2).await;

        let attempted: Vec<(u64, bool)> = transport
            .attempts()
            .iter()
            .map(|a| (a.envelope.id, a.succeeded))
            .collect();
        assert_eq!(
            attempted,
            vec![(1, false), (1, false), (1, false), (1, true), (2, true)]
        );

        let stats = queue.stats();
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.failed_attempts, 3);
        assert_eq!(stats.retries, 0);
        assert_eq!(transport.delivered().iter().filter(|e| e.id == 1).count(), 1);

        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_waits_linearly_between_attempts() {
        let transport = Arc::new(RecordingTransport::new());
        transport.fail_times(ENDPOINT, 1, 3);
        let queue = DeliveryQueue::spawn(ENDPOINT, transport.clone(), config(4));

        let started = Instant::now();
        queue.enqueue(reading(0.1)).await.unwrap();
        wait_for_delivered(&queue, 1).await;

        // 1s + 2s + 3s of backoff before the fourth attempt succeeds
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(6), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(7), "elapsed {:?}", elapsed);

        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_timestamp_is_refreshed() {
        let transport = Arc::new(RecordingTransport::new());
        transport.fail_times(ENDPOINT, 1, 1);
        let queue = DeliveryQueue::spawn(ENDPOINT, transport.clone(), config(4));

        queue.enqueue(reading(0.1)).await.unwrap();
        wait_for_delivered(&queue, 1).await;

        let attempts = transport.attempts();
        assert_eq!(attempts.len(), 2);
        assert!(attempts[1].envelope.timestamp >= attempts[0].envelope.timestamp);
        assert_eq!(attempts[0].envelope.data, attempts[1].envelope.data);

        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_blocks_when_full_and_resumes_after_send() {
        let transport = Arc::new(RecordingTransport::new().gated());
        let queue = DeliveryQueue::spawn(ENDPOINT, transport.clone(), config(1));

        // First goes in flight (stuck at the gate), second fills the FIFO.
        queue.enqueue(reading(0.1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue(reading(0.2)).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_secs(5), queue.enqueue(reading(0.3))).await;
        assert!(blocked.is_err(), "enqueue should wait while the FIFO is full");
        assert_eq!(queue.stats().pending, 1);

        transport.open_gate(1);
        let id = tokio::time::timeout(Duration::from_secs(5), queue.enqueue(reading(0.3)))
            .await
            .expect("enqueue should resume once a slot frees")
            .unwrap();
        assert_eq!(id, 3);

        transport.open_gate(10);
        wait_for_delivered(&queue, 3).await;
        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_retries_abandon_and_move_on() {
        let transport = Arc::new(RecordingTransport::new());
        transport.fail_times(ENDPOINT, 1, u32::MAX);
        let queue = DeliveryQueue::spawn(
            ENDPOINT,
            transport.clone(),
            DeliveryConfig {
                capacity: 4,
                backoff_unit: Duration::from_millis(100),
                max_retries: 2,
            },
        );

        queue.enqueue(reading(0.1)).await.unwrap();
        queue.enqueue(reading(0.2)).await.unwrap();
        wait_for_delivered(&queue, 1).await;

        let stats = queue.stats();
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.failed_attempts, 3);
        assert_eq!(transport.delivered()[0].id, 2);

        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_returns_in_flight_then_pending() {
        let transport = Arc::new(RecordingTransport::new());
        transport.set_failing(true);
        let queue = DeliveryQueue::spawn(ENDPOINT, transport.clone(), config(4));

        for i in 0..3 {
            queue.enqueue(reading(i as f64)).await.unwrap();
        }
        // Let the first attempt fail so envelope 1 sits in backoff.
        while queue.stats().failed_attempts == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let undelivered = queue.shutdown().await;
        let ids: Vec<u64> = undelivered.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(undelivered.iter().all(|e| e.data.kind == Kind::Reading));

        assert!(queue.shutdown().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_is_not_retried() {
        let transport = Arc::new(
            RecordingTransport::new().with_failure(|_| Error::Internal("unsendable".into())),
        );
        let queue = DeliveryQueue::spawn(ENDPOINT, transport.clone(), config(4));

        transport.fail_times(ENDPOINT, 1, 1);
        queue.enqueue(reading(0.1)).await.unwrap();
        queue.enqueue(reading(0.2)).await.unwrap();
        wait_for_delivered(&queue, 1).await;

        let stats = queue.stats();
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.failed_attempts, 1);
        assert_eq!(stats.retries, 0);
        assert_eq!(transport.attempts().len(), 2);
        assert_eq!(transport.delivered()[0].id, 2);

        queue.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_after_shutdown_fails() {
        let transport = Arc::new(RecordingTransport::new());
        let queue = DeliveryQueue::spawn(ENDPOINT, transport, config(2));

        queue.shutdown().await;

        let err = queue.enqueue(reading(0.5)).await.unwrap_err();
        assert!(matches!(err, Error::QueueClosed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_stalled_transport() {
        let transport = Arc::new(RecordingTransport::new().gated());
        let queue = DeliveryQueue::spawn(ENDPOINT, transport.clone(), config(2));

        queue.enqueue(reading(0.1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let undelivered = queue.shutdown().await;
        assert_eq!(undelivered.len(), 1);
        assert_eq!(undelivered[0].id, 1);
        assert!(transport.attempts().is_empty());
    }
}
