//! Observability and Metrics
//!
//! Thread-safe counters for monitoring session traffic and health.
//! Every session owns one collector; loops update it with relaxed atomics
//! so the hot path never contends on a lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Per-session metrics collector
#[derive(Debug)]
pub struct Metrics {
    /// Total messages sent
    pub messages_sent: AtomicU64,
    /// Total messages received
    pub messages_received: AtomicU64,
    /// Total bytes sent
    pub bytes_sent: AtomicU64,
    /// Total bytes received
    pub bytes_received: AtomicU64,
    /// Sends that never saw their UDP acknowledgement
    pub ack_timeouts: AtomicU64,
    /// Inbound frames dropped as malformed
    pub frames_dropped: AtomicU64,
    /// Enqueue attempts rejected by a full or over-limit box
    pub enqueue_rejected: AtomicU64,
    /// Mirror batches pushed
    pub mirror_batches_sent: AtomicU64,
    /// Mirror batches applied
    pub mirror_batches_applied: AtomicU64,
    /// Loop-terminating errors
    pub loop_errors: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            ack_timeouts: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            enqueue_rejected: AtomicU64::new(0),
            mirror_batches_sent: AtomicU64::new(0),
            mirror_batches_applied: AtomicU64::new(0),
            loop_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn message_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn message_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn ack_timeout(&self) {
        self.ack_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn enqueue_rejection(&self) {
        self.enqueue_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mirror_batch_sent(&self) {
        self.mirror_batches_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mirror_batch_applied(&self) {
        self.mirror_batches_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn loop_error(&self) {
        self.loop_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Seconds since this collector was created
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Emit a one-line summary at info level
    pub fn log_summary(&self) {
        info!(
            uptime_secs = self.uptime_secs(),
            sent = self.messages_sent.load(Ordering::Relaxed),
            received = self.messages_received.load(Ordering::Relaxed),
            bytes_sent = self.bytes_sent.load(Ordering::Relaxed),
            bytes_received = self.bytes_received.load(Ordering::Relaxed),
            ack_timeouts = self.ack_timeouts.load(Ordering::Relaxed),
            frames_dropped = self.frames_dropped.load(Ordering::Relaxed),
            enqueue_rejected = self.enqueue_rejected.load(Ordering::Relaxed),
            "Session metrics"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
