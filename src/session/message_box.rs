//! Bounded message queue bridging user code and a transport loop.
//!
//! A box is the only structure two logical workers mutate concurrently
//! (producer + send loop, or receive loop + consumer), so enqueue/dequeue
//! run under one internal lock. Rejections are ordinary `false` returns,
//! never errors: a full box or an oversized payload is the caller's signal
//! to back off and retry.

use crate::utils::timeout::QUEUE_POLL_INTERVAL;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Bounded FIFO of opaque payloads
#[derive(Debug)]
pub struct MessageBox {
    inner: Mutex<VecDeque<Vec<u8>>>,
    capacity: usize,
    max_message_bytes: usize,
}

impl MessageBox {
    pub fn new(capacity: usize, max_message_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            max_message_bytes,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        match self.inner.lock() {
            Ok(queue) => queue.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append one payload. Returns `false` when the box is full or the
    /// payload exceeds the per-message byte limit — both non-fatal.
    pub fn enqueue(&self, payload: Vec<u8>) -> bool {
        if payload.len() > self.max_message_bytes {
            warn!(
                bytes = payload.len(),
                limit = self.max_message_bytes,
                "Rejecting oversized message"
            );
            return false;
        }

        let mut queue = match self.inner.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        };

        if queue.len() >= self.capacity {
            debug!(capacity = self.capacity, "Message box full");
            return false;
        }

        queue.push_back(payload);
        true
    }

    /// Remove the oldest payload, or `None` immediately when empty.
    pub fn dequeue(&self) -> Option<Vec<u8>> {
        let mut queue = match self.inner.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.pop_front()
    }

    /// Poll until a payload arrives or the timeout elapses.
    pub async fn dequeue_wait(&self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(payload) = self.dequeue() {
                return Some(payload);
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(QUEUE_POLL_INTERVAL).await;
        }
    }

    /// Drop everything queued. Used by `stop()`; in-flight messages are not drained.
    pub fn clear(&self) {
        let mut queue = match self.inner.lock() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        };
        queue.clear();
    }
}
