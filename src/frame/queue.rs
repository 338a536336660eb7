//! Bounded frame queue with drop-oldest admission
//!
//! The one structure shared between a producer and a consumer thread.
//! `offer` never blocks: when the queue is full the oldest entry is
//! evicted first, because a live stream wants the freshest frame, not a
//! complete one. Eviction is silent apart from a counter.

use log::debug;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

struct Inner<T> {
    items: VecDeque<T>,
    dropped: u64,
    closed: bool,
}

/// Fixed-capacity ring shared by exactly one producer and one consumer.
pub struct FrameQueue<T> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> FrameQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                dropped: 0,
                closed: false,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Admit an item, evicting the oldest entry first when full.
    /// Never blocks and never fails.
    pub fn offer(&self, item: T) {
        let mut inner = self.inner.lock();
        if inner.items.len() == self.capacity {
            inner.items.pop_front();
            inner.dropped += 1;
            if inner.dropped == 1 || inner.dropped % 100 == 0 {
                debug!("frame queue full, evicted oldest ({} dropped so far)", inner.dropped);
            }
        }
        inner.items.push_back(item);
        drop(inner);
        self.available.notify_one();
    }

    /// Take the oldest item, waiting up to `timeout`. Returns `None` on
    /// timeout or after `close()` once the queue has drained.
    pub fn take(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.available.wait_for(&mut inner, deadline - now);
        }
    }

    /// Wake blocked takers during teardown. Items already queued can
    /// still be drained; new takes on an empty queue return immediately.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        drop(inner);
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total evictions since creation.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
