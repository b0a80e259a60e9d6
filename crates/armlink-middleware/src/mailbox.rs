//! Single-slot, latest-value-wins mailbox.
//!
//! The publisher never blocks: publishing into an occupied slot evicts the
//! unconsumed value. A consumer therefore always sees the most recent value
//! and never a backlog, and a slow or absent consumer cannot stall the
//! publisher.
//!
//! # Example
//!
//! ```rust
//! use armlink_middleware::Mailbox;
//!
//! let mailbox = Mailbox::new();
//! mailbox.publish(1);
//! mailbox.publish(2); // evicts 1
//! assert_eq!(mailbox.try_take(), Some(2));
//! assert_eq!(mailbox.try_take(), None);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;

struct Inner<T> {
    slot: Mutex<Option<T>>,
    notify: Notify,
    published: AtomicU64,
    evicted: AtomicU64,
}

/// Capacity-one overwrite mailbox. Clones share the same slot.
pub struct Mailbox<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Mailbox<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(None),
                notify: Notify::new(),
                published: AtomicU64::new(0),
                evicted: AtomicU64::new(0),
            }),
        }
    }

    /// Store `value`, replacing any unconsumed one.
    ///
    /// Returns `true` when a stale value was evicted.
    pub fn publish(&self, value: T) -> bool {
        let evicted = self
            .inner
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(value)
            .is_some();
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        if evicted {
            self.inner.evicted.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.notify.notify_one();
        evicted
    }

    /// Take the pending value without waiting.
    pub fn try_take(&self) -> Option<T> {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Wait until a value is available and take it.
    pub async fn recv(&self) -> T {
        loop {
            if let Some(value) = self.try_take() {
                return value;
            }
            self.inner.notify.notified().await;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Total number of published values.
    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    /// Number of values replaced before anyone consumed them.
    pub fn evicted(&self) -> u64 {
        self.inner.evicted.load(Ordering::Relaxed)
    }
}
