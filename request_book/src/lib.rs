//! Bounded concurrency for outbound requests with per-key de-duplication.
//!
//! Every request to a node is made while holding a [`Page`] of the book for its category.
//! A book admits at most `capacity` pages at a time and never admits two pages with the same
//! key. A second request for a key that is still in flight waits for the first one to finish.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{ensure, Result};
use dashmap::DashMap;
use log::trace;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};

pub struct RequestBook {
    name: &'static str,
    capacity: usize,
    permits: Arc<Semaphore>,
    keys: DashMap<String, Arc<Mutex<()>>>,
    active: AtomicUsize,
}

impl RequestBook {
    pub fn new(name: &'static str, capacity: usize) -> Result<Self> {
        ensure!(capacity > 0, Error::ZeroCapacity { name });

        Ok(Self {
            name,
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
            keys: DashMap::new(),
            active: AtomicUsize::new(0),
        })
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Waits until no other page for `key` is held and a slot of the book is free.
    ///
    /// The key lock is taken before the slot so that duplicate requests queue up
    /// without occupying capacity.
    pub async fn acquire(&self, key: impl Into<String>) -> Result<Page<'_>> {
        let key = key.into();

        let key_lock = {
            let entry = self.keys.entry(key.clone()).or_default();
            Arc::clone(entry.value())
        };
        let key_guard = key_lock.lock_owned().await;

        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| Error::Closed { name: self.name })?;

        let active = self.active.fetch_add(1, Ordering::AcqRel) + 1;

        trace!("{} book: acquired {key} ({active}/{} active)", self.name, self.capacity);

        Ok(Page {
            book: self,
            key,
            key_guard: Some(key_guard),
            permit: Some(permit),
        })
    }

    /// Number of pages currently held.
    #[must_use]
    pub fn active_pages(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    fn release(&self, key: &str) {
        let active = self.active.fetch_sub(1, Ordering::AcqRel) - 1;

        // Only the map itself references the lock once no page or waiter holds it.
        self.keys
            .remove_if(key, |_, key_lock| Arc::strong_count(key_lock) == 1);

        trace!("{} book: freed {key} ({active}/{} active)", self.name, self.capacity);
    }
}

/// A held slot of a [`RequestBook`]. Dropping it frees the slot and the key.
pub struct Page<'book> {
    book: &'book RequestBook,
    key: String,
    key_guard: Option<OwnedMutexGuard<()>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl Page<'_> {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Frees the page. Equivalent to dropping it.
    pub fn free(self) {
        drop(self);
    }
}

impl Drop for Page<'_> {
    fn drop(&mut self) {
        drop(self.permit.take());
        drop(self.key_guard.take());
        self.book.release(&self.key);
    }
}

#[derive(Debug, Error)]
#[cfg_attr(test, derive(PartialEq, Eq))]
enum Error {
    #[error("{name} request book has zero capacity")]
    ZeroCapacity { name: &'static str },
    #[error("{name} request book was closed")]
    Closed { name: &'static str },
}
