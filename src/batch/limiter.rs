use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Returned by [`Limiter::submit`] when the task was dropped before it started
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cancelled;

/// Bounds the number of store calls in flight
///
/// Waiting tasks are admitted in arrival order. A slot is held only while
/// the task's future runs and is released when it finishes, errors included.
#[derive(Debug)]
pub struct Limiter {
    slots: Semaphore,
    capacity: usize,
    in_flight: AtomicUsize,
}

impl Limiter {
    /// Limiter admitting at most `capacity` tasks at once
    pub fn new(capacity: usize) -> Result<Self, Error> {
        if capacity == 0 {
            return Err(Error::InvalidConfig("concurrency must be at least 1".into()));
        }
        Ok(Self {
            slots: Semaphore::new(capacity),
            capacity,
            in_flight: AtomicUsize::new(0),
        })
    }

    /// Configured maximum
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tasks currently holding a slot
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Wait for a free slot, then run `task` to completion
    ///
    /// If `cancel` fires while waiting, `task` is never invoked. Once a task
    /// has started it always runs to completion.
    pub async fn submit<F, Fut>(&self, cancel: &CancellationToken, task: F) -> Result<Fut::Output, Cancelled>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Cancelled),
            permit = self.slots.acquire() => permit.map_err(|_| Cancelled)?,
        };

        let _slot = SlotGuard::enter(&self.in_flight);
        let output = task().await;
        drop(permit);
        Ok(output)
    }
}

struct SlotGuard<'a>(&'a AtomicUsize);

impl<'a> SlotGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        let _ = counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let _ = self.0.fetch_sub(1, Ordering::AcqRel);
    }
}
