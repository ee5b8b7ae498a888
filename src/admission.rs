//! Global admission control for provider calls.
//!
//! Wraps a tokio [`Semaphore`], which hands out permits in strict arrival order. A permit is
//! returned when the [`AdmissionPermit`] guard drops, so every exit path of a call releases
//! exactly once.
use std::sync::Arc;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tracing::trace;

#[derive(Debug, Clone)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

/// Proof of admission. Dropping it releases the slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionGate {
    /// A gate with `max_concurrent` slots (at least one).
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Wait, without timeout, until a slot is free.
    pub async fn acquire(&self) -> Result<AdmissionPermit, AcquireError> {
        trace!(waiting_behind = self.in_use(), "Waiting for admission");
        let permit = Arc::clone(&self.semaphore).acquire_owned().await?;
        Ok(AdmissionPermit { _permit: permit })
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Number of permits currently held.
    pub fn in_use(&self) -> usize {
        self.max_concurrent - self.semaphore.available_permits()
    }
}
