//! Admission control – bounds how many nettests run at once.
//!
//! A worker holds an [`AdmissionPermit`] from before its first network
//! phase until the run completes. With the default bound of one, nettests
//! sharing an `Admission` run strictly one after the other.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct Admission {
    permits: Arc<Semaphore>,
    limit: usize,
}

/// Released on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

impl Admission {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// One nettest at a time.
    pub fn serial() -> Self {
        Self::new(1)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Wait for a permit. `None` if `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<AdmissionPermit> {
        if cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = Arc::clone(&self.permits).acquire_owned() => {
                // the semaphore is never closed
                permit.ok().map(|p| AdmissionPermit { _permit: p })
            }
        }
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Default for Admission {
    fn default() -> Self {
        Self::serial()
    }
}
