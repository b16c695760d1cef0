//! Binary gate over a one-permit semaphore.
//!
//! The permit is an RAII guard, so the gate reopens on every exit path,
//! including `?` returns and panics.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{OutboxError, OutboxResult};

#[derive(Debug, Clone)]
pub struct Gate {
    name: &'static str,
    permits: Arc<Semaphore>,
}

/// Held while inside the gate.
pub type GatePermit = OwnedSemaphorePermit;

impl Gate {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            permits: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Enter without waiting; `None` when someone else is inside.
    pub fn try_enter(&self) -> Option<GatePermit> {
        self.permits.clone().try_acquire_owned().ok()
    }

    pub async fn enter(&self) -> OutboxResult<GatePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| OutboxError::Cancelled)
    }

    /// Blocks the calling thread until the gate opens. Needs no runtime.
    pub fn enter_blocking(&self) -> OutboxResult<GatePermit> {
        futures::executor::block_on(self.permits.clone().acquire_owned())
            .map_err(|_| OutboxError::Cancelled)
    }

    pub fn is_busy(&self) -> bool {
        self.permits.available_permits() == 0
    }
}
