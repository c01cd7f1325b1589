//! Overlap guard shared by the interval-driven batch operations.

use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};

use counselconnect_common::AppError;

/// Serializes runs of one batch operation. The interval task and the admin
/// endpoint can both trigger a batch; a run landing while another is still
/// in flight is rejected with a Conflict instead of interleaving.
#[derive(Clone, Default)]
pub struct RunGuard {
    inner: Arc<Mutex<()>>,
}

impl RunGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, operation: &str) -> Result<MutexGuard<'_, ()>, AppError> {
        self.inner
            .try_lock()
            .map_err(|_| AppError::Conflict(format!("{} run already in progress", operation)))
    }
}
