//! Cooperative cancellation.
//!
//! Cancellation is advisory: setting the token never interrupts a worker.
//! Work observes it at checkpoints (chunk boundaries, progress updates,
//! per-record loops in loaders, lock retries) and returns
//! [`UploadError::Cancelled`], which the task turns into its `Cancelled`
//! outcome.

use std::time::Duration;

pub use tokio_util::sync::CancellationToken;

use crate::{Result, UploadError};

pub trait Checkpoint {
    /// `Err(UploadError::Cancelled)` once cancellation was requested.
    fn checkpoint(&self) -> Result<()>;

    /// Sleep for `duration`, then run a checkpoint.
    fn pause(&self, duration: Duration) -> Result<()> {
        std::thread::sleep(duration);
        self.checkpoint()
    }
}

impl Checkpoint for CancellationToken {
    fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        Ok(())
    }
}
