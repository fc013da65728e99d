use std::future::Future;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};

use crate::{Result, UploadError};

/// Owned, bounded pool running task bodies and blocking loads.
///
/// Loaders run through `spawn_blocking`, limited to `workers` threads, so
/// the caller's event loop never parses data itself.
#[derive(Debug)]
pub struct WorkerPool {
    runtime: Option<Runtime>,
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(UploadError::Config(
                "worker pool needs at least one thread".to_owned(),
            ));
        }
        let runtime = Builder::new_multi_thread()
            .worker_threads(workers)
            .max_blocking_threads(workers)
            .thread_name("blobstream-worker")
            .enable_all()
            .build()?;
        log::debug!("worker pool: started with {} workers", workers);
        Ok(Self {
            runtime: Some(runtime),
            workers,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn spawn<F>(&self, future: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle()?.spawn(future);
        Ok(())
    }

    pub fn handle(&self) -> Result<Handle> {
        self.runtime
            .as_ref()
            .map(|runtime| runtime.handle().clone())
            .ok_or_else(|| {
                UploadError::Config("worker pool is shut down".to_owned())
            })
    }

    /// Stop accepting work and wait up to `timeout` for running loads.
    ///
    /// Tasks should be cancelled beforehand; a loader that never reaches a
    /// checkpoint is abandoned after the timeout.
    pub fn shutdown(mut self, timeout: Duration) {
        if let Some(runtime) = self.runtime.take() {
            log::debug!("worker pool: shutting down");
            runtime.shutdown_timeout(timeout);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn runs_spawned_work() {
        let pool = WorkerPool::new(2).unwrap();
        assert_eq!(pool.workers(), 2);
        let (tx, rx) = mpsc::channel();
        pool.spawn(async move {
            let value = tokio::task::spawn_blocking(|| 21 * 2).await.unwrap();
            tx.send(value).unwrap();
        })
        .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
        pool.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn zero_workers_is_rejected() {
        assert!(matches!(WorkerPool::new(0), Err(UploadError::Config(_))));
    }
}
