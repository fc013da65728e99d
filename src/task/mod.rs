//! Cancellable, progress-reporting units of work.
//!
//! A [`CancellableTask`] moves `Pending -> Running -> {Completed, Failed,
//! Cancelled}` and never leaves a terminal state. Its completion callbacks
//! fire exactly once; a callback registered afterwards receives the cached
//! outcome immediately.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::cancel::{CancellationToken, Checkpoint};
use crate::progress::Progress;
use crate::{Result, UploadError};

pub mod registry;
pub mod worker;

pub use registry::{ClientId, RegisteredJob, TaskRegistry};
pub use worker::WorkerPool;

type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;
type Work<T> = Box<dyn FnOnce(TaskContext) -> BoxFuture<T> + Send>;
type Callback<T> = Box<dyn FnOnce(&TaskOutcome<T>) + Send>;

#[derive(Debug, Clone, PartialEq)]
pub enum TaskState<T> {
    Pending,
    Running,
    Completed(T),
    Failed(UploadError),
    Cancelled,
}

impl<T> TaskState<T> {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Pending | TaskState::Running)
    }

    fn name(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed(_) => "completed",
            TaskState::Failed(_) => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

/// Final result of a task, delivered once to every completion callback.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome<T> {
    Completed(T),
    Failed(UploadError),
    Cancelled,
}

impl<T> From<TaskOutcome<T>> for TaskState<T> {
    fn from(outcome: TaskOutcome<T>) -> Self {
        match outcome {
            TaskOutcome::Completed(value) => TaskState::Completed(value),
            TaskOutcome::Failed(error) => TaskState::Failed(error),
            TaskOutcome::Cancelled => TaskState::Cancelled,
        }
    }
}

impl<T> From<Result<T>> for TaskOutcome<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => TaskOutcome::Completed(value),
            Err(UploadError::Cancelled) => TaskOutcome::Cancelled,
            Err(error) => TaskOutcome::Failed(error),
        }
    }
}

/// What a running task body sees: its cancellation token and progress.
#[derive(Debug, Clone)]
pub struct TaskContext {
    token: CancellationToken,
    progress: Progress,
}

impl TaskContext {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn progress(&self) -> &Progress {
        &self.progress
    }

    pub fn checkpoint(&self) -> Result<()> {
        self.token.checkpoint()
    }

    /// Resolves once cancellation was requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Run CPU-bound work on the pool's blocking threads.
    pub async fn run_blocking<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce() -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f).await.map_err(|e| {
            UploadError::LoadingBinaryFailed(format!("worker failed: {}", e))
        })?
    }
}

struct Shared<T> {
    state: TaskState<T>,
    callbacks: Vec<Callback<T>>,
    work: Option<Work<T>>,
    /// Terminal and all callbacks ran; waiters are released only then.
    settled: bool,
}

struct Inner<T> {
    label: String,
    token: CancellationToken,
    progress: Progress,
    shared: Mutex<Shared<T>>,
    done: Condvar,
}

pub struct CancellableTask<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for CancellableTask<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for CancellableTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellableTask")
            .field("label", &self.inner.label)
            .field("state", &self.lock().state.name())
            .finish()
    }
}

impl<T> CancellableTask<T>
where
    T: Clone + Send + 'static,
{
    /// A pending task running the async `work` once scheduled.
    pub fn new<F, Fut>(label: &str, work: F) -> Self
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let work: Work<T> = Box::new(move |ctx| Box::pin(work(ctx)));
        Self {
            inner: Arc::new(Inner {
                label: label.to_owned(),
                token: CancellationToken::new(),
                progress: Progress::new("Scheduling task ..."),
                shared: Mutex::new(Shared {
                    state: TaskState::Pending,
                    callbacks: Vec::new(),
                    work: Some(work),
                    settled: false,
                }),
                done: Condvar::new(),
            }),
        }
    }

    /// A pending task running the blocking `work` on a pool thread.
    pub fn blocking<F>(label: &str, work: F) -> Self
    where
        F: FnOnce(TaskContext) -> Result<T> + Send + 'static,
    {
        Self::new(label, move |ctx: TaskContext| async move {
            let inner = ctx.clone();
            ctx.run_blocking(move || work(inner)).await
        })
    }

    /// Start the task on `pool`. Only the first call of a pending task has
    /// an effect; a task cancelled before scheduling never runs its work.
    pub fn schedule(&self, pool: &WorkerPool) -> Result<()> {
        let work = {
            let mut shared = self.lock();
            if !matches!(shared.state, TaskState::Pending) {
                return Ok(());
            }
            let work = match shared.work.take() {
                Some(work) => work,
                None => return Ok(()),
            };
            shared.state = TaskState::Running;
            work
        };
        log::debug!("task/{}: running", self.inner.label);

        let task = self.clone();
        let ctx = self.context();
        let spawned = pool.spawn(async move {
            if ctx.token.is_cancelled() {
                task.complete(TaskOutcome::Cancelled);
                return;
            }
            let result = work(ctx).await;
            task.complete(result.into());
        });
        if let Err(error) = spawned {
            self.complete(TaskOutcome::Failed(error.clone()));
            return Err(error);
        }
        Ok(())
    }

    /// Request cancellation. A pending task is cancelled at once, a running
    /// one at its next checkpoint; terminal tasks are left alone.
    pub fn cancel(&self) {
        {
            let shared = self.lock();
            if shared.state.is_terminal() {
                return;
            }
        }
        log::debug!("task/{}: cancel requested", self.inner.label);
        self.inner.token.cancel();
        let pending = {
            let mut shared = self.lock();
            if matches!(shared.state, TaskState::Pending) {
                shared.work = None;
                true
            } else {
                false
            }
        };
        if pending {
            self.complete(TaskOutcome::Cancelled);
        }
    }

    /// Finish with `error` from outside the worker, e.g. on a protocol
    /// violation. The worker is cancelled and its eventual result ignored.
    /// Returns false if the task already finished.
    pub fn fail(&self, error: UploadError) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.inner.token.cancel();
        self.complete(TaskOutcome::Failed(error))
    }

    /// Register a callback for the final outcome.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&TaskOutcome<T>) + Send + 'static,
    {
        let outcome = {
            let mut shared = self.lock();
            match outcome_of(&shared.state) {
                Some(outcome) => outcome,
                None => {
                    shared.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&outcome);
    }

    pub fn state(&self) -> TaskState<T> {
        self.lock().state.clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.lock().state.is_terminal()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn progress(&self) -> &Progress {
        &self.inner.progress
    }

    /// Block until the task finished and its callbacks ran. Never call from
    /// a pool thread.
    pub fn wait(&self) -> TaskOutcome<T> {
        let mut shared = self.lock();
        loop {
            if let Some(outcome) = settled_outcome(&shared) {
                return outcome;
            }
            shared = self
                .inner
                .done
                .wait(shared)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskOutcome<T>> {
        let deadline = Instant::now() + timeout;
        let mut shared = self.lock();
        loop {
            if let Some(outcome) = settled_outcome(&shared) {
                return Some(outcome);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            shared = self
                .inner
                .done
                .wait_timeout(shared, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn context(&self) -> TaskContext {
        TaskContext {
            token: self.inner.token.clone(),
            progress: self.inner.progress.clone(),
        }
    }

    /// Move to a terminal state once; returns false if already terminal.
    fn complete(&self, outcome: TaskOutcome<T>) -> bool {
        let callbacks = {
            let mut shared = self.lock();
            if shared.state.is_terminal() {
                log::trace!(
                    "task/{}: ignoring late outcome, already {}",
                    self.inner.label,
                    shared.state.name()
                );
                return false;
            }
            shared.state = outcome.clone().into();
            shared.work = None;
            std::mem::take(&mut shared.callbacks)
        };

        match &outcome {
            TaskOutcome::Completed(_) => {
                log::info!("task/{}: completed", self.inner.label)
            }
            TaskOutcome::Cancelled => {
                log::info!("task/{}: cancelled", self.inner.label)
            }
            TaskOutcome::Failed(error) => {
                log::error!("task/{}: failed: {}", self.inner.label, error)
            }
        }
        for callback in callbacks {
            callback(&outcome);
        }
        self.lock().settled = true;
        self.inner.done.notify_all();
        true
    }
}

impl<T> CancellableTask<T> {
    fn lock(&self) -> MutexGuard<'_, Shared<T>> {
        self.inner
            .shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn settled_outcome<T: Clone>(shared: &Shared<T>) -> Option<TaskOutcome<T>> {
    if !shared.settled {
        return None;
    }
    outcome_of(&shared.state)
}

fn outcome_of<T: Clone>(state: &TaskState<T>) -> Option<TaskOutcome<T>> {
    match state {
        TaskState::Pending | TaskState::Running => None,
        TaskState::Completed(value) => {
            Some(TaskOutcome::Completed(value.clone()))
        }
        TaskState::Failed(error) => Some(TaskOutcome::Failed(error.clone())),
        TaskState::Cancelled => Some(TaskOutcome::Cancelled),
    }
}
