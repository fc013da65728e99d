//! Jobs tying a receive session or a list of paths to a task and the
//! loading pipeline.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use canonical_path::CanonicalPathBuf;
use tokio::sync::mpsc;

use crate::param::{Blob, ParameterDescriptor};
use crate::pipeline::LoadingPipeline;
use crate::scene::LoadedModel;
use crate::session::{SessionStatus, UploadSession};
use crate::task::{CancellableTask, RegisteredJob, TaskContext};
use crate::{Result, UploadError};

/// Binary upload in flight: the session receives on the caller's thread,
/// completed blobs go through a channel to the task, which loads them one
/// after another on the pool.
pub struct UploadJob {
    session: Mutex<UploadSession>,
    blobs: Mutex<Option<mpsc::UnboundedSender<Blob>>>,
    task: CancellableTask<Vec<LoadedModel>>,
}

impl UploadJob {
    /// Validate `params` and prepare the task; nothing runs until the task
    /// is scheduled.
    pub fn new(
        label: &str,
        params: Vec<ParameterDescriptor>,
        pipeline: Arc<LoadingPipeline>,
    ) -> Result<Self> {
        let config = pipeline.config().clone();
        let session = UploadSession::begin_with(
            params,
            &pipeline.supported_types(),
            &config,
        )?;
        let count = session.param_count();
        let load_weight = config.load_weight(count);
        let replace = config.replace_scene;

        let (tx, rx) = mpsc::unbounded_channel::<Blob>();
        let task = CancellableTask::new(label, move |ctx: TaskContext| {
            load_received(ctx, rx, pipeline, count, load_weight, replace)
        });

        let session = session.with_progress(task.progress().clone());
        Ok(Self {
            session: Mutex::new(session),
            blobs: Mutex::new(Some(tx)),
            task,
        })
    }

    pub fn task(&self) -> &CancellableTask<Vec<LoadedModel>> {
        &self.task
    }

    /// Feed one binary frame.
    ///
    /// A protocol violation fails the task with `InvalidBinaryReceive`;
    /// frames reaching a finished task are rejected without touching it.
    pub fn append_chunk(&self, bytes: &[u8]) -> Result<()> {
        if self.task.is_terminal() {
            return Err(UploadError::InvalidBinaryReceive);
        }
        if self.task.is_cancel_requested() {
            return Err(UploadError::Cancelled);
        }

        let status = self.lock_session().append_chunk(bytes);
        match status {
            SessionStatus::Receiving => Ok(()),
            SessionStatus::ParameterReady(blob) => {
                self.forward(blob);
                Ok(())
            }
            SessionStatus::AllComplete(blob) => {
                self.forward(blob);
                self.close();
                Ok(())
            }
            SessionStatus::ProtocolError => {
                self.lock_session().fail();
                self.close();
                self.task.fail(UploadError::InvalidBinaryReceive);
                Err(UploadError::InvalidBinaryReceive)
            }
        }
    }

    pub fn cancel(&self) {
        self.task.cancel();
        self.close();
    }

    /// Receive progress in `[0, receiveWeight]`.
    pub fn receive_progress(&self) -> f64 {
        self.lock_session().receive_progress()
    }

    fn forward(&self, blob: Blob) {
        let blobs = self.blobs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = blobs.as_ref() {
            if sender.send(blob).is_err() {
                log::debug!("{}: task gone, blob dropped", self.task.label());
            }
        }
    }

    fn close(&self) {
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn lock_session(&self) -> MutexGuard<'_, UploadSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Task body of an upload: load each blob as it arrives, in order.
async fn load_received(
    ctx: TaskContext,
    mut rx: mpsc::UnboundedReceiver<Blob>,
    pipeline: Arc<LoadingPipeline>,
    count: usize,
    load_weight: f64,
    replace: bool,
) -> Result<Vec<LoadedModel>> {
    let mut loaded = Vec::with_capacity(count);
    for index in 0..count {
        let blob = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(UploadError::Cancelled),
            blob = rx.recv() => match blob {
                Some(blob) => blob,
                None => return Err(UploadError::Cancelled),
            },
        };

        let pipeline = Arc::clone(&pipeline);
        let token = ctx.token().clone();
        let progress = ctx.progress().clone();
        let first = replace && index == 0;
        let model = ctx
            .run_blocking(move || {
                let phase = progress.phase(load_weight);
                pipeline.load_blob(blob, first, &phase, &token)
            })
            .await?;
        loaded.push(model);
    }
    Ok(loaded)
}

impl RegisteredJob for UploadJob {
    fn is_finished(&self) -> bool {
        self.task.is_terminal()
    }

    fn on_finished(&self, callback: Box<dyn FnOnce() + Send>) {
        self.task.on_complete(move |_| callback());
    }
}

/// Load of server-side files or directories.
pub struct PathJob {
    paths: Vec<CanonicalPathBuf>,
    task: CancellableTask<Vec<LoadedModel>>,
}

impl PathJob {
    /// Every path must exist, and a file must have a supported extension.
    /// Only cheap checks run here; directories are walked by the task,
    /// which fails with `UnsupportedType` when none of their files loads.
    pub fn new(
        label: &str,
        paths: Vec<String>,
        pipeline: Arc<LoadingPipeline>,
    ) -> Result<Self> {
        if paths.is_empty() {
            return Err(UploadError::MissingParams);
        }
        let mut canonical = Vec::with_capacity(paths.len());
        for (index, path) in paths.iter().enumerate() {
            if path.is_empty() {
                return Err(UploadError::MissingParams);
            }
            let path = CanonicalPathBuf::canonicalize(path)
                .map_err(|_| UploadError::InvalidPath(path.clone()))?;
            if !path.as_path().is_dir() && !is_loadable(&pipeline, &path) {
                return Err(unsupported(index, &pipeline));
            }
            canonical.push(path);
        }

        let weight = 1.0 / canonical.len() as f64;
        let replace = pipeline.config().replace_scene;
        let paths = canonical.clone();
        let task = CancellableTask::blocking(label, move |ctx| {
            let mut loaded = Vec::new();
            for (index, path) in paths.iter().enumerate() {
                ctx.checkpoint()?;
                let models = pipeline
                    .load_path(
                        path.as_path(),
                        replace && index == 0,
                        ctx.progress(),
                        weight,
                        ctx.token(),
                    )
                    .map_err(|e| match e {
                        UploadError::NoLoaderFound(_) => {
                            unsupported(index, &pipeline)
                        }
                        e => e,
                    })?;
                loaded.extend(models);
            }
            Ok(loaded)
        });

        Ok(Self {
            paths: canonical,
            task,
        })
    }

    pub fn paths(&self) -> &[CanonicalPathBuf] {
        &self.paths
    }

    pub fn task(&self) -> &CancellableTask<Vec<LoadedModel>> {
        &self.task
    }
}

fn is_loadable(pipeline: &LoadingPipeline, path: &CanonicalPathBuf) -> bool {
    let registry = pipeline.registry();
    path.as_path()
        .extension()
        .map(|ext| registry.is_supported(&ext.to_string_lossy()))
        .unwrap_or(false)
}

fn unsupported(index: usize, pipeline: &LoadingPipeline) -> UploadError {
    UploadError::UnsupportedType {
        index,
        supported_types: pipeline.supported_types().into_iter().collect(),
    }
}

impl RegisteredJob for PathJob {
    fn is_finished(&self) -> bool {
        self.task.is_terminal()
    }

    fn on_finished(&self, callback: Box<dyn FnOnce() + Send>) {
        self.task.on_complete(move |_| callback());
    }
}
