use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{PoisonError, RwLockWriteGuard, TryLockError};
use std::time::Duration;

use crate::cancel::{CancellationToken, Checkpoint};
use crate::config::PipelineConfig;
use crate::loader::{LoadContext, Loader, LoaderRegistry};
use crate::param::Blob;
use crate::progress::{Progress, ProgressPhase};
use crate::scene::{LoadedModel, Model, Scene, SharedScene};
use crate::{Result, UploadError, FOREVER_TYPE};

const FOREVER_SLEEP: Duration = Duration::from_millis(10);

/// Turns completed blobs and filesystem paths into scene models.
///
/// Parsing happens without holding the scene. Only the final swap (unload
/// when replacing, then add) runs under the scene's write lock, so a render
/// pass never sees a half-replaced scene. The lock is acquired with a
/// cancellable retry loop.
#[derive(Debug, Clone)]
pub struct LoadingPipeline {
    registry: LoaderRegistry,
    scene: SharedScene,
    config: PipelineConfig,
}

impl LoadingPipeline {
    pub fn new(
        registry: LoaderRegistry,
        scene: SharedScene,
        config: PipelineConfig,
    ) -> Self {
        Self {
            registry,
            scene,
            config,
        }
    }

    pub fn registry(&self) -> &LoaderRegistry {
        &self.registry
    }

    pub fn scene(&self) -> &SharedScene {
        &self.scene
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn supported_types(&self) -> BTreeSet<String> {
        self.registry.supported_types()
    }

    /// Load one blob into the scene, unloading the previous content first
    /// when `replace` is set.
    pub fn load_blob(
        &self,
        blob: Blob,
        replace: bool,
        phase: &ProgressPhase,
        cancel: &CancellationToken,
    ) -> Result<LoadedModel> {
        if blob.type_tag == FOREVER_TYPE {
            return self.load_forever(&blob.name, phase, cancel);
        }
        let loader = self
            .registry
            .find(&blob.type_tag)
            .ok_or_else(|| UploadError::NoLoaderFound(blob.type_tag.clone()))?;

        log::debug!(
            "pipeline/{}: loading {} bytes with {}",
            blob.name,
            blob.bytes.len(),
            loader.name()
        );
        phase.report("Loading data ...", 0.0);
        let model = loader.load_blob(blob, &LoadContext::new(phase, cancel))?;
        self.commit(model, replace, phase, cancel)
    }

    /// Load a file, or the files of a directory the first matching loader
    /// handles. `weight` is this path's share of `progress`, split evenly
    /// between its files.
    pub fn load_path(
        &self,
        path: &Path,
        replace: bool,
        progress: &Progress,
        weight: f64,
        cancel: &CancellationToken,
    ) -> Result<Vec<LoadedModel>> {
        let (loader, files) = self
            .registry
            .find_for_path(path)
            .ok_or_else(|| {
                UploadError::NoLoaderFound(path.display().to_string())
            })?;

        let share = weight / files.len().max(1) as f64;
        let mut loaded = Vec::with_capacity(files.len());
        for (i, file) in files.iter().enumerate() {
            cancel.checkpoint()?;
            let phase = progress.phase(share);
            phase.report(&format!("Loading {} ...", file.display()), 0.0);
            let model = load_file(loader.as_ref(), file, &phase, cancel)?;
            loaded.push(self.commit(model, replace && i == 0, &phase, cancel)?);
        }
        Ok(loaded)
    }

    fn commit(
        &self,
        model: Model,
        replace: bool,
        phase: &ProgressPhase,
        cancel: &CancellationToken,
    ) -> Result<LoadedModel> {
        let mut scene = self.lock_scene(cancel)?;
        cancel.checkpoint()?;
        if replace {
            phase.report("Unloading ...", phase.reached());
            scene.unload();
        }
        let loaded = scene.add_model(model);
        drop(scene);

        phase.finish("Done");
        log::info!(
            "pipeline/{}: model {} with {} primitives added",
            loaded.name,
            loaded.id,
            loaded.primitives
        );
        Ok(loaded)
    }

    fn lock_scene(
        &self,
        cancel: &CancellationToken,
    ) -> Result<RwLockWriteGuard<'_, Scene>> {
        loop {
            match self.scene.try_write() {
                Ok(guard) => return Ok(guard),
                Err(TryLockError::Poisoned(poisoned)) => {
                    return Ok(PoisonError::into_inner(poisoned))
                }
                Err(TryLockError::WouldBlock) => {
                    log::trace!("pipeline: scene busy, retrying");
                    cancel.pause(self.config.lock_retry())?;
                }
            }
        }
    }

    fn load_forever(
        &self,
        name: &str,
        phase: &ProgressPhase,
        cancel: &CancellationToken,
    ) -> Result<LoadedModel> {
        log::debug!("pipeline/{}: loading until cancelled", name);
        phase.report("Loading forever ...", 0.0);
        loop {
            cancel.pause(FOREVER_SLEEP)?;
        }
    }
}

fn load_file(
    loader: &dyn Loader,
    file: &Path,
    phase: &ProgressPhase,
    cancel: &CancellationToken,
) -> Result<Model> {
    Ok(loader.load_file(file, &LoadContext::new(phase, cancel))?)
}
