//! Format-specific loaders and the registry dispatching to them.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use walkdir::{DirEntry, WalkDir};

use crate::cancel::CancellationToken;
use crate::config::PipelineConfig;
use crate::errors::LoadError;
use crate::param::{self, Blob};
use crate::progress::ProgressPhase;
use crate::scene::Model;

pub mod obj;
pub mod xyz;

pub use obj::ObjLoader;
pub use xyz::{XyzLoader, XyzbLoader};

/// Progress and cancellation handed to a loader for one blob or file.
pub struct LoadContext<'a> {
    phase: &'a ProgressPhase,
    cancel: &'a CancellationToken,
}

impl<'a> LoadContext<'a> {
    pub fn new(
        phase: &'a ProgressPhase,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self { phase, cancel }
    }

    /// `Err(LoadError::Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<(), LoadError> {
        if self.cancel.is_cancelled() {
            return Err(LoadError::Cancelled);
        }
        Ok(())
    }

    /// Report loader-local progress in `[0, 1]`; also a checkpoint.
    pub fn progress(
        &self,
        operation: &str,
        fraction: f64,
    ) -> Result<(), LoadError> {
        self.check()?;
        self.phase.report(operation, fraction);
        Ok(())
    }
}

pub trait Loader: Send + Sync {
    fn name(&self) -> &str;

    /// Lowercase types or file extensions this loader accepts.
    fn supported_types(&self) -> Vec<String>;

    fn supports_type(&self, type_tag: &str) -> bool {
        param::matches_type(type_tag, &self.supported_types())
    }

    fn load_blob(
        &self,
        blob: Blob,
        ctx: &LoadContext<'_>,
    ) -> Result<Model, LoadError>;

    fn load_file(
        &self,
        path: &Path,
        ctx: &LoadContext<'_>,
    ) -> Result<Model, LoadError> {
        ctx.check()?;
        let bytes = fs::read(path)?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.load_blob(
            Blob {
                type_tag: extension(path).unwrap_or_default(),
                name,
                bytes,
            },
            ctx,
        )
    }
}

/// Ordered list of loaders; the first matching one wins.
#[derive(Clone, Default)]
pub struct LoaderRegistry {
    loaders: Vec<Arc<dyn Loader>>,
}

impl fmt::Debug for LoaderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.loaders.iter().map(|l| l.name()))
            .finish()
    }
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults(config: &PipelineConfig) -> Self {
        let mut registry = Self::new();
        registry.register(XyzLoader::new(config.point_radius));
        registry.register(XyzbLoader::new(config.point_radius));
        registry.register(ObjLoader::new());
        registry
    }

    pub fn register<L: Loader + 'static>(&mut self, loader: L) {
        log::debug!("loader registry: registering {}", loader.name());
        self.loaders.push(Arc::new(loader));
    }

    pub fn supported_types(&self) -> BTreeSet<String> {
        self.loaders
            .iter()
            .flat_map(|loader| loader.supported_types())
            .collect()
    }

    pub fn is_supported(&self, type_tag: &str) -> bool {
        self.find(type_tag).is_some()
    }

    /// Exact matches of any loader take precedence over suffix matches,
    /// then registration order decides.
    pub fn find(&self, type_tag: &str) -> Option<Arc<dyn Loader>> {
        self.loaders
            .iter()
            .find(|loader| {
                loader
                    .supported_types()
                    .iter()
                    .any(|t| t.eq_ignore_ascii_case(type_tag))
            })
            .or_else(|| {
                self.loaders
                    .iter()
                    .find(|loader| loader.supports_type(type_tag))
            })
            .cloned()
    }

    /// Loader and files for a path.
    ///
    /// A file is dispatched on its extension. For a directory, the first
    /// file (in sorted walk order) that any loader supports selects the
    /// loader, and every file that loader supports is loaded. Mixed-format
    /// directories therefore only load the format seen first.
    pub fn find_for_path(
        &self,
        path: &Path,
    ) -> Option<(Arc<dyn Loader>, Vec<PathBuf>)> {
        if !path.is_dir() {
            let loader = self.find(&extension(path)?)?;
            return Some((loader, vec![path.to_path_buf()]));
        }

        let files: Vec<PathBuf> = WalkDir::new(path)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e))
            .filter_map(|entry| match entry {
                Ok(entry) if entry.file_type().is_file() => {
                    Some(entry.into_path())
                }
                Ok(_) => None,
                Err(e) => {
                    log::warn!("loader registry: skipping entry: {}", e);
                    None
                }
            })
            .collect();

        let loader = files
            .iter()
            .find_map(|file| self.find(&extension(file)?))?;
        let selected: Vec<PathBuf> = files
            .into_iter()
            .filter(|file| {
                extension(file)
                    .map(|ext| loader.supports_type(&ext))
                    .unwrap_or(false)
            })
            .collect();
        log::debug!(
            "loader registry: {} selected for {} files in {}",
            loader.name(),
            selected.len(),
            path.display()
        );
        Some((loader, selected))
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|s| s.starts_with('.'))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempdir::TempDir;

    fn registry() -> LoaderRegistry {
        LoaderRegistry::with_defaults(&PipelineConfig::default())
    }

    #[test]
    fn default_types() {
        let types: Vec<String> =
            registry().supported_types().into_iter().collect();
        assert_eq!(types, vec!["obj", "xyz", "xyzb"]);
    }

    #[rstest]
    #[case("xyz", Some("xyz"))]
    #[case("XYZB", Some("xyzb"))]
    #[case("b", Some("xyzb"))]
    #[case("yz", Some("xyz"))]
    #[case("obj", Some("obj"))]
    #[case("blub", None)]
    fn dispatch_by_type(
        #[case] type_tag: &str,
        #[case] expected: Option<&str>,
    ) {
        let found = registry().find(type_tag);
        assert_eq!(found.as_ref().map(|l| l.name()), expected);
        assert_eq!(registry().is_supported(type_tag), expected.is_some());
    }

    #[test]
    fn directory_uses_first_supported_file() {
        let dir = TempDir::new("loader_registry").unwrap();
        fs::write(dir.path().join("a.txt"), "skip").unwrap();
        fs::write(dir.path().join("b.xyz"), "1 2 3\n").unwrap();
        fs::write(dir.path().join("c.obj"), "v 0 0 0\n").unwrap();
        fs::create_dir(dir.path().join("d")).unwrap();
        fs::write(dir.path().join("d").join("e.xyz"), "4 5 6\n").unwrap();
        fs::write(dir.path().join(".hidden.xyz"), "7 8 9\n").unwrap();

        let (loader, files) = registry().find_for_path(dir.path()).unwrap();
        assert_eq!(loader.name(), "xyz");
        assert_eq!(
            files,
            vec![dir.path().join("b.xyz"), dir.path().join("d").join("e.xyz")]
        );
    }

    #[test]
    fn directory_without_supported_files() {
        let dir = TempDir::new("loader_registry").unwrap();
        fs::write(dir.path().join("a.txt"), "skip").unwrap();
        assert!(registry().find_for_path(dir.path()).is_none());
    }

    #[test]
    fn file_dispatches_on_extension() {
        let (loader, files) = registry()
            .find_for_path(Path::new("/data/monkey.OBJ"))
            .unwrap();
        assert_eq!(loader.name(), "obj");
        assert_eq!(files.len(), 1);
    }
}
