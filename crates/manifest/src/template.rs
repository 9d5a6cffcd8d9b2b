//! Sources of the untransformed manifest.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use keel_core::Error;
use tracing::info;

use crate::Manifest;

/// Supplies the manifest every pass starts from.
pub trait TemplateSource: Send + Sync {
    fn manifest(&self) -> Arc<Manifest>;
}

/// Fixed in-memory manifest.
pub struct StaticTemplate(Arc<Manifest>);

impl StaticTemplate {
    pub fn new(manifest: Manifest) -> Self {
        Self(Arc::new(manifest))
    }
}

impl TemplateSource for StaticTemplate {
    fn manifest(&self) -> Arc<Manifest> {
        Arc::clone(&self.0)
    }
}

/// Manifest read from a YAML file; `reload` swaps in a fresh parse without
/// blocking passes that hold the previous one.
pub struct FileTemplate {
    path: PathBuf,
    current: ArcSwap<Manifest>,
}

impl FileTemplate {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let manifest = Manifest::from_path(&path)?;
        Ok(Self { path, current: ArcSwap::from_pointee(manifest) })
    }

    /// Re-read the file. On error the previous manifest stays in place.
    pub fn reload(&self) -> Result<usize, Error> {
        let next = Manifest::from_path(&self.path)?;
        let count = next.len();
        let digest = next.digest();
        self.current.store(Arc::new(next));
        info!(path = %self.path.display(), resources = count, %digest, "manifest reloaded");
        Ok(count)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TemplateSource for FileTemplate {
    fn manifest(&self) -> Arc<Manifest> {
        self.current.load_full()
    }
}
