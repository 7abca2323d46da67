//! Where asset bytes come from.

use std::fs;
use std::path::{Path, PathBuf};

/// Host-provided discovery and reading of asset source files. The
/// registry never touches the filesystem directly, which is what makes
/// the loader testable and lets hosts ship assets from archives.
pub trait AssetSource: Send + Sync {
    /// Source files for one asset kind, in a deterministic order.
    fn list(&self, kind: &str) -> anyhow::Result<Vec<PathBuf>>;

    fn read(&self, path: &Path) -> anyhow::Result<Vec<u8>>;
}

/// Reads `<root>/<kind>/*.json`, sorted by file name.
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl AssetSource for DirectorySource {
    fn list(&self, kind: &str) -> anyhow::Result<Vec<PathBuf>> {
        let dir = self.root.join(kind);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }

        paths.sort();
        Ok(paths)
    }

    fn read(&self, path: &Path) -> anyhow::Result<Vec<u8>> {
        Ok(fs::read(path)?)
    }
}
