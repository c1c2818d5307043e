//! Farm directory layout and read-only file access.
//!
//! A farm is the root directory of a database instance. Everything this
//! loader touches lives under `<farm>/bat`: the committed catalog at
//! `BACKUP/BBP.dir` and per-column data files named by a persisted stem
//! (typically `<hex>/<digits>`) plus an extension (`tail`, `theap`).

use std::fs::File;
use std::path::{Component, MAIN_SEPARATOR, Path, PathBuf};

use crate::error::{Error, Result};

/// Subdirectory of the farm holding all column data.
pub const BAT_DIR: &str = "bat";
/// Subdirectory of [`BAT_DIR`] holding the committed catalog.
pub const BACKUP_DIR: &str = "BACKUP";
/// The catalog file name.
pub const BBP_DIR: &str = "BBP.dir";

/// Extension of a column's primary heap file.
pub const TAIL_EXT: &str = "tail";
/// Extension of a column's variable-width heap file.
pub const VHEAP_EXT: &str = "theap";

#[derive(Debug, Clone)]
pub struct FarmDir {
    root: PathBuf,
}

impl FarmDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FarmDir { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<farm>/bat/BACKUP/BBP.dir`.
    pub fn catalog_path(&self) -> PathBuf {
        self.root.join(BAT_DIR).join(BACKUP_DIR).join(BBP_DIR)
    }

    /// `<farm>/bat/<stem>.<ext>`. The stem must stay inside the farm:
    /// absolute stems and parent components are rejected.
    pub fn data_path(&self, stem: &str, ext: &str) -> Result<PathBuf> {
        let stem = normalize_stem(stem);
        let rel = Path::new(&stem);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::BadFilename {
                stem: stem.to_string(),
            });
        }
        // Append rather than set_extension: a stem may itself contain dots.
        let mut path = self.root.join(BAT_DIR).join(rel).into_os_string();
        path.push(".");
        path.push(ext);
        Ok(PathBuf::from(path))
    }

    /// Open a file read-only. This loader never opens anything for writing.
    pub fn open_read(path: &Path) -> Result<File> {
        File::open(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Persisted stems may use either separator; fold both onto the host's.
pub fn normalize_stem(stem: &str) -> String {
    stem.replace(['/', '\\'], &MAIN_SEPARATOR.to_string())
}
