use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    fn from_io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            StoreError::NotFound(path.to_path_buf())
        } else {
            StoreError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// A regular file seen while listing a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub modified: SystemTime,
}

/// Filesystem access used by the session engine.
///
/// Artifacts are produced by an external client, so everything the engine
/// knows about them goes through this trait. Tests substitute their own
/// implementation or point [`LocalFs`] at a temporary directory.
pub trait FileStore: Send + Sync {
    fn read(&self, path: &Path) -> Result<Vec<u8>, StoreError>;

    /// Create or truncate `path` and write `contents`.
    fn write(&self, path: &Path, contents: &[u8]) -> Result<(), StoreError>;

    fn exists(&self, path: &Path) -> bool;

    /// Current size in bytes, used to tell when a writer has finished.
    fn len(&self, path: &Path) -> Result<u64, StoreError>;

    /// Regular files directly inside `dir` (not recursive).
    fn list_files(&self, dir: &Path) -> Result<Vec<FileEntry>, StoreError>;
}

/// Destination for command lines addressed to the external client.
pub trait CommandSink: Send + Sync {
    fn send(&self, command: &str);
}

impl<F> CommandSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn send(&self, command: &str) {
        self(command)
    }
}

/// [`FileStore`] over the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

impl FileStore for LocalFs {
    fn read(&self, path: &Path) -> Result<Vec<u8>, StoreError> {
        std::fs::read(path).map_err(|e| StoreError::from_io(path, e))
    }

    fn write(&self, path: &Path, contents: &[u8]) -> Result<(), StoreError> {
        std::fs::write(path, contents).map_err(|e| StoreError::from_io(path, e))
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn len(&self, path: &Path) -> Result<u64, StoreError> {
        std::fs::metadata(path)
            .map(|m| m.len())
            .map_err(|e| StoreError::from_io(path, e))
    }

    fn list_files(&self, dir: &Path) -> Result<Vec<FileEntry>, StoreError> {
        let entries = std::fs::read_dir(dir).map_err(|e| StoreError::from_io(dir, e))?;
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::from_io(dir, e))?;
            let path = entry.path();
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            files.push(FileEntry { path, modified });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }
}
