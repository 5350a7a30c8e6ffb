use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("failed to read library file {path}: {source}")]
    Open {
        source: io::Error,
        path: PathBuf,
    },
    #[error("failed to persist library file {path}: {source}")]
    Persist {
        source: io::Error,
        path: PathBuf,
    },
    #[error("failed to parse library file {path}: {source}")]
    Parse {
        source: serde_json::Error,
        path: PathBuf,
    },
}

pub type LibraryResult<T> = Result<T, LibraryError>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LibraryEntry {
    pub title: String,
    pub description: String,
    pub file_path: String,
}

/// Durable list of completed downloads consumed by the UI layer. Newest
/// entries go first.
#[derive(Debug)]
pub struct VideoLibrary {
    path: PathBuf,
    lock: Mutex<()>,
}

impl VideoLibrary {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn list(&self) -> LibraryResult<Vec<LibraryEntry>> {
        let _guard = self.lock.lock().unwrap();
        self.read_entries()
    }

    pub fn record(&self, entry: LibraryEntry) -> LibraryResult<()> {
        let _guard = self.lock.lock().unwrap();
        let mut entries = self.read_entries()?;
        entries.insert(0, entry);
        self.write_entries(&entries)
    }

    fn read_entries(&self) -> LibraryResult<Vec<LibraryEntry>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(LibraryError::Open {
                    source,
                    path: self.path.clone(),
                })
            }
        };
        serde_json::from_str(&content).map_err(|source| LibraryError::Parse {
            source,
            path: self.path.clone(),
        })
    }

    fn write_entries(&self, entries: &[LibraryEntry]) -> LibraryResult<()> {
        let parent = self
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&parent).map_err(|source| LibraryError::Persist {
            source,
            path: self.path.clone(),
        })?;
        let mut file = NamedTempFile::new_in(&parent).map_err(|source| LibraryError::Persist {
            source,
            path: self.path.clone(),
        })?;
        let payload =
            serde_json::to_vec_pretty(entries).map_err(|source| LibraryError::Parse {
                source,
                path: self.path.clone(),
            })?;
        file.write_all(&payload)
            .map_err(|source| LibraryError::Persist {
                source,
                path: self.path.clone(),
            })?;
        file.persist(&self.path)
            .map_err(|error| LibraryError::Persist {
                source: error.error,
                path: self.path.clone(),
            })?;
        Ok(())
    }
}
