use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to read queue file {path}: {source}")]
    Open {
        source: io::Error,
        path: PathBuf,
    },
    #[error("failed to persist queue file {path}: {source}")]
    Persist {
        source: io::Error,
        path: PathBuf,
    },
    #[error("failed to parse queue file {path}: {source}")]
    Parse {
        source: serde_json::Error,
        path: PathBuf,
    },
    #[error("queue path not configured")]
    MissingStore,
    #[error("invalid queue status: {0}")]
    InvalidStatus(String),
    #[error("queue item not found: {0}")]
    NotFound(String),
    #[error("url already queued: {}", existing.url)]
    DuplicateUrl { existing: Box<QueueItem> },
}

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Downloading,
    Paused,
    Failed,
    Completed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Downloading => "downloading",
            QueueStatus::Paused => "paused",
            QueueStatus::Failed => "failed",
            QueueStatus::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Failed | QueueStatus::Completed)
    }
}

impl std::fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "downloading" => Ok(Self::Downloading),
            "paused" => Ok(Self::Paused),
            "failed" => Ok(Self::Failed),
            "completed" => Ok(Self::Completed),
            other => Err(QueueError::InvalidStatus(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub url: String,
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub status: QueueStatus,
    pub progress: u8,
    pub pid: Option<u32>,
    pub file_path: Option<String>,
    pub error: Option<String>,
    pub added_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl QueueItem {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            id: format!("q-{}", Uuid::new_v4()),
            url: url.into(),
            title: None,
            thumbnail: None,
            status: QueueStatus::Pending,
            progress: 0,
            pid: None,
            file_path: None,
            error: None,
            added_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_thumbnail(mut self, thumbnail: Option<String>) -> Self {
        self.thumbnail = thumbnail;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueSummary {
    pub total: usize,
    pub counts: HashMap<QueueStatus, usize>,
}

#[derive(Debug, Clone, Default)]
pub struct DownloadQueueStoreBuilder {
    path: Option<PathBuf>,
}

impl DownloadQueueStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn build(self) -> QueueResult<DownloadQueueStore> {
        let path = self.path.ok_or(QueueError::MissingStore)?;
        Ok(DownloadQueueStore {
            path,
            lock: Mutex::new(()),
        })
    }
}

#[derive(Debug)]
pub struct DownloadQueueStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl DownloadQueueStore {
    pub fn builder() -> DownloadQueueStoreBuilder {
        DownloadQueueStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> QueueResult<Self> {
        DownloadQueueStoreBuilder::new().path(path).build()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> QueueResult<Vec<QueueItem>> {
        let _guard = self.lock.lock().unwrap();
        self.read_items()
    }

    pub fn save(&self, items: &[QueueItem]) -> QueueResult<()> {
        let _guard = self.lock.lock().unwrap();
        self.write_items(items)
    }

    /// Reset items orphaned by a previous process: nothing can legitimately
    /// hold downloading/paused status across a restart.
    pub fn recover_on_startup(&self) -> QueueResult<usize> {
        let _guard = self.lock.lock().unwrap();
        let mut items = self.read_items()?;
        let mut recovered = 0;
        for item in &mut items {
            if matches!(item.status, QueueStatus::Downloading | QueueStatus::Paused) {
                item.status = QueueStatus::Pending;
                item.pid = None;
                item.progress = 0;
                recovered += 1;
            }
        }
        if recovered > 0 {
            self.write_items(&items)?;
        }
        Ok(recovered)
    }

    pub fn insert(&self, item: QueueItem) -> QueueResult<QueueItem> {
        let _guard = self.lock.lock().unwrap();
        let mut items = self.read_items()?;
        if let Some(existing) = items.iter().find(|candidate| candidate.url == item.url) {
            return Err(QueueError::DuplicateUrl {
                existing: Box::new(existing.clone()),
            });
        }
        items.push(item.clone());
        self.write_items(&items)?;
        Ok(item)
    }

    pub fn get(&self, id: &str) -> QueueResult<Option<QueueItem>> {
        let _guard = self.lock.lock().unwrap();
        let items = self.read_items()?;
        Ok(items.into_iter().find(|item| item.id == id))
    }

    pub fn find_by_url(&self, url: &str) -> QueueResult<Option<QueueItem>> {
        let _guard = self.lock.lock().unwrap();
        let items = self.read_items()?;
        Ok(items.into_iter().find(|item| item.url == url))
    }

    pub fn update_status(
        &self,
        id: &str,
        status: QueueStatus,
        error: Option<&str>,
    ) -> QueueResult<()> {
        self.mutate(id, |item| {
            item.status = status;
            item.error = error.map(str::to_string);
            if status.is_terminal() {
                item.completed_at = Some(Utc::now());
            }
        })
    }

    pub fn update_progress(&self, id: &str, percent: u8) -> QueueResult<()> {
        self.mutate(id, |item| {
            item.progress = percent.min(100);
        })
    }

    pub fn mark_started(&self, id: &str, pid: Option<u32>) -> QueueResult<()> {
        self.mutate(id, |item| {
            item.status = QueueStatus::Downloading;
            item.pid = pid;
            item.progress = 0;
            item.error = None;
            item.started_at = Some(Utc::now());
        })
    }

    pub fn mark_completed(&self, id: &str, file_path: &str, title: &str) -> QueueResult<()> {
        self.mutate(id, |item| {
            item.status = QueueStatus::Completed;
            item.progress = 100;
            item.pid = None;
            item.file_path = Some(file_path.to_string());
            item.title = Some(title.to_string());
            item.error = None;
            item.completed_at = Some(Utc::now());
        })
    }

    pub fn list(&self) -> QueueResult<Vec<QueueItem>> {
        self.load()
    }

    pub fn summary(&self) -> QueueResult<QueueSummary> {
        let items = self.load()?;
        let mut counts = HashMap::new();
        for item in &items {
            *counts.entry(item.status).or_insert(0) += 1;
        }
        Ok(QueueSummary {
            total: items.len(),
            counts,
        })
    }

    pub fn clear_all(&self) -> QueueResult<usize> {
        let _guard = self.lock.lock().unwrap();
        let items = self.read_items()?;
        let removed = items.len();
        self.write_items(&[])?;
        Ok(removed)
    }

    fn mutate<F>(&self, id: &str, apply: F) -> QueueResult<()>
    where
        F: FnOnce(&mut QueueItem),
    {
        let _guard = self.lock.lock().unwrap();
        let mut items = self.read_items()?;
        let item = items
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        apply(item);
        self.write_items(&items)
    }

    fn read_items(&self) -> QueueResult<Vec<QueueItem>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(QueueError::Open {
                    source,
                    path: self.path.clone(),
                })
            }
        };
        serde_json::from_str(&content).map_err(|source| QueueError::Parse {
            source,
            path: self.path.clone(),
        })
    }

    // Write-to-temp-then-rename so readers never observe a half-written file.
    fn write_items(&self, items: &[QueueItem]) -> QueueResult<()> {
        let parent = self
            .path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&parent).map_err(|source| QueueError::Persist {
            source,
            path: self.path.clone(),
        })?;
        let mut file = NamedTempFile::new_in(&parent).map_err(|source| QueueError::Persist {
            source,
            path: self.path.clone(),
        })?;
        let payload = serde_json::to_vec_pretty(items).map_err(|source| QueueError::Parse {
            source,
            path: self.path.clone(),
        })?;
        file.write_all(&payload).map_err(|source| QueueError::Persist {
            source,
            path: self.path.clone(),
        })?;
        file.persist(&self.path)
            .map_err(|error| QueueError::Persist {
                source: error.error,
                path: self.path.clone(),
            })?;
        Ok(())
    }
}
