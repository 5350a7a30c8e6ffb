use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::extractor::ProcessControl;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("job already active: {0}")]
    DuplicateJob(String),
    #[error("job not found: {0}")]
    NotFound(String),
}

pub type JobResult<T> = Result<T, JobError>;

pub struct JobRecord {
    pub job_id: String,
    pub url: String,
    pub started_at: DateTime<Utc>,
    pub cancelled: bool,
    pub process: Option<Arc<dyn ProcessControl>>,
}

impl fmt::Debug for JobRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRecord")
            .field("job_id", &self.job_id)
            .field("url", &self.url)
            .field("started_at", &self.started_at)
            .field("cancelled", &self.cancelled)
            .field("has_process", &self.process.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveJob {
    pub id: String,
    pub url: String,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: i64,
}

/// How a cancellation request was absorbed. Every variant is an
/// acknowledgment; the caller cannot distinguish "already finished" from
/// "not started yet", so an unknown id is never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Running process was killed and the record removed.
    Killed,
    /// Record existed without a process yet; flagged for the startup path.
    Flagged,
    /// Unknown id recorded so a future reservation aborts before spawning.
    Deferred,
}

#[derive(Default)]
struct RegistryState {
    jobs: HashMap<String, JobRecord>,
    pending_cancellations: HashSet<String>,
}

/// In-memory table of active download jobs plus the pending-cancellation
/// set. Both live under one mutex so a reserve can never interleave with a
/// cancel for the same id. Nothing here is persisted; orphaned durable
/// state is the queue store's recovery problem.
#[derive(Default)]
pub struct DownloadRegistry {
    inner: Mutex<RegistryState>,
}

impl DownloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&self, job_id: &str, url: &str) -> JobResult<()> {
        let mut state = self.inner.lock().unwrap();
        if state.jobs.contains_key(job_id) {
            return Err(JobError::DuplicateJob(job_id.to_string()));
        }
        let cancelled = state.pending_cancellations.remove(job_id);
        state.jobs.insert(
            job_id.to_string(),
            JobRecord {
                job_id: job_id.to_string(),
                url: url.to_string(),
                started_at: Utc::now(),
                cancelled,
                process: None,
            },
        );
        Ok(())
    }

    pub fn attach_process(
        &self,
        job_id: &str,
        control: Arc<dyn ProcessControl>,
    ) -> JobResult<()> {
        let mut state = self.inner.lock().unwrap();
        match state.jobs.get_mut(job_id) {
            Some(record) => {
                record.process = Some(control);
                Ok(())
            }
            None => Err(JobError::NotFound(job_id.to_string())),
        }
    }

    /// True when the job was flagged, or when its record is already gone —
    /// a missing record mid-lifecycle means a cancel tore it down.
    pub fn is_cancelled(&self, job_id: &str) -> bool {
        let state = self.inner.lock().unwrap();
        state
            .jobs
            .get(job_id)
            .map(|record| record.cancelled)
            .unwrap_or(true)
    }

    pub fn remove(&self, job_id: &str) {
        let mut state = self.inner.lock().unwrap();
        state.jobs.remove(job_id);
    }

    pub fn cancel(&self, job_id: &str) -> CancelOutcome {
        let mut state = self.inner.lock().unwrap();
        if let Some(record) = state.jobs.get_mut(job_id) {
            record.cancelled = true;
            if let Some(control) = record.process.take() {
                control.kill();
                state.jobs.remove(job_id);
                return CancelOutcome::Killed;
            }
            return CancelOutcome::Flagged;
        }
        debug!(job_id, "cancellation deferred for unknown job");
        state.pending_cancellations.insert(job_id.to_string());
        CancelOutcome::Deferred
    }

    pub fn active(&self) -> Vec<ActiveJob> {
        let state = self.inner.lock().unwrap();
        let now = Utc::now();
        let mut jobs: Vec<ActiveJob> = state
            .jobs
            .values()
            .map(|record| ActiveJob {
                id: record.job_id.clone(),
                url: record.url.clone(),
                started_at: record.started_at,
                duration_seconds: (now - record.started_at).num_seconds().max(0),
            })
            .collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        jobs
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct NoopControl {
        killed: AtomicBool,
    }

    impl ProcessControl for NoopControl {
        fn kill(&self) {
            self.killed.store(true, Ordering::SeqCst);
        }

        fn pid(&self) -> Option<u32> {
            Some(101)
        }
    }

    #[test]
    fn reserve_rejects_duplicate_ids() {
        let registry = DownloadRegistry::new();
        registry.reserve("dl-1", "https://example.test/a").unwrap();
        let err = registry
            .reserve("dl-1", "https://example.test/a")
            .unwrap_err();
        assert!(matches!(err, JobError::DuplicateJob(_)));
    }

    #[test]
    fn cancel_before_reserve_flags_the_reservation() {
        let registry = DownloadRegistry::new();
        assert_eq!(registry.cancel("dl-2"), CancelOutcome::Deferred);
        registry.reserve("dl-2", "https://example.test/b").unwrap();
        assert!(registry.is_cancelled("dl-2"));
    }

    #[test]
    fn cancel_with_running_process_kills_and_removes() {
        let registry = DownloadRegistry::new();
        registry.reserve("dl-3", "https://example.test/c").unwrap();
        let control = Arc::new(NoopControl {
            killed: AtomicBool::new(false),
        });
        registry.attach_process("dl-3", control.clone()).unwrap();
        assert_eq!(registry.cancel("dl-3"), CancelOutcome::Killed);
        assert!(control.killed.load(Ordering::SeqCst));
        assert!(registry.is_empty());
    }

    #[test]
    fn attach_after_removal_reports_not_found() {
        let registry = DownloadRegistry::new();
        registry.reserve("dl-4", "https://example.test/d").unwrap();
        registry.remove("dl-4");
        let control = Arc::new(NoopControl {
            killed: AtomicBool::new(false),
        });
        let err = registry.attach_process("dl-4", control).unwrap_err();
        assert!(matches!(err, JobError::NotFound(_)));
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = DownloadRegistry::new();
        registry.remove("never-existed");
        registry.reserve("dl-5", "https://example.test/e").unwrap();
        registry.remove("dl-5");
        registry.remove("dl-5");
        assert!(registry.is_empty());
    }
}
