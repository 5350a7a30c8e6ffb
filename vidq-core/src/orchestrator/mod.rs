mod error;
mod types;

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use crate::extractor::{FetchEvent, FetchHandle, FetchPlan, MediaExtractor, MediaMetadata};
use crate::jobs::{ActiveJob, CancelOutcome, DownloadRegistry};
use crate::library::{LibraryEntry, VideoLibrary};
use crate::progress::ProgressNormalizer;
use crate::queue::{DownloadQueueStore, QueueError, QueueItem, QueueStatus};

pub use error::{OrchestratorError, OrchestratorResult};
pub use types::{
    DownloadEvent, DownloadPolicy, DownloadRequest, DownloadStream, QueueRunReport,
};

pub const MEDIA_EXTENSIONS: &[&str] = &["mp4", "webm", "mkv", "m4a"];

const EVENT_CHANNEL_CAPACITY: usize = 32;
const DIAGNOSTIC_TAIL: usize = 12;
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Characters rejected by at least one supported filesystem.
const FORBIDDEN_FILENAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

pub fn sanitize_title(title: &str) -> String {
    let sanitized: String = title
        .chars()
        .map(|c| {
            if FORBIDDEN_FILENAME_CHARS.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect();
    let trimmed = sanitized.trim();
    if trimmed.is_empty() {
        "download".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Drives the per-job state machine: metadata fetch, slot reservation,
/// process spawn, progress streaming, timeout enforcement, terminal
/// resolution, and queue mirroring. One instance supervises any number of
/// concurrent jobs.
#[derive(Clone)]
pub struct Orchestrator {
    extractor: Arc<dyn MediaExtractor>,
    registry: Arc<DownloadRegistry>,
    queue: Arc<DownloadQueueStore>,
    library: Arc<VideoLibrary>,
    media_dir: PathBuf,
    failure_log: Option<PathBuf>,
    policy: DownloadPolicy,
}

enum DrainOutcome {
    Completed,
    Failed,
    Cancelled,
}

impl Orchestrator {
    pub fn new(
        extractor: Arc<dyn MediaExtractor>,
        registry: Arc<DownloadRegistry>,
        queue: Arc<DownloadQueueStore>,
        library: Arc<VideoLibrary>,
        media_dir: impl AsRef<Path>,
        policy: DownloadPolicy,
    ) -> Self {
        Self {
            extractor,
            registry,
            queue,
            library,
            media_dir: media_dir.as_ref().to_path_buf(),
            failure_log: None,
            policy,
        }
    }

    pub fn with_failure_log(mut self, path: impl AsRef<Path>) -> Self {
        self.failure_log = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn queue_store(&self) -> &DownloadQueueStore {
        &self.queue
    }

    pub fn library(&self) -> &VideoLibrary {
        &self.library
    }

    /// Accepts a download request and returns its event stream. Validation
    /// failures are returned immediately; everything after that surfaces as
    /// events. The job runs detached from the returned stream.
    pub fn start(&self, request: DownloadRequest) -> OrchestratorResult<DownloadStream> {
        let url = request.url.trim().to_string();
        if url.is_empty() {
            return Err(OrchestratorError::MissingUrl);
        }
        Url::parse(&url).map_err(|err| OrchestratorError::InvalidUrl {
            url: url.clone(),
            reason: err.to_string(),
        })?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let this = self.clone();
        let correlation_id = request.correlation_id;
        tokio::spawn(async move {
            this.run_job(url, correlation_id, tx).await;
        });
        Ok(DownloadStream::new(rx))
    }

    pub fn active_jobs(&self) -> Vec<ActiveJob> {
        self.registry.active()
    }

    /// Always acknowledges; the caller cannot distinguish "already finished"
    /// from "not started yet", and a not-found answer would let a cancelled
    /// job run to completion.
    pub fn cancel(&self, job_id: &str) -> CancelOutcome {
        let outcome = self.registry.cancel(job_id);
        info!(job_id = %job_id, outcome = ?outcome, "cancellation requested");
        outcome
    }

    /// Runs recovery, then drains every pending queue item through the job
    /// state machine with bounded concurrency.
    pub async fn run_pending(&self) -> OrchestratorResult<QueueRunReport> {
        let recovered = self.queue.recover_on_startup()?;
        if recovered > 0 {
            info!(recovered, "requeued orphaned downloads");
        }
        let pending: Vec<QueueItem> = self
            .queue
            .list()?
            .into_iter()
            .filter(|item| item.status == QueueStatus::Pending)
            .collect();
        let attempted = pending.len();

        let outcomes = futures::stream::iter(pending)
            .map(|item| {
                let this = self.clone();
                async move { this.drain_one(item).await }
            })
            .buffer_unordered(self.policy.max_concurrent.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut report = QueueRunReport {
            recovered,
            attempted,
            ..QueueRunReport::default()
        };
        for outcome in outcomes {
            match outcome {
                DrainOutcome::Completed => report.completed += 1,
                DrainOutcome::Failed => report.failed += 1,
                DrainOutcome::Cancelled => report.cancelled += 1,
            }
        }
        Ok(report)
    }

    async fn drain_one(&self, item: QueueItem) -> DrainOutcome {
        let mut stream = match self.start(DownloadRequest::new(item.url.clone())) {
            Ok(stream) => stream,
            Err(err) => {
                warn!(url = %item.url, error = %err, "queued url rejected");
                if let Err(err) =
                    self.queue
                        .update_status(&item.id, QueueStatus::Failed, Some(&err.to_string()))
                {
                    warn!(queue_id = %item.id, error = %err, "failed to record rejection");
                }
                return DrainOutcome::Failed;
            }
        };
        let mut outcome = DrainOutcome::Failed;
        while let Some(event) = stream.recv().await {
            match event {
                DownloadEvent::Done { .. } => outcome = DrainOutcome::Completed,
                DownloadEvent::Error { .. } => outcome = DrainOutcome::Failed,
                DownloadEvent::Cancelled { .. } => outcome = DrainOutcome::Cancelled,
                _ => {}
            }
        }
        outcome
    }

    async fn run_job(
        &self,
        url: String,
        correlation_id: Option<String>,
        tx: mpsc::Sender<DownloadEvent>,
    ) {
        let job_id = correlation_id
            .clone()
            .unwrap_or_else(|| format!("dl-{}", Uuid::new_v4()));
        let _ = tx
            .send(DownloadEvent::Started {
                job_id: job_id.clone(),
                url: url.clone(),
            })
            .await;

        let metadata = match self.extractor.fetch_metadata(&url).await {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(job_id = %job_id, url = %url, error = %err, "metadata fetch failed");
                let _ = tx
                    .send(DownloadEvent::Error {
                        message: format!("failed to fetch metadata: {err}"),
                        exit_code: None,
                        retryable: true,
                    })
                    .await;
                return;
            }
        };

        if let Err(err) = self.registry.reserve(&job_id, &url) {
            let _ = tx
                .send(DownloadEvent::Error {
                    message: err.to_string(),
                    exit_code: None,
                    retryable: false,
                })
                .await;
            return;
        }

        // Cancellation checkpoint between reservation and spawn.
        if self.registry.is_cancelled(&job_id) {
            info!(job_id = %job_id, "job cancelled before start");
            self.registry.remove(&job_id);
            let _ = tx.send(DownloadEvent::Cancelled { job_id }).await;
            return;
        }

        let queue_id = self.ensure_queue_item(&url, &metadata);
        let sanitized = sanitize_title(&metadata.title);

        if let Err(err) = tokio::fs::create_dir_all(&self.media_dir).await {
            error!(job_id = %job_id, path = %self.media_dir.display(), error = %err, "failed to prepare media directory");
            self.registry.remove(&job_id);
            let message = format!("failed to prepare media directory: {err}");
            self.mark_failed(&job_id, queue_id.as_deref(), &message);
            let _ = tx
                .send(DownloadEvent::Error {
                    message,
                    exit_code: None,
                    retryable: false,
                })
                .await;
            return;
        }

        let plan = FetchPlan {
            url: url.clone(),
            output_template: self
                .media_dir
                .join(format!("{sanitized}.%(ext)s"))
                .to_string_lossy()
                .to_string(),
            max_height: self.policy.max_height,
            container: self.policy.container.clone(),
            retries: self.policy.retries,
            fragment_retries: self.policy.fragment_retries,
        };

        let started = SystemTime::now();
        let mut handle = match self.extractor.spawn_fetch(&plan).await {
            Ok(handle) => handle,
            Err(err) => {
                error!(job_id = %job_id, error = %err, "failed to spawn fetch process");
                self.registry.remove(&job_id);
                let message = format!("failed to start download: {err}");
                self.mark_failed(&job_id, queue_id.as_deref(), &message);
                let _ = tx
                    .send(DownloadEvent::Error {
                        message,
                        exit_code: None,
                        retryable: false,
                    })
                    .await;
                return;
            }
        };

        if self
            .registry
            .attach_process(&job_id, handle.control.clone())
            .is_err()
        {
            // Record vanished between reservation and spawn: a concurrent
            // cancel tore it down, so the fresh process is ours to kill.
            info!(job_id = %job_id, "job cancelled during spawn");
            handle.control.kill();
            self.mark_failed(&job_id, queue_id.as_deref(), "download cancelled");
            let _ = tx.send(DownloadEvent::Cancelled { job_id }).await;
            return;
        }

        // A cancel that slipped in after the pre-spawn checkpoint left only
        // the flag behind; the process is attached now, so deliver the kill.
        if self.registry.is_cancelled(&job_id) {
            handle.control.kill();
        }

        if let Some(id) = &queue_id {
            if let Err(err) = self.queue.mark_started(id, handle.control.pid()) {
                warn!(queue_id = %id, error = %err, "failed to mark queue item started");
            }
        }
        info!(job_id = %job_id, url = %url, title = %metadata.title, "download running");

        let (exit_code, timed_out, diagnostics) = self
            .supervise_events(&job_id, &mut handle, queue_id.as_deref(), &tx)
            .await;

        let cancelled = self.registry.is_cancelled(&job_id);
        self.registry.remove(&job_id);

        if cancelled {
            info!(job_id = %job_id, "download cancelled");
            self.mark_failed(&job_id, queue_id.as_deref(), "download cancelled");
            let _ = tx.send(DownloadEvent::Cancelled { job_id }).await;
            return;
        }

        if timed_out {
            let message = format!(
                "download timed out after {}s",
                self.policy.job_timeout.as_secs()
            );
            warn!(job_id = %job_id, "{message}");
            self.mark_failed(&job_id, queue_id.as_deref(), &message);
            let _ = tx
                .send(DownloadEvent::Error {
                    message,
                    exit_code: None,
                    retryable: true,
                })
                .await;
            return;
        }

        match exit_code {
            Some(0) => match self.locate_output(&sanitized, started) {
                Some(file_path) => {
                    info!(job_id = %job_id, file = %file_path.display(), "download completed");
                    self.complete(queue_id.as_deref(), &file_path, &metadata.title, &url);
                    let _ = tx
                        .send(DownloadEvent::Done {
                            file_path,
                            title: metadata.title,
                        })
                        .await;
                }
                None => {
                    let message = "output file not found".to_string();
                    warn!(job_id = %job_id, "{message}");
                    self.mark_failed(&job_id, queue_id.as_deref(), &message);
                    let _ = tx
                        .send(DownloadEvent::Error {
                            message,
                            exit_code: Some(0),
                            retryable: false,
                        })
                        .await;
                }
            },
            Some(code) => {
                let mut message = format!("download failed (exit code {code})");
                if let Some(line) = diagnostics.last() {
                    message.push_str(": ");
                    message.push_str(line);
                }
                warn!(job_id = %job_id, exit_code = code, "download failed");
                self.mark_failed(&job_id, queue_id.as_deref(), &message);
                let _ = tx
                    .send(DownloadEvent::Error {
                        message,
                        exit_code: Some(code),
                        retryable: correlation_id.is_some(),
                    })
                    .await;
            }
            None => {
                let message = "download process terminated abnormally".to_string();
                warn!(job_id = %job_id, "{message}");
                self.mark_failed(&job_id, queue_id.as_deref(), &message);
                let _ = tx
                    .send(DownloadEvent::Error {
                        message,
                        exit_code: None,
                        retryable: true,
                    })
                    .await;
            }
        }
    }

    async fn supervise_events(
        &self,
        job_id: &str,
        handle: &mut FetchHandle,
        queue_id: Option<&str>,
        tx: &mpsc::Sender<DownloadEvent>,
    ) -> (Option<i32>, bool, Vec<String>) {
        let events = &mut handle.events;
        let control = handle.control.clone();
        let mut normalizer = ProgressNormalizer::new();
        let mut diagnostics: VecDeque<String> = VecDeque::with_capacity(DIAGNOSTIC_TAIL);
        let mut timed_out = false;
        let mut last_progress = Instant::now();

        let deadline = tokio::time::sleep(self.policy.job_timeout);
        tokio::pin!(deadline);
        let mut stall_ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.policy.stall_warning,
            self.policy.stall_warning,
        );

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(FetchEvent::Progress { raw_percent, stage_hint }) => {
                        last_progress = Instant::now();
                        let update = normalizer.normalize(raw_percent, stage_hint);
                        if let Some(id) = queue_id {
                            if let Err(err) = self.queue.update_progress(id, update.percent) {
                                debug!(job_id = %job_id, error = %err, "failed to mirror progress into queue");
                            }
                        }
                        // A closed receiver means the caller went away; the
                        // job keeps running regardless.
                        let _ = tx
                            .send(DownloadEvent::Progress {
                                percent: update.percent,
                                label: update.label,
                            })
                            .await;
                    }
                    Some(FetchEvent::Diagnostic(line)) => {
                        normalizer.observe_line(&line);
                        debug!(job_id = %job_id, line = %line, "extractor diagnostic");
                        if diagnostics.len() == DIAGNOSTIC_TAIL {
                            diagnostics.pop_front();
                        }
                        diagnostics.push_back(line);
                    }
                    Some(FetchEvent::Exit(code)) => {
                        return (code, timed_out, diagnostics.into_iter().collect());
                    }
                    None => {
                        return (None, timed_out, diagnostics.into_iter().collect());
                    }
                },
                _ = &mut deadline => {
                    if timed_out {
                        // The kill grace elapsed without an exit event.
                        return (None, true, diagnostics.into_iter().collect());
                    }
                    warn!(
                        job_id = %job_id,
                        timeout_s = self.policy.job_timeout.as_secs(),
                        "download exceeded timeout, killing process"
                    );
                    control.kill();
                    timed_out = true;
                    deadline.as_mut().reset(tokio::time::Instant::now() + KILL_GRACE);
                }
                _ = stall_ticker.tick() => {
                    if last_progress.elapsed() >= self.policy.stall_warning {
                        warn!(
                            job_id = %job_id,
                            stalled_s = last_progress.elapsed().as_secs(),
                            "no progress observed"
                        );
                    }
                }
            }
        }
    }

    fn ensure_queue_item(&self, url: &str, metadata: &MediaMetadata) -> Option<String> {
        let item = QueueItem::new(url)
            .with_title(metadata.title.as_str())
            .with_thumbnail(metadata.thumbnail.clone());
        match self.queue.insert(item) {
            Ok(item) => Some(item.id),
            Err(QueueError::DuplicateUrl { existing }) => Some(existing.id),
            Err(err) => {
                warn!(url, error = %err, "failed to track download in queue");
                None
            }
        }
    }

    fn mark_failed(&self, job_id: &str, queue_id: Option<&str>, message: &str) {
        self.log_failure(job_id, message);
        if let Some(id) = queue_id {
            if let Err(err) = self
                .queue
                .update_status(id, QueueStatus::Failed, Some(message))
            {
                warn!(queue_id = %id, error = %err, "failed to record failure in queue");
            }
        }
    }

    fn log_failure(&self, job_id: &str, message: &str) {
        let Some(path) = &self.failure_log else {
            return;
        };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(file, "{} [{}] {}", Utc::now().to_rfc3339(), job_id, message);
        }
    }

    fn complete(&self, queue_id: Option<&str>, file_path: &Path, title: &str, url: &str) {
        if let Some(id) = queue_id {
            if let Err(err) =
                self.queue
                    .mark_completed(id, &file_path.to_string_lossy(), title)
            {
                warn!(queue_id = %id, error = %err, "failed to record completion in queue");
            }
        }
        let entry = LibraryEntry {
            title: title.to_string(),
            description: format!("Downloaded from {url}"),
            file_path: file_path.to_string_lossy().to_string(),
        };
        if let Err(err) = self.library.record(entry) {
            // Library is a convenience index; a failed append never fails the job.
            warn!(error = %err, "failed to append to video library");
        }
    }

    /// Locates the produced file: exact sanitized-prefix match first, then
    /// the newest media file modified after the job started (covers
    /// filename transliteration applied by the tool).
    fn locate_output(&self, sanitized: &str, started: SystemTime) -> Option<PathBuf> {
        let entries = std::fs::read_dir(&self.media_dir).ok()?;
        let mut prefix_matches: Vec<(SystemTime, PathBuf)> = Vec::new();
        let mut recent: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(extension) = path.extension().and_then(|ext| ext.to_str()) else {
                continue;
            };
            if !MEDIA_EXTENSIONS.contains(&extension.to_ascii_lowercase().as_str()) {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|meta| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default();
            if name.starts_with(sanitized) {
                prefix_matches.push((modified, path));
            } else if modified >= started {
                recent.push((modified, path));
            }
        }
        prefix_matches
            .into_iter()
            .max_by_key(|(modified, _)| *modified)
            .or_else(|| recent.into_iter().max_by_key(|(modified, _)| *modified))
            .map(|(_, path)| path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_replaces_forbidden_characters() {
        assert_eq!(sanitize_title("a/b\\c:d*e?f\"g<h>i|j"), "a_b_c_d_e_f_g_h_i_j");
    }

    #[test]
    fn sanitize_keeps_ordinary_titles() {
        assert_eq!(sanitize_title("Sample Video 01"), "Sample Video 01");
    }

    #[test]
    fn sanitize_never_returns_empty() {
        assert_eq!(sanitize_title("???"), "___");
        assert_eq!(sanitize_title("   "), "download");
    }
}
