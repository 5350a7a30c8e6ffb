use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::VidqConfig;

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub correlation_id: Option<String>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// Events pushed to the caller of a single download. `Started` comes first,
/// then zero or more `Progress` events with non-decreasing percent, then
/// exactly one terminal event: `Done`, `Error`, or `Cancelled`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DownloadEvent {
    Started {
        job_id: String,
        url: String,
    },
    Progress {
        percent: u8,
        label: String,
    },
    Done {
        file_path: PathBuf,
        title: String,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        retryable: bool,
    },
    Cancelled {
        job_id: String,
    },
}

impl DownloadEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadEvent::Done { .. }
                | DownloadEvent::Error { .. }
                | DownloadEvent::Cancelled { .. }
        )
    }
}

/// Receiving half of a job's event stream. Dropping it detaches the caller
/// without stopping the job; only an explicit cancellation does that.
#[derive(Debug)]
pub struct DownloadStream {
    receiver: mpsc::Receiver<DownloadEvent>,
}

impl DownloadStream {
    pub(crate) fn new(receiver: mpsc::Receiver<DownloadEvent>) -> Self {
        Self { receiver }
    }

    pub async fn recv(&mut self) -> Option<DownloadEvent> {
        self.receiver.recv().await
    }

    pub fn into_stream(self) -> ReceiverStream<DownloadEvent> {
        ReceiverStream::new(self.receiver)
    }
}

#[derive(Debug, Clone)]
pub struct DownloadPolicy {
    pub job_timeout: Duration,
    pub stall_warning: Duration,
    pub max_height: u32,
    pub container: String,
    pub retries: u32,
    pub fragment_retries: u32,
    pub max_concurrent: usize,
}

impl DownloadPolicy {
    pub fn from_config(config: &VidqConfig) -> Self {
        Self {
            job_timeout: Duration::from_secs(config.download.timeout_seconds),
            stall_warning: Duration::from_secs(config.download.stall_warning_seconds),
            max_height: config.download.max_height,
            container: config.download.container.clone(),
            retries: config.extractor.retries,
            fragment_retries: config.extractor.fragment_retries,
            max_concurrent: config.download.max_concurrent,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueRunReport {
    pub recovered: usize,
    pub attempted: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}
