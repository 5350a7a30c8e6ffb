pub mod config;
pub mod error;
pub mod extractor;
pub mod jobs;
pub mod library;
pub mod orchestrator;
pub mod progress;
pub mod queue;

pub use config::{
    load_vidq_config, DownloadSection, ExtractorSection, PathsSection, SystemSection, VidqConfig,
};
pub use error::{ConfigError, Result};
pub use extractor::{
    ExtractorError, ExtractorResult, FetchEvent, FetchHandle, FetchPlan, MediaExtractor,
    MediaMetadata, ProcessControl, YtDlpExtractor,
};
pub use jobs::{ActiveJob, CancelOutcome, DownloadRegistry, JobError, JobRecord, JobResult};
pub use library::{LibraryEntry, LibraryError, LibraryResult, VideoLibrary};
pub use orchestrator::{
    sanitize_title, DownloadEvent, DownloadPolicy, DownloadRequest, DownloadStream, Orchestrator,
    OrchestratorError, OrchestratorResult, QueueRunReport, MEDIA_EXTENSIONS,
};
pub use progress::{ProgressNormalizer, ProgressUpdate, Stage};
pub use queue::{
    DownloadQueueStore, DownloadQueueStoreBuilder, QueueError, QueueItem, QueueResult,
    QueueStatus, QueueSummary,
};
