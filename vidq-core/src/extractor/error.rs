use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractorError {
    #[error("extractor binary unavailable at {binary}: {detail}")]
    Unavailable { binary: PathBuf, detail: String },
    #[error("failed to spawn extractor: {0}")]
    Spawn(std::io::Error),
    #[error("metadata fetch failed: {0}")]
    Metadata(String),
    #[error("metadata response was not valid json: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("metadata fetch timed out after {0:?}")]
    Timeout(Duration),
}

pub type ExtractorResult<T> = Result<T, ExtractorError>;
