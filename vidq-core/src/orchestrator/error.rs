use thiserror::Error;

use crate::queue::QueueError;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("url is required")]
    MissingUrl,
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
