//! Crate-wide error type.
//!
//! `SchedulerError` is the error surfaced at every public seam (`JobManager`,
//! `Store`, `WorkerPool`). Internal helpers that aggregate several unrelated
//! failure causes (sitemap bootstrap, task processing) work in
//! `anyhow::Result` and are converted at the boundary.

use uuid::Uuid;

use crate::types::JobStatus;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("job {0} not found")]
    JobNotFound(Uuid),

    #[error("task {0} not found")]
    TaskNotFound(Uuid),

    #[error("invalid job transition from {from:?} to {to:?}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("invalid job options: {0}")]
    InvalidJobOptions(String),

    #[error("operation cancelled")]
    Cancelled,
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
