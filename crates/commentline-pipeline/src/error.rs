//! Run-level failures and exit statuses

use commentline_core::{RetryError, ServiceError};

/// Process-facing result of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    /// Quota ran out; the checkpoint is consistent and a later run resumes
    QuotaPaused,
    Failed,
}

impl ExitStatus {
    /// 0, 75 (EX_TEMPFAIL) or 1
    pub fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::QuotaPaused => 75,
            Self::Failed => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::QuotaPaused => "QUOTA_PAUSED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run ended in `FAILED`.
#[derive(Debug)]
pub enum PipelineError {
    FetchFailed {
        page: String,
        error: RetryError<ServiceError>,
    },
    AnnotationFailed {
        page: String,
        batch: usize,
        error: RetryError<ServiceError>,
    },
    WriteFailed {
        page: String,
        error: RetryError<ServiceError>,
    },
    Checkpoint(anyhow::Error),
    /// A stage thread could not be spawned or panicked
    Worker(String),
    Cancelled,
}

impl PipelineError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::FetchFailed { error, .. }
            | Self::AnnotationFailed { error, .. }
            | Self::WriteFailed { error, .. } => matches!(
                error,
                RetryError::Cancelled | RetryError::Fatal(ServiceError::Cancelled)
            ),
            _ => false,
        }
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::FetchFailed { page, error } => write!(f, "fetching page {page} failed: {error}"),
            Self::AnnotationFailed { page, batch, error } => {
                write!(f, "annotating page {page} batch {batch} failed: {error}")
            }
            Self::WriteFailed { page, error } => write!(f, "storing page {page} failed: {error}"),
            Self::Checkpoint(e) => write!(f, "checkpoint update failed: {e:#}"),
            Self::Worker(m) => write!(f, "worker thread failed: {m}"),
            Self::Cancelled => f.write_str("cancelled"),
        }
    }
}

impl std::error::Error for PipelineError {}
