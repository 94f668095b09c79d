use browserless_client::BrowserlessError;
use pagespeed_client::PageSpeedError;

/// How a stage run ended, from the worker's point of view. The variant
/// decides scheduling: deferrals reschedule without charging the
/// attempt, retryables charge it and back off, permanents stop the job.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// Upstream capacity is exhausted.
    #[error("{0}")]
    QuotaExceeded(String),

    /// Another worker holds the resource this stage needs.
    #[error("{0}")]
    Busy(String),

    /// Transient failure worth another attempt.
    #[error(transparent)]
    Retryable(anyhow::Error),

    /// No retry will change the outcome.
    #[error(transparent)]
    Permanent(anyhow::Error),
}

impl StageError {
    pub fn retryable(err: impl Into<anyhow::Error>) -> Self {
        Self::Retryable(err.into())
    }

    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        Self::Permanent(err.into())
    }
}

/// Store and filesystem errors are treated as transient: the database
/// or disk being briefly unavailable should not burn an audit.
impl From<anyhow::Error> for StageError {
    fn from(err: anyhow::Error) -> Self {
        Self::Retryable(err)
    }
}

impl From<PageSpeedError> for StageError {
    fn from(err: PageSpeedError) -> Self {
        match &err {
            PageSpeedError::Api { status: 429, .. } => {
                Self::QuotaExceeded("PageSpeed API rate limited upstream".to_string())
            }
            // A 4xx means the target page itself cannot be analyzed.
            PageSpeedError::Api { status, .. } if (400..500).contains(status) => {
                Self::Permanent(err.into())
            }
            _ => Self::Retryable(err.into()),
        }
    }
}

impl From<BrowserlessError> for StageError {
    fn from(err: BrowserlessError) -> Self {
        match &err {
            BrowserlessError::Api { status, .. } if (400..500).contains(status) && *status != 429 => {
                Self::Permanent(err.into())
            }
            _ => Self::Retryable(err.into()),
        }
    }
}

pub type StageResult<T> = std::result::Result<T, StageError>;
