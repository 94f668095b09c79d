use thiserror::Error;

#[derive(Error, Debug)]
pub enum PagebeatError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Quota error: {0}")]
    Quota(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl PagebeatError {
    /// The bare message, without the variant prefix. Validation messages
    /// surface verbatim in 422 responses.
    pub fn message(&self) -> String {
        match self {
            PagebeatError::Database(m)
            | PagebeatError::Validation(m)
            | PagebeatError::Quota(m) => m.clone(),
            PagebeatError::Anyhow(e) => e.to_string(),
        }
    }
}
