use thiserror::Error;

pub type Result<T> = std::result::Result<T, PageSpeedError>;

#[derive(Debug, Error)]
pub enum PageSpeedError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Parse error: {0}")]
    Parse(String),
}

impl From<reqwest::Error> for PageSpeedError {
    fn from(err: reqwest::Error) -> Self {
        PageSpeedError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for PageSpeedError {
    fn from(err: serde_json::Error) -> Self {
        PageSpeedError::Parse(err.to_string())
    }
}
