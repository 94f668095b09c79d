pub mod config;
pub mod error;
pub mod metrics;
pub mod safe_url;
pub mod score;
pub mod types;

pub use config::Config;
pub use error::PagebeatError;
pub use metrics::MetricValue;
pub use safe_url::SafeUrl;
pub use score::Score;
pub use types::*;
