//! Upstream quota governor for the PageSpeed API.
//!
//! Google enforces per-minute and per-day ceilings. The governor spends a
//! unit from both windows before a call is allowed; a denied window means
//! the job is deferred, not failed, since waiting out the window is all
//! it takes.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::warn;

use pagebeat_common::config::QuotaConfig;
use pagebeat_store::CounterStore;

use crate::error::StageError;

const MINUTE_KEY_TTL_SECS: i64 = 120;

pub struct QuotaGovernor {
    counters: Arc<dyn CounterStore>,
    config: QuotaConfig,
}

impl QuotaGovernor {
    pub fn new(counters: Arc<dyn CounterStore>, config: QuotaConfig) -> Self {
        Self { counters, config }
    }

    /// Spend one unit of minute and day quota, or say why not. A denial
    /// leaves both windows exactly as they were.
    pub async fn admit(&self) -> Result<(), StageError> {
        let now = Utc::now();
        let minute_key = format!("pagespeed:quota:minute:{}", now.format("%Y%m%d%H%M"));
        let day_key = format!("pagespeed:quota:day:{}", now.format("%Y%m%d"));

        let minute = self
            .counters
            .incr_below(
                &minute_key,
                self.config.per_minute,
                now + Duration::seconds(MINUTE_KEY_TTL_SECS),
            )
            .await?;
        let Some(minute_used) = minute else {
            return Err(StageError::QuotaExceeded(
                "PageSpeed API minute quota exceeded. Please try again later.".to_string(),
            ));
        };
        if nearing_limit(minute_used, self.config.per_minute, self.config.warn_fraction) {
            warn!(
                window = "minute",
                used = minute_used,
                limit = self.config.per_minute,
                "PageSpeed API quota usage high"
            );
        }

        let day = self
            .counters
            .incr_below(&day_key, self.config.per_day, now + Duration::days(1))
            .await?;
        let Some(day_used) = day else {
            // The minute unit was already spent; hand it back.
            self.counters.decr(&minute_key).await?;
            return Err(StageError::QuotaExceeded(
                "PageSpeed API daily quota exceeded. Please try again tomorrow.".to_string(),
            ));
        };

        if nearing_limit(day_used, self.config.per_day, self.config.warn_fraction) {
            warn!(
                window = "day",
                used = day_used,
                limit = self.config.per_day,
                "PageSpeed API quota usage high"
            );
        }

        Ok(())
    }
}

/// True once a window's usage reaches the warning fraction of its budget.
fn nearing_limit(used: i64, limit: i64, fraction: f64) -> bool {
    used as f64 >= limit as f64 * fraction
}
