//! Per-caller and global admission throttling over windowed counters.
//!
//! Each window is one counter row keyed by its time tag. Checks run
//! outermost first (global, then minute, hour, day); a later denial
//! refunds every window already charged, so a rejected request
//! consumes nothing.

use chrono::{Duration, Utc};

use pagebeat_common::config::ThrottleConfig;
use pagebeat_store::CounterStore;

pub const GLOBAL_MESSAGE: &str = "Global rate limit exceeded. Please try again later.";
pub const MINUTE_MESSAGE: &str = "Too many requests. Please try again later.";
pub const HOUR_MESSAGE: &str = "Hourly rate limit exceeded. Please try again later.";
pub const DAY_MESSAGE: &str = "Daily rate limit exceeded. Please try again tomorrow.";

pub struct Allowance {
    pub limit: i64,
    pub remaining: i64,
    pub reset_unix: i64,
}

/// The window that said no: its message, its limit, and when it rolls.
pub struct Denial {
    pub message: &'static str,
    pub limit: i64,
    pub reset_unix: i64,
}

impl Denial {
    pub fn retry_after_secs(&self) -> i64 {
        (self.reset_unix - Utc::now().timestamp()).max(1)
    }
}

pub enum ThrottleOutcome {
    Allowed(Allowance),
    Denied(Denial),
}

/// Charge one request against every window for `scope`.
pub async fn admit(
    counters: &dyn CounterStore,
    config: &ThrottleConfig,
    scope: &str,
) -> anyhow::Result<ThrottleOutcome> {
    let now = Utc::now();
    let unix = now.timestamp();
    let minute_tag = now.format("%Y-%m-%d-%H-%M").to_string();
    let hour_tag = now.format("%Y-%m-%d-%H").to_string();
    let day_tag = now.format("%Y-%m-%d").to_string();

    let global_key = format!("throttle:global:{minute_tag}");
    let minute_key = format!("throttle:{scope}:minute:{minute_tag}");
    let hour_key = format!("throttle:{scope}:hour:{hour_tag}");
    let day_key = format!("throttle:{scope}:day:{day_tag}");

    if counters
        .incr_below(&global_key, config.global_per_minute, now + Duration::minutes(2))
        .await?
        .is_none()
    {
        return Ok(ThrottleOutcome::Denied(Denial {
            message: GLOBAL_MESSAGE,
            limit: config.global_per_minute,
            reset_unix: window_reset(unix, 60),
        }));
    }

    let Some(minute_used) = counters
        .incr_below(&minute_key, config.per_minute, now + Duration::minutes(2))
        .await?
    else {
        counters.decr(&global_key).await?;
        return Ok(ThrottleOutcome::Denied(Denial {
            message: MINUTE_MESSAGE,
            limit: config.per_minute,
            reset_unix: window_reset(unix, 60),
        }));
    };

    if counters
        .incr_below(&hour_key, config.per_hour, now + Duration::hours(2))
        .await?
        .is_none()
    {
        counters.decr(&minute_key).await?;
        counters.decr(&global_key).await?;
        return Ok(ThrottleOutcome::Denied(Denial {
            message: HOUR_MESSAGE,
            limit: config.per_hour,
            reset_unix: window_reset(unix, 3600),
        }));
    }

    if counters
        .incr_below(&day_key, config.per_day, now + Duration::hours(25))
        .await?
        .is_none()
    {
        counters.decr(&hour_key).await?;
        counters.decr(&minute_key).await?;
        counters.decr(&global_key).await?;
        return Ok(ThrottleOutcome::Denied(Denial {
            message: DAY_MESSAGE,
            limit: config.per_day,
            reset_unix: window_reset(unix, 86400),
        }));
    }

    Ok(ThrottleOutcome::Allowed(Allowance {
        limit: config.per_minute,
        remaining: (config.per_minute - minute_used).max(0),
        reset_unix: window_reset(unix, 60),
    }))
}

fn window_reset(now_unix: i64, window_secs: i64) -> i64 {
    now_unix - now_unix.rem_euclid(window_secs) + window_secs
}
