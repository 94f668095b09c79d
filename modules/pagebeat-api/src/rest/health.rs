use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{Duration, Utc};
use tracing::warn;
use uuid::Uuid;

use crate::AppState;

const DB_SLOW_MS: u128 = 100;
const CACHE_SLOW_MS: u128 = 50;
const QUEUE_DEPTH_WARNING: i64 = 100;
const FAILED_JOBS_WARNING: i64 = 10;
const DISK_WARNING_PERCENT: u8 = 80;
const DISK_CRITICAL_PERCENT: u8 = 90;

/// Aggregated liveness: individual checks plus the operational numbers
/// an on-call responder wants first. 503 when any check is failing.
pub async fn api_health(State(state): State<Arc<AppState>>) -> Response {
    let database = check_database(&state).await;
    let cache = check_cache(&state).await;

    let queue_depth = state.deps.jobs.queue_depth().await.unwrap_or(-1);
    let failed_last_hour = state.deps.jobs.failed_last_hour().await.unwrap_or(-1);
    let queue = if queue_depth < 0 || failed_last_hour < 0 {
        "fail"
    } else if queue_depth > QUEUE_DEPTH_WARNING || failed_last_hour > FAILED_JOBS_WARNING {
        "warning"
    } else {
        "ok"
    };

    let disk_percent = disk_usage_percent(&state.deps.storage.root).await;
    let disk = match disk_percent {
        None => "fail",
        Some(p) if p >= DISK_CRITICAL_PERCENT => "critical",
        Some(p) if p >= DISK_WARNING_PERCENT => "warning",
        Some(_) => "ok",
    };

    let renderer = match state.deps.renderer.pressure().await {
        Ok(_) => "ok",
        Err(error) => {
            warn!(%error, "renderer health probe failed");
            "fail"
        }
    };

    let audits_last_hour = state.deps.audits.audits_last_hour().await.unwrap_or(-1);

    let checks = [database, cache, queue, disk, renderer];
    let healthy = !checks.iter().any(|c| *c == "fail" || *c == "critical");

    let body = Json(serde_json::json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "checks": {
            "database": database,
            "cache": cache,
            "queue": queue,
            "disk": disk,
            "renderer": renderer,
        },
        "metrics": {
            "queue_depth": queue_depth,
            "failed_jobs_last_hour": failed_last_hour,
            "disk_usage_percent": disk_percent,
            "audits_last_hour": audits_last_hour,
        },
    }));

    if healthy {
        body.into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, body).into_response()
    }
}

async fn check_database(state: &AppState) -> &'static str {
    let started = Instant::now();
    match state.deps.audits.ping().await {
        Ok(()) if started.elapsed().as_millis() < DB_SLOW_MS => "ok",
        Ok(()) => "slow",
        Err(error) => {
            warn!(%error, "database health probe failed");
            "fail"
        }
    }
}

/// Round-trip one counter: increment then read back. A mismatch means
/// the store is lying, which is worse than being down.
async fn check_cache(state: &AppState) -> &'static str {
    let key = format!("health:probe:{}", Uuid::new_v4());
    let started = Instant::now();
    let written = state
        .deps
        .counters
        .incr(&key, Utc::now() + Duration::minutes(1))
        .await;
    let read = state.deps.counters.get(&key).await;
    match (written, read) {
        (Ok(written), Ok(read)) if written == read => {
            if started.elapsed().as_millis() < CACHE_SLOW_MS {
                "ok"
            } else {
                "slow"
            }
        }
        (Ok(_), Ok(_)) => "fail",
        (Err(error), _) | (_, Err(error)) => {
            warn!(%error, "cache health probe failed");
            "fail"
        }
    }
}

/// Filesystem usage of the storage tree, via `df -P`.
async fn disk_usage_percent(path: &str) -> Option<u8> {
    let output = tokio::process::Command::new("df")
        .arg("-P")
        .arg(path)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_df_percent(&String::from_utf8_lossy(&output.stdout))
}

fn parse_df_percent(output: &str) -> Option<u8> {
    let line = output.lines().nth(1)?;
    line.split_whitespace()
        .find(|field| field.ends_with('%'))
        .and_then(|field| field.trim_end_matches('%').parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_df_percent() {
        let output = "\
Filesystem     1024-blocks      Used Available Capacity Mounted on
/dev/sda1        102687672  78042492  19385236      81% /
";
        assert_eq!(parse_df_percent(output), Some(81));
    }

    #[test]
    fn test_parse_df_percent_rejects_garbage() {
        assert_eq!(parse_df_percent(""), None);
        assert_eq!(parse_df_percent("Filesystem\n"), None);
    }
}
