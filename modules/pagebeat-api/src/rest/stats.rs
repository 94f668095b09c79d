use std::sync::Arc;

use axum::{
    extract::State,
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use tracing::warn;

use crate::rest::internal_error;
use crate::AppState;

/// Rolling scan counts from the clock-aligned submission counters.
pub async fn api_stats(State(state): State<Arc<AppState>>) -> Response {
    let now = Utc::now();
    let keys = [
        ("minute", format!("scans:minute:{}", now.format("%Y-%m-%d-%H-%M"))),
        ("hour", format!("scans:hour:{}", now.format("%Y-%m-%d-%H"))),
        ("day", format!("scans:day:{}", now.format("%Y-%m-%d"))),
        ("month", format!("scans:month:{}", now.format("%Y-%m"))),
    ];

    let mut stats = serde_json::Map::new();
    for (window, key) in keys {
        match state.deps.counters.get(&key).await {
            Ok(count) => {
                stats.insert(window.to_string(), count.into());
            }
            Err(error) => {
                warn!(%key, %error, "stats counter read failed");
                return internal_error();
            }
        }
    }

    Json(serde_json::Value::Object(stats)).into_response()
}
