pub mod audits;
pub mod health;
pub mod scan;
pub mod stats;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};

/// 422 with the message the validator produced. Validation failures
/// surface verbatim; nothing else does.
pub fn invalid(error: String) -> axum::response::Response {
    (
        StatusCode::UNPROCESSABLE_ENTITY,
        Json(serde_json::json!({"message": "Invalid request", "error": error})),
    )
        .into_response()
}

pub fn internal_error() -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"message": "Internal server error"})),
    )
        .into_response()
}
