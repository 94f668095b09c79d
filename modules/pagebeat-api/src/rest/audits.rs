use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use tracing::warn;
use uuid::Uuid;

use crate::rest::internal_error;
use crate::AppState;

pub async fn api_audit_detail(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Response {
    let audit = match state.deps.audits.get_audit(id).await {
        Ok(Some(audit)) => audit,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({"message": "Audit not found"})),
            )
                .into_response();
        }
        Err(error) => {
            warn!(audit_id = %id, %error, "audit lookup failed");
            return internal_error();
        }
    };

    let pdf_url = audit.pdf_url(&state.deps.storage.public_base_url);
    Json(serde_json::json!({
        "id": audit.id,
        "url": audit.url,
        "strategy": audit.strategy,
        "lang": audit.lang,
        "status": audit.status,
        "score": audit.score,
        "metrics": audit.metrics,
        "pdf_url": pdf_url,
        "error_message": audit.error_message,
        "created_at": audit.created_at,
        "completed_at": audit.completed_at,
    }))
    .into_response()
}
