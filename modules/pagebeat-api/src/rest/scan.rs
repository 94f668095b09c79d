use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use tracing::{info, warn};

use pagebeat_common::{Language, PagebeatError, Strategy};
use pagebeat_pipeline::admission::{self, SubmitRequest};

use crate::auth::{authenticate, Caller};
use crate::rest::{internal_error, invalid};
use crate::throttle::{admit, Allowance, ThrottleOutcome};
use crate::AppState;

#[derive(Deserialize)]
pub struct ScanRequest {
    url: Option<String>,
    lang: Option<String>,
    strategy: Option<String>,
}

pub async fn api_scan(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<ScanRequest>,
) -> Response {
    let token_id = match authenticate(&headers, &state.api_tokens) {
        Caller::Token(id) => Some(id),
        Caller::Anonymous => None,
        Caller::Unauthenticated => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({"message": "Unauthenticated"})),
            )
                .into_response();
        }
    };

    let url = match body.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
        Some(url) => url.to_string(),
        None => return invalid("The URL field is required".to_string()),
    };
    let lang = match body.lang.as_deref() {
        None => Language::En,
        Some(raw) => match Language::parse(raw) {
            Some(lang) => lang,
            None => {
                return invalid("The language must be one of: en, pt_BR, es".to_string());
            }
        },
    };
    let strategy = match body.strategy.as_deref() {
        None => Strategy::Mobile,
        Some(raw) => match Strategy::parse(raw) {
            Some(strategy) => strategy,
            None => {
                return invalid("The strategy must be either mobile or desktop".to_string());
            }
        },
    };

    // One throttle scope per credential; anonymous callers share by IP.
    let ip = addr.ip().to_string();
    let scope = token_id.clone().unwrap_or_else(|| format!("ip:{ip}"));
    let allowance = match admit(state.deps.counters.as_ref(), &state.throttle, &scope).await {
        Ok(ThrottleOutcome::Allowed(allowance)) => allowance,
        Ok(ThrottleOutcome::Denied(denial)) => {
            warn!(%scope, message = denial.message, "scan request throttled");
            let retry_after = denial.retry_after_secs();
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(serde_json::json!({
                    "message": denial.message,
                    "retry_after": retry_after,
                })),
            )
                .into_response();
            let headers = response.headers_mut();
            insert_num(headers, "x-ratelimit-limit", denial.limit);
            insert_num(headers, "x-ratelimit-remaining", 0);
            insert_num(headers, "x-ratelimit-reset", denial.reset_unix);
            insert_num(headers, header::RETRY_AFTER.as_str(), retry_after);
            return response;
        }
        Err(error) => {
            warn!(%error, "throttle check failed");
            return internal_error();
        }
    };

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    info!(
        %url, %strategy, %lang,
        token_id = token_id.as_deref().unwrap_or("-"),
        %ip,
        user_agent = user_agent.as_deref().unwrap_or("-"),
        "scan requested"
    );

    let request = SubmitRequest {
        url,
        strategy,
        lang,
        token_id,
        ip: Some(ip),
        user_agent,
    };

    match admission::submit(&state.deps, request).await {
        Ok(outcome) => {
            let audit = outcome.audit();
            let mut response = (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({
                    "message": "Audit queued",
                    "audit_id": audit.id,
                    "url": audit.url,
                    "lang": audit.lang,
                    "strategy": audit.strategy,
                    "status": audit.status,
                })),
            )
                .into_response();
            rate_limit_headers(&mut response, &allowance);
            response
        }
        Err(PagebeatError::Validation(message)) => invalid(message),
        Err(error) => {
            warn!(%error, "scan submission failed");
            internal_error()
        }
    }
}

fn rate_limit_headers(response: &mut Response, allowance: &Allowance) {
    let headers = response.headers_mut();
    insert_num(headers, "x-ratelimit-limit", allowance.limit);
    insert_num(headers, "x-ratelimit-remaining", allowance.remaining);
    insert_num(headers, "x-ratelimit-reset", allowance.reset_unix);
}

fn insert_num(headers: &mut axum::http::HeaderMap, name: &str, value: i64) {
    if let Ok(value) = axum::http::HeaderValue::from_str(&value.to_string()) {
        if let Ok(name) = axum::http::HeaderName::try_from(name) {
            headers.insert(name, value);
        }
    }
}
