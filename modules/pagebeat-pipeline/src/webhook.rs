//! Webhook delivery with an append-only attempt ledger.
//!
//! At-least-once: an attempt is recorded before its outcome can be
//! acted on, the audit row carries the rolling delivery state, and a
//! housekeeping sweep re-enqueues completed audits that never got
//! their acknowledgment.

use std::time::Instant;

use anyhow::anyhow;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info};

use pagebeat_common::{Audit, QueuedJob};
use pagebeat_store::NewWebhookDelivery;

use crate::deps::PipelineDeps;
use crate::error::{StageError, StageResult};
use crate::signature;

const RESPONSE_BODY_LIMIT: usize = 1000;

/// Receiver payload. Keys are camelCase; metrics fall back to "N/A" and
/// the score to 0 so the document shape never varies.
pub fn build_payload(audit: &Audit, public_base_url: &str) -> serde_json::Value {
    let metrics = audit.metrics.clone().unwrap_or_default();
    let (screenshots_included, screenshot_error) = match &audit.screenshots {
        Some(set) => (!set.is_empty(), set.error.clone()),
        None => (false, None),
    };

    json!({
        "auditId": audit.id,
        "status": audit.status,
        "targetUrl": audit.url,
        "pdfUrl": audit.pdf_url(public_base_url),
        "score": audit.score.unwrap_or(0),
        "metrics": { "lcp": metrics.lcp, "fcp": metrics.fcp, "cls": metrics.cls },
        "strategy": audit.strategy,
        "lang": audit.lang,
        "screenshotsIncluded": screenshots_included,
        "screenshotError": screenshot_error,
    })
}

pub async fn deliver(deps: &PipelineDeps, job: &QueuedJob) -> StageResult<()> {
    let audit = deps
        .audits
        .get_audit(job.audit_id)
        .await?
        .ok_or_else(|| StageError::permanent(anyhow!("audit {} not found", job.audit_id)))?;

    // A replayed or swept-in duplicate after an acknowledged delivery.
    if audit.webhook_delivered_at.is_some() {
        return Ok(());
    }

    let Some(endpoint) = deps.webhook.url.clone() else {
        debug!(audit_id = %audit.id, "no webhook endpoint configured");
        return Ok(());
    };

    let payload = build_payload(&audit, &deps.storage.public_base_url);
    // Sign the exact bytes that go on the wire.
    let body = serde_json::to_string(&payload).map_err(StageError::permanent)?;
    let timestamp = Utc::now().timestamp();

    let mut request = deps
        .http
        .post(&endpoint)
        .timeout(std::time::Duration::from_secs(deps.webhook.timeout_secs))
        .header("Content-Type", "application/json")
        .header(signature::TIMESTAMP_HEADER, timestamp.to_string())
        .header(signature::ID_HEADER, signature::delivery_id())
        .header(signature::ATTEMPT_HEADER, job.attempt.to_string())
        .header(signature::MAX_ATTEMPTS_HEADER, job.max_attempts.to_string());
    if let Some(secret) = &deps.webhook.secret {
        request = request.header(
            signature::SIGNATURE_HEADER,
            signature::header_value(secret, timestamp, &body),
        );
    }

    let started = Instant::now();
    let outcome = request.body(body).send().await;
    let elapsed_ms = started.elapsed().as_millis() as i64;

    match outcome {
        Ok(response) => {
            let status = response.status();
            let response_body = truncated(response.text().await.unwrap_or_default());
            let delivered = status.is_success();

            deps.audits
                .insert_delivery(&NewWebhookDelivery {
                    audit_id: audit.id,
                    attempt_number: job.attempt,
                    url: endpoint,
                    payload,
                    response_status: Some(status.as_u16() as i16),
                    response_body: Some(response_body.clone()),
                    response_time_ms: Some(elapsed_ms),
                    error_message: None,
                    delivered_at: delivered.then(Utc::now),
                })
                .await?;
            deps.audits
                .record_webhook_attempt(audit.id, Some(status.as_u16() as i16), delivered, job.attempt)
                .await?;

            if delivered {
                info!(
                    audit_id = %audit.id,
                    status = status.as_u16(),
                    attempt = job.attempt,
                    "webhook delivered"
                );
                Ok(())
            } else if status.is_client_error() {
                // The endpoint understood us and said no. More attempts
                // would just repeat the conversation.
                Err(StageError::permanent(anyhow!(
                    "webhook endpoint rejected the delivery with status {}: {response_body}",
                    status.as_u16()
                )))
            } else {
                Err(StageError::retryable(anyhow!(
                    "webhook endpoint returned status {}",
                    status.as_u16()
                )))
            }
        }
        Err(error) => {
            deps.audits
                .insert_delivery(&NewWebhookDelivery {
                    audit_id: audit.id,
                    attempt_number: job.attempt,
                    url: endpoint,
                    payload,
                    response_status: None,
                    response_body: None,
                    response_time_ms: Some(elapsed_ms),
                    error_message: Some(error.to_string()),
                    delivered_at: None,
                })
                .await?;
            deps.audits
                .record_webhook_attempt(audit.id, None, false, job.attempt)
                .await?;
            Err(StageError::retryable(anyhow!("webhook request failed: {error}")))
        }
    }
}

fn truncated(s: String) -> String {
    if s.len() <= RESPONSE_BODY_LIMIT {
        return s;
    }
    let mut end = RESPONSE_BODY_LIMIT;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}
