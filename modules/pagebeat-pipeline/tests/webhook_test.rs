//! Webhook delivery outcomes: the attempt ledger, retry scheduling,
//! permanent rejection, and operator escalation.

mod harness;

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use pagebeat_common::config::AlertConfig;
use pagebeat_common::{AuditStatus, JobKind};
use pagebeat_pipeline::notify::AlertRouter;
use pagebeat_pipeline::worker;
use pagebeat_store::{AuditStore, JobQueue};

use harness::{completed_audit, mount_hook, requests_to, stack, stack_with, TestStack};

async fn seed_delivery_job(stack: &TestStack) -> (uuid::Uuid, i64) {
    let audit = completed_audit();
    stack.store.insert_audit(&audit).await.unwrap();
    let job_id = stack
        .store
        .enqueue(audit.id, JobKind::DeliverWebhook, json!({}), 5, Utc::now())
        .await
        .unwrap();
    (audit.id, job_id)
}

#[tokio::test]
async fn acknowledged_delivery_closes_the_job_and_the_ledger_entry() {
    let stack = stack().await;
    mount_hook(&stack.server, 200).await;
    let (audit_id, _) = seed_delivery_job(&stack).await;

    worker::run_pending(&stack.deps).await.unwrap();

    let audit = stack.store.get_audit(audit_id).await.unwrap().unwrap();
    assert!(audit.webhook_delivered_at.is_some());
    assert_eq!(audit.webhook_status, Some(200));
    assert_eq!(audit.webhook_attempts, 1);

    let ledger = stack.store.deliveries_for(audit_id).await.unwrap();
    assert_eq!(ledger.len(), 1);
    let entry = &ledger[0];
    assert_eq!(entry.attempt_number, 1);
    assert_eq!(entry.response_status, Some(200));
    assert_eq!(entry.response_body.as_deref(), Some("OK"));
    assert!(entry.response_time_ms.is_some());
    assert!(entry.delivered_at.is_some());
    assert!(entry.error_message.is_none());

    assert_eq!(stack.store.queue_depth().await.unwrap(), 0);
}

#[tokio::test]
async fn endpoint_rejection_stops_retrying_but_keeps_the_audit_completed() {
    let stack = stack().await;
    mount_hook(&stack.server, 400).await;
    let (audit_id, _) = seed_delivery_job(&stack).await;

    worker::run_pending(&stack.deps).await.unwrap();

    // One conversation was enough.
    assert_eq!(requests_to(&stack.server, "/hook").await.len(), 1);
    assert_eq!(stack.store.queue_depth().await.unwrap(), 0);
    assert_eq!(stack.store.failed_last_hour().await.unwrap(), 1);

    let ledger = stack.store.deliveries_for(audit_id).await.unwrap();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].response_status, Some(400));
    assert_eq!(ledger[0].response_body.as_deref(), Some("rejected"));
    assert!(ledger[0].delivered_at.is_none());

    // A lost delivery never un-completes the audit.
    let audit = stack.store.get_audit(audit_id).await.unwrap().unwrap();
    assert_eq!(audit.status, AuditStatus::Completed);
    assert!(audit.webhook_delivered_at.is_none());
    assert_eq!(audit.webhook_attempts, 1);
}

#[tokio::test]
async fn upstream_errors_back_off_then_succeed() {
    let stack = stack().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .up_to_n_times(1)
        .mount(&stack.server)
        .await;
    mount_hook(&stack.server, 200).await;
    let (audit_id, job_id) = seed_delivery_job(&stack).await;

    worker::run_pending(&stack.deps).await.unwrap();

    // First attempt failed and was parked on the escalation schedule.
    assert_eq!(requests_to(&stack.server, "/hook").await.len(), 1);
    assert!(stack.store.claim_due(10).await.unwrap().is_empty());
    assert_eq!(stack.store.queue_depth().await.unwrap(), 1);

    // Pull the retry forward instead of waiting out the backoff.
    stack.store.retry(job_id, Utc::now(), "forced due").await.unwrap();
    worker::run_pending(&stack.deps).await.unwrap();

    let ledger = stack.store.deliveries_for(audit_id).await.unwrap();
    assert_eq!(ledger.len(), 2);
    assert_eq!(ledger[0].response_status, Some(503));
    assert!(ledger[0].delivered_at.is_none());
    assert_eq!(ledger[1].attempt_number, 2);
    assert_eq!(ledger[1].response_status, Some(200));
    assert!(ledger[1].delivered_at.is_some());

    let audit = stack.store.get_audit(audit_id).await.unwrap().unwrap();
    assert!(audit.webhook_delivered_at.is_some());
    assert_eq!(audit.webhook_attempts, 2);
}

#[tokio::test]
async fn network_failure_lands_in_the_ledger_as_retryable() {
    let stack = stack_with(|deps| {
        deps.webhook.url = Some("http://127.0.0.1:9/hook".to_string());
    })
    .await;
    let (audit_id, _) = seed_delivery_job(&stack).await;

    worker::run_pending(&stack.deps).await.unwrap();

    let ledger = stack.store.deliveries_for(audit_id).await.unwrap();
    assert_eq!(ledger.len(), 1);
    assert!(ledger[0].response_status.is_none());
    assert!(ledger[0].error_message.is_some());
    assert!(ledger[0].delivered_at.is_none());

    // Connection errors are worth another try.
    assert_eq!(stack.store.queue_depth().await.unwrap(), 1);
    let audit = stack.store.get_audit(audit_id).await.unwrap().unwrap();
    assert_eq!(audit.webhook_attempts, 1);
    assert!(audit.webhook_delivered_at.is_none());
}

#[tokio::test]
async fn exhausted_delivery_escalates_to_slack_once() {
    let mut stack = stack().await;
    stack.deps.alerts = Arc::new(AlertRouter::from_config(
        &AlertConfig {
            enabled: true,
            slack_webhook_url: Some(format!("{}/slack", stack.server.uri())),
            smtp_host: None,
            smtp_port: 587,
            smtp_username: None,
            smtp_password: None,
            email_from: None,
            email_to: None,
        },
        stack.store.clone(),
    ));
    mount_hook(&stack.server, 400).await;
    Mock::given(method("POST"))
        .and(path("/slack"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(1)
        .mount(&stack.server)
        .await;

    let (audit_id, _) = seed_delivery_job(&stack).await;
    worker::run_pending(&stack.deps).await.unwrap();

    // A second stranded job for the same audit fails again, but the
    // operator already heard about it.
    stack
        .store
        .enqueue(audit_id, JobKind::DeliverWebhook, json!({}), 5, Utc::now())
        .await
        .unwrap();
    worker::run_pending(&stack.deps).await.unwrap();

    assert_eq!(requests_to(&stack.server, "/hook").await.len(), 2);
    let alerts = requests_to(&stack.server, "/slack").await;
    assert_eq!(alerts.len(), 1);

    let payload: serde_json::Value = serde_json::from_slice(&alerts[0].body).unwrap();
    assert_eq!(
        payload["text"],
        json!(format!("Webhook delivery permanently failed for audit {audit_id}"))
    );
    assert_eq!(payload["attachments"][0]["color"], json!("danger"));
    assert_eq!(
        payload["attachments"][0]["fields"][1]["value"],
        json!("https://example.com")
    );
}
