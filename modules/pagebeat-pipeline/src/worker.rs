//! The job worker: claims due jobs, runs their stage under a deadline,
//! and turns each outcome into scheduling.
//!
//! Outcome handling is the contract that makes the pipeline at-least-
//! once: deferrals reschedule without charging the attempt, retryables
//! charge it and back off, permanents and exhausted budgets close the
//! job out through the terminal hook for its kind.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use rand::Rng;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use pagebeat_common::config::WorkerConfig;
use pagebeat_common::{AuditStatus, JobKind, QueuedJob, StepEntry};

use crate::deps::PipelineDeps;
use crate::error::{StageError, StageResult};
use crate::notify::WebhookFailureAlert;
use crate::{fetch, pdf, screenshots, webhook};

/// Per-stage wall-clock budgets.
const FETCH_TIMEOUT: Duration = Duration::from_secs(90);
const SCREENSHOT_TIMEOUT: Duration = Duration::from_secs(120);
const PDF_TIMEOUT: Duration = Duration::from_secs(120);
/// Webhook posts get the endpoint timeout plus handshake slack.
const WEBHOOK_TIMEOUT_SLACK: Duration = Duration::from_secs(15);

/// Escalating webhook retry schedule, indexed by attempts already spent.
const WEBHOOK_BACKOFF_SECS: [i64; 4] = [30, 60, 300, 900];

const BUSY_RETRY_SECS: i64 = 15;

const ALL_KINDS: [JobKind; 4] = [
    JobKind::FetchInsights,
    JobKind::CaptureScreenshots,
    JobKind::GeneratePdf,
    JobKind::DeliverWebhook,
];

pub struct Worker {
    deps: PipelineDeps,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(deps: PipelineDeps, config: WorkerConfig) -> Self {
        Self { deps, config }
    }

    /// Run until ctrl-c, then drain in-flight jobs.
    pub async fn run(self) -> Result<()> {
        let permits = Arc::new(Semaphore::new(self.config.concurrency));
        let mut poll = tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs));
        let mut housekeeping = tokio::time::interval(Duration::from_secs(
            self.config.housekeeping_interval_secs,
        ));
        info!(concurrency = self.config.concurrency, "worker started");

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                    break;
                }
                _ = poll.tick() => {
                    let free = permits.available_permits();
                    if free == 0 {
                        continue;
                    }
                    let batch = match self.deps.jobs.claim_due(free as i64).await {
                        Ok(batch) => batch,
                        Err(error) => {
                            warn!(%error, "job claim failed");
                            continue;
                        }
                    };
                    for job in batch {
                        let Ok(permit) = permits.clone().acquire_owned().await else {
                            break;
                        };
                        let deps = self.deps.clone();
                        tokio::spawn(async move {
                            process(&deps, &job).await;
                            drop(permit);
                        });
                    }
                }
                _ = housekeeping.tick() => {
                    housekeep(&self.deps, &self.config).await;
                }
            }
        }

        let _ = permits.acquire_many(self.config.concurrency as u32).await;
        info!("worker drained");
        Ok(())
    }
}

/// Run one claimed job to a recorded outcome.
pub async fn process(deps: &PipelineDeps, job: &QueuedJob) {
    debug!(job_id = job.id, kind = %job.kind, attempt = job.attempt, "job started");

    let budget = stage_timeout(deps, job.kind);
    let outcome = match tokio::time::timeout(budget, dispatch(deps, job)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(StageError::retryable(anyhow!(
            "{} timed out after {}s",
            job.kind,
            budget.as_secs()
        ))),
    };

    if let Err(error) = schedule(deps, job, outcome).await {
        error!(job_id = job.id, %error, "failed to record job outcome");
    }
}

/// Claim and process until nothing is currently runnable. Jobs backed
/// off into the future are left for their scheduled time.
pub async fn run_pending(deps: &PipelineDeps) -> Result<usize> {
    let mut processed = 0;
    loop {
        let batch = deps.jobs.claim_due(16).await?;
        if batch.is_empty() {
            break;
        }
        for job in batch {
            process(deps, &job).await;
            processed += 1;
        }
    }
    Ok(processed)
}

async fn dispatch(deps: &PipelineDeps, job: &QueuedJob) -> StageResult<()> {
    match job.kind {
        JobKind::FetchInsights => fetch::run(deps, job).await,
        JobKind::CaptureScreenshots => screenshots::run(deps, job).await,
        JobKind::GeneratePdf => pdf::run(deps, job).await,
        JobKind::DeliverWebhook => webhook::deliver(deps, job).await,
    }
}

async fn schedule(deps: &PipelineDeps, job: &QueuedJob, outcome: StageResult<()>) -> Result<()> {
    match outcome {
        Ok(()) => {
            deps.jobs.complete(job.id).await?;
            debug!(job_id = job.id, kind = %job.kind, "job completed");
        }
        Err(StageError::QuotaExceeded(reason)) => {
            if job.deferral_count >= deps.quota.max_deferrals {
                terminal_failure(deps, job, &format!("deferral budget exhausted: {reason}")).await?;
            } else {
                let run_at = Utc::now() + chrono::Duration::seconds(deps.quota.deferral_delay_secs);
                info!(job_id = job.id, kind = %job.kind, %reason, "job deferred");
                deps.jobs.defer(job.id, run_at).await?;
            }
        }
        Err(StageError::Busy(reason)) => {
            if job.deferral_count >= deps.quota.max_deferrals {
                terminal_failure(deps, job, &format!("deferral budget exhausted: {reason}")).await?;
            } else {
                debug!(job_id = job.id, kind = %job.kind, %reason, "job rescheduled around a busy resource");
                deps.jobs
                    .defer(job.id, Utc::now() + chrono::Duration::seconds(BUSY_RETRY_SECS))
                    .await?;
            }
        }
        Err(StageError::Retryable(cause)) => {
            if job.attempt >= job.max_attempts {
                terminal_failure(deps, job, &cause.to_string()).await?;
            } else {
                let delay = backoff_delay(job.kind, job.attempt, deps.pipeline.job_backoff_base_secs);
                warn!(
                    job_id = job.id,
                    kind = %job.kind,
                    attempt = job.attempt,
                    error = %cause,
                    delay_secs = delay.num_seconds(),
                    "job failed, will retry"
                );
                deps.jobs
                    .retry(job.id, Utc::now() + delay, &cause.to_string())
                    .await?;
            }
        }
        Err(StageError::Permanent(cause)) => {
            terminal_failure(deps, job, &cause.to_string()).await?;
        }
    }
    Ok(())
}

async fn terminal_failure(deps: &PipelineDeps, job: &QueuedJob, reason: &str) -> Result<()> {
    error!(
        job_id = job.id,
        kind = %job.kind,
        audit_id = %job.audit_id,
        reason,
        "job permanently failed"
    );
    deps.jobs.fail(job.id, reason).await?;

    match job.kind {
        JobKind::CaptureScreenshots if !deps.pipeline.require_screenshots => {
            degrade_screenshots(deps, job, reason).await?;
        }
        JobKind::FetchInsights | JobKind::CaptureScreenshots | JobKind::GeneratePdf => {
            let context = json!({ "stage": job.kind, "attempts": job.attempt });
            let marked = deps
                .audits
                .mark_failed(job.audit_id, reason, Some(&context))
                .await?;
            if marked {
                deps.audits
                    .append_step(
                        job.audit_id,
                        &StepEntry::failed(&job.kind.to_string(), reason.to_string(), None),
                    )
                    .await?;
            }
        }
        JobKind::DeliverWebhook => {
            if let Some(audit) = deps.audits.get_audit(job.audit_id).await? {
                let alert = WebhookFailureAlert {
                    audit_id: audit.id,
                    url: audit.url.clone(),
                    attempts: job.attempt,
                    score: audit.score,
                    error: reason.to_string(),
                    pdf_url: audit.pdf_url(&deps.storage.public_base_url),
                };
                deps.alerts.webhook_failed(&alert).await;
            }
        }
    }
    Ok(())
}

/// Optional screenshots exhausting their attempts degrade the report
/// instead of killing the audit: note the failure on the audit row and
/// move on to the PDF without them.
async fn degrade_screenshots(deps: &PipelineDeps, job: &QueuedJob, reason: &str) -> Result<()> {
    let Some(audit) = deps.audits.get_audit(job.audit_id).await? else {
        return Ok(());
    };
    if matches!(audit.status, AuditStatus::Completed | AuditStatus::Failed) {
        return Ok(());
    }

    let mut set = audit.screenshots.unwrap_or_default();
    if set.error.is_none() {
        set.error = Some(reason.to_string());
    }
    set.failed = set.is_empty();
    deps.audits.store_screenshots(job.audit_id, &set).await?;

    deps.audits
        .append_step(
            job.audit_id,
            &StepEntry::completed_with_warnings(
                &job.kind.to_string(),
                Some(json!({
                    "desktop": set.desktop,
                    "mobile": set.mobile,
                    "error": set.error,
                })),
            ),
        )
        .await?;

    deps.jobs
        .enqueue(
            job.audit_id,
            JobKind::GeneratePdf,
            json!({}),
            deps.pipeline.job_max_attempts,
            Utc::now(),
        )
        .await?;

    info!(audit_id = %job.audit_id, reason, "screenshots skipped, continuing to PDF");
    Ok(())
}

async fn housekeep(deps: &PipelineDeps, config: &WorkerConfig) {
    // Requeue jobs whose worker died mid-flight; close out any that were
    // already on their last attempt.
    for kind in ALL_KINDS {
        let budget = stage_timeout(deps, kind).as_secs() as i64;
        let cutoff = Utc::now() - chrono::Duration::seconds(2 * budget);
        match deps.jobs.recover_stale(kind, cutoff).await {
            Ok(recovered) if !recovered.is_empty() => {
                warn!(%kind, count = recovered.len(), "requeued stale jobs");
                for job in recovered {
                    if job.attempt >= job.max_attempts {
                        if let Err(error) =
                            terminal_failure(deps, &job, "worker lost the job with no attempts left")
                                .await
                        {
                            error!(job_id = job.id, %error, "failed to close out stale job");
                        }
                    }
                }
            }
            Ok(_) => {}
            Err(error) => warn!(%kind, %error, "stale job recovery failed"),
        }
    }

    match deps.counters.prune_expired().await {
        Ok(0) => {}
        Ok(pruned) => debug!(pruned, "expired counters pruned"),
        Err(error) => warn!(%error, "counter pruning failed"),
    }

    redeliver_stranded(deps, config).await;
}

/// Completed audits with no acknowledged delivery and attempts to spare
/// get their webhook job back. Covers jobs lost to crashes after the
/// audit row was already finalized.
async fn redeliver_stranded(deps: &PipelineDeps, config: &WorkerConfig) {
    if deps.webhook.url.is_none() {
        return;
    }
    let stranded = match deps
        .audits
        .undelivered_completed(deps.webhook.max_attempts, config.redelivery_batch)
        .await
    {
        Ok(stranded) => stranded,
        Err(error) => {
            warn!(%error, "redelivery sweep failed");
            return;
        }
    };

    for audit in stranded {
        match deps.jobs.has_active_job(audit.id, JobKind::DeliverWebhook).await {
            Ok(true) => {}
            Ok(false) => {
                info!(audit_id = %audit.id, "re-enqueueing stranded webhook delivery");
                if let Err(error) = deps
                    .jobs
                    .enqueue(
                        audit.id,
                        JobKind::DeliverWebhook,
                        json!({}),
                        deps.webhook.max_attempts,
                        Utc::now(),
                    )
                    .await
                {
                    warn!(audit_id = %audit.id, %error, "failed to re-enqueue webhook delivery");
                }
            }
            Err(error) => warn!(audit_id = %audit.id, %error, "active-job check failed"),
        }
    }
}

fn stage_timeout(deps: &PipelineDeps, kind: JobKind) -> Duration {
    match kind {
        JobKind::FetchInsights => FETCH_TIMEOUT,
        JobKind::CaptureScreenshots => SCREENSHOT_TIMEOUT,
        JobKind::GeneratePdf => PDF_TIMEOUT,
        JobKind::DeliverWebhook => {
            Duration::from_secs(deps.webhook.timeout_secs) + WEBHOOK_TIMEOUT_SLACK
        }
    }
}

/// Delay before the next try, with up to 20% jitter so synchronized
/// failures spread back out. Stages double from the configured base;
/// webhooks follow their fixed escalation schedule.
fn backoff_delay(kind: JobKind, attempt: i32, base_secs: i64) -> chrono::Duration {
    let spent = (attempt.max(1) - 1) as usize;
    let secs = match kind {
        JobKind::DeliverWebhook => {
            WEBHOOK_BACKOFF_SECS[spent.min(WEBHOOK_BACKOFF_SECS.len() - 1)]
        }
        _ => base_secs.saturating_mul(1_i64 << spent.min(4)),
    };
    let jitter = (secs as f64 * rand::rng().random_range(0.0..0.2)) as i64;
    chrono::Duration::seconds(secs + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_deps;
    use pagebeat_common::{Audit, AuditStatus, Language, Strategy};
    use pagebeat_store::MemoryStore;

    #[test]
    fn test_webhook_backoff_follows_the_escalation_schedule() {
        for (attempt, floor, ceiling) in [(1, 30, 36), (2, 60, 72), (3, 300, 360), (4, 900, 1080), (9, 900, 1080)] {
            let delay = backoff_delay(JobKind::DeliverWebhook, attempt, 30).num_seconds();
            assert!(
                (floor..=ceiling).contains(&delay),
                "attempt {attempt}: {delay}s outside {floor}..={ceiling}"
            );
        }
    }

    #[test]
    fn test_stage_backoff_doubles_from_the_base() {
        for (attempt, floor, ceiling) in [(1, 30, 36), (2, 60, 72), (3, 120, 144)] {
            let delay = backoff_delay(JobKind::FetchInsights, attempt, 30).num_seconds();
            assert!(
                (floor..=ceiling).contains(&delay),
                "attempt {attempt}: {delay}s outside {floor}..={ceiling}"
            );
        }
    }

    async fn seeded_job(store: &MemoryStore, kind: JobKind, max_attempts: i32) -> (Audit, QueuedJob) {
        use pagebeat_store::{AuditStore, JobQueue};
        let audit = Audit::new("https://example.com".to_string(), Strategy::Mobile, Language::En);
        store.insert_audit(&audit).await.unwrap();
        store
            .enqueue(audit.id, kind, json!({}), max_attempts, Utc::now())
            .await
            .unwrap();
        let job = store.claim_due(1).await.unwrap().remove(0);
        (audit, job)
    }

    #[tokio::test]
    async fn test_quota_denial_defers_without_charging_the_attempt() {
        use pagebeat_store::JobQueue;
        let store = Arc::new(MemoryStore::new());
        let deps = test_deps(store.clone());
        let (_, job) = seeded_job(&store, JobKind::FetchInsights, 3).await;

        schedule(&deps, &job, Err(StageError::QuotaExceeded("window full".to_string())))
            .await
            .unwrap();

        // Deferred into the future, attempt refunded.
        assert!(store.claim_due(10).await.unwrap().is_empty());
        let replayable = store
            .recover_stale(JobKind::FetchInsights, Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(replayable.is_empty(), "job must be queued, not running");
    }

    #[tokio::test]
    async fn test_exhausted_deferral_budget_fails_the_audit() {
        use pagebeat_store::{AuditStore, JobQueue};
        let store = Arc::new(MemoryStore::new());
        let mut deps = test_deps(store.clone());
        deps.quota.max_deferrals = 0;
        let (audit, job) = seeded_job(&store, JobKind::FetchInsights, 3).await;

        schedule(&deps, &job, Err(StageError::QuotaExceeded("window full".to_string())))
            .await
            .unwrap();

        let stored = store.get_audit(audit.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AuditStatus::Failed);
        assert!(stored.error_message.unwrap().contains("deferral budget exhausted"));
        assert_eq!(store.failed_last_hour().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_retryable_failure_requeues_until_attempts_run_out() {
        use pagebeat_store::{AuditStore, JobQueue};
        let store = Arc::new(MemoryStore::new());
        let mut deps = test_deps(store.clone());
        deps.pipeline.job_backoff_base_secs = 0;
        deps.pipeline.require_screenshots = true;
        let (audit, job) = seeded_job(&store, JobKind::CaptureScreenshots, 2).await;

        schedule(&deps, &job, Err(StageError::retryable(anyhow!("renderer hiccup"))))
            .await
            .unwrap();
        let second = store.claim_due(1).await.unwrap().remove(0);
        assert_eq!(second.attempt, 2);
        assert_eq!(second.last_error.as_deref(), Some("renderer hiccup"));

        schedule(&deps, &second, Err(StageError::retryable(anyhow!("renderer hiccup"))))
            .await
            .unwrap();

        let stored = store.get_audit(audit.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AuditStatus::Failed);
        assert_eq!(stored.steps.len(), 1);
        assert_eq!(stored.steps[0].name, "capture_screenshots");
        assert_eq!(store.queue_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_optional_screenshot_exhaustion_forwards_to_pdf() {
        use pagebeat_common::StepStatus;
        use pagebeat_store::{AuditStore, JobQueue};
        let store = Arc::new(MemoryStore::new());
        let deps = test_deps(store.clone());
        let (audit, job) = seeded_job(&store, JobKind::CaptureScreenshots, 1).await;

        schedule(&deps, &job, Err(StageError::retryable(anyhow!("renderer never came back"))))
            .await
            .unwrap();

        let stored = store.get_audit(audit.id).await.unwrap().unwrap();
        assert_ne!(stored.status, AuditStatus::Failed);
        assert!(stored.error_message.is_none());

        let shots = stored.screenshots.unwrap();
        assert!(shots.failed);
        assert_eq!(shots.error.as_deref(), Some("renderer never came back"));

        assert_eq!(stored.steps.len(), 1);
        assert_eq!(stored.steps[0].name, "capture_screenshots");
        assert_eq!(stored.steps[0].status, StepStatus::CompletedWithWarnings);

        let next = store.claim_due(1).await.unwrap().remove(0);
        assert_eq!(next.kind, JobKind::GeneratePdf);
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_remaining_attempts() {
        use pagebeat_store::{AuditStore, JobQueue};
        let store = Arc::new(MemoryStore::new());
        let deps = test_deps(store.clone());
        let (audit, job) = seeded_job(&store, JobKind::FetchInsights, 3).await;

        schedule(&deps, &job, Err(StageError::permanent(anyhow!("page cannot be analyzed"))))
            .await
            .unwrap();

        let stored = store.get_audit(audit.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AuditStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("page cannot be analyzed"));
        assert_eq!(store.queue_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_a_failed_audit_does_not_fail_twice() {
        use pagebeat_store::{AuditStore, JobQueue};
        let store = Arc::new(MemoryStore::new());
        let deps = test_deps(store.clone());
        let (audit, job) = seeded_job(&store, JobKind::FetchInsights, 3).await;

        schedule(&deps, &job, Err(StageError::permanent(anyhow!("first")))).await.unwrap();
        schedule(&deps, &job, Err(StageError::permanent(anyhow!("second")))).await.unwrap();

        let stored = store.get_audit(audit.id).await.unwrap().unwrap();
        assert_eq!(stored.error_message.as_deref(), Some("first"));
        assert_eq!(stored.steps.len(), 1, "only the first terminal failure writes a step");
    }
}
