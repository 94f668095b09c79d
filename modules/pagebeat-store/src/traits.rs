use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use pagebeat_common::{
    Audit, AuditMetrics, JobKind, QueuedJob, ScreenshotSet, StepEntry, Strategy, WebhookDelivery,
};

/// A delivery-ledger row before insertion. `delivered_at` is set only
/// for acknowledged (2xx) attempts.
#[derive(Debug, Clone)]
pub struct NewWebhookDelivery {
    pub audit_id: Uuid,
    pub attempt_number: i32,
    pub url: String,
    pub payload: serde_json::Value,
    pub response_status: Option<i16>,
    pub response_body: Option<String>,
    pub response_time_ms: Option<i64>,
    pub error_message: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Audit rows and their append-only delivery ledger.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Atomic create-if-absent. Returns false when either the
    /// idempotency key or the one-active-audit-per-target constraint
    /// conflicts; the caller re-runs its reuse lookup in that case.
    async fn insert_audit(&self, audit: &Audit) -> Result<bool>;

    async fn get_audit(&self, id: Uuid) -> Result<Option<Audit>>;

    /// Newest audit for (url, strategy) regardless of status.
    async fn newest_for_target(&self, url: &str, strategy: Strategy) -> Result<Option<Audit>>;

    /// Flip to processing and stamp the attempt time. Completed audits
    /// never regress.
    async fn mark_processing(&self, id: Uuid) -> Result<()>;

    /// Terminal failure. Returns false (and changes nothing) when the
    /// audit is already completed or failed, so repeated failure hooks
    /// are no-ops.
    async fn mark_failed(
        &self,
        id: Uuid,
        message: &str,
        context: Option<&serde_json::Value>,
    ) -> Result<bool>;

    async fn mark_completed(
        &self,
        id: Uuid,
        score: i16,
        metrics: &AuditMetrics,
        pdf_path: &str,
    ) -> Result<()>;

    /// Append one entry to the ordered step ledger.
    async fn append_step(&self, id: Uuid, step: &StepEntry) -> Result<()>;

    async fn store_insights(&self, id: Uuid, insights: &serde_json::Value) -> Result<()>;

    async fn store_screenshots(&self, id: Uuid, shots: &ScreenshotSet) -> Result<()>;

    /// Webhook bookkeeping on the audit row itself.
    async fn record_webhook_attempt(
        &self,
        id: Uuid,
        status: Option<i16>,
        delivered: bool,
        attempts: i32,
    ) -> Result<()>;

    async fn insert_delivery(&self, delivery: &NewWebhookDelivery) -> Result<i64>;

    async fn deliveries_for(&self, audit_id: Uuid) -> Result<Vec<WebhookDelivery>>;

    /// Completed audits with a report but no acknowledged webhook and
    /// attempts still below the cap. Feeds the redelivery sweep.
    async fn undelivered_completed(&self, max_attempts: i32, limit: i64) -> Result<Vec<Audit>>;

    /// Audits created in the trailing hour (health metric).
    async fn audits_last_hour(&self) -> Result<i64>;

    /// Connectivity probe for health checks.
    async fn ping(&self) -> Result<()>;
}

/// Durable work queue claimed with skip-locked semantics.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(
        &self,
        audit_id: Uuid,
        kind: JobKind,
        payload: serde_json::Value,
        max_attempts: i32,
        run_at: DateTime<Utc>,
    ) -> Result<i64>;

    /// Claim up to `limit` due jobs, flipping them to running and
    /// charging an attempt. Safe under concurrent workers.
    async fn claim_due(&self, limit: i64) -> Result<Vec<QueuedJob>>;

    async fn complete(&self, job_id: i64) -> Result<()>;

    /// Back to queued with a later due time; the attempt stays charged.
    async fn retry(&self, job_id: i64, run_at: DateTime<Utc>, error: &str) -> Result<()>;

    /// Quota wait: back to queued without charging the attempt.
    async fn defer(&self, job_id: i64, run_at: DateTime<Utc>) -> Result<()>;

    async fn fail(&self, job_id: i64, error: &str) -> Result<()>;

    /// Requeue jobs of one kind stuck running since before `cutoff`.
    /// Returns the recovered jobs so the caller can fail out any with
    /// exhausted attempts.
    async fn recover_stale(&self, kind: JobKind, cutoff: DateTime<Utc>) -> Result<Vec<QueuedJob>>;

    /// Queued + running job count (health metric).
    async fn queue_depth(&self) -> Result<i64>;

    async fn failed_last_hour(&self) -> Result<i64>;

    /// True when a queued or running job of this kind already exists
    /// for the audit. Keeps the redelivery sweep from double-enqueueing.
    async fn has_active_job(&self, audit_id: Uuid, kind: JobKind) -> Result<bool>;
}

/// Atomic windowed counters backing throttles, quotas, scan stats, and
/// alert-dedup markers.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment only while the current count is below `limit`.
    /// Returns the new count, or None (nothing consumed) at the limit.
    /// Check and increment are one atomic operation.
    async fn incr_below(
        &self,
        key: &str,
        limit: i64,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<i64>>;

    /// Unconditional increment. Returns the new count.
    async fn incr(&self, key: &str, expires_at: DateTime<Utc>) -> Result<i64>;

    async fn get(&self, key: &str) -> Result<i64>;

    /// Compensating decrement, never below zero.
    async fn decr(&self, key: &str) -> Result<()>;

    /// Set-once marker with expiry. Returns true when this call set it
    /// (fresh or previously expired), false when it is already held.
    async fn set_marker(&self, key: &str, expires_at: DateTime<Utc>) -> Result<bool>;

    /// Drop expired rows. Returns how many were pruned.
    async fn prune_expired(&self) -> Result<u64>;
}

/// Cross-process leases (per-audit PDF mutual exclusion).
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Acquire a lease, clearing any expired holder first. Returns true
    /// when this caller now holds the lease.
    async fn acquire(&self, key: &str, ttl_secs: i64) -> Result<bool>;

    async fn release(&self, key: &str) -> Result<()>;
}
