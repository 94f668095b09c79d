//! In-memory store mirroring the Postgres semantics. Backs pipeline tests
//! and single-process development runs where no database is available.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use pagebeat_common::{
    Audit, AuditMetrics, AuditStatus, JobKind, JobStatus, QueuedJob, ScreenshotSet, StepEntry,
    Strategy, WebhookDelivery,
};

use crate::traits::{AuditStore, CounterStore, JobQueue, LockStore, NewWebhookDelivery};

struct Counter {
    count: i64,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    audits: Vec<Audit>,
    deliveries: Vec<WebhookDelivery>,
    jobs: Vec<QueuedJob>,
    counters: HashMap<String, Counter>,
    locks: HashMap<String, DateTime<Utc>>,
    next_job_id: i64,
    next_delivery_id: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Inner {
    fn audit_mut(&mut self, id: Uuid) -> Option<&mut Audit> {
        self.audits.iter_mut().find(|a| a.id == id)
    }

    fn job_mut(&mut self, id: i64) -> Option<&mut QueuedJob> {
        self.jobs.iter_mut().find(|j| j.id == id)
    }

    fn touch(audit: &mut Audit) {
        audit.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// AuditStore
// ---------------------------------------------------------------------------

#[async_trait]
impl AuditStore for MemoryStore {
    async fn insert_audit(&self, audit: &Audit) -> Result<bool> {
        let mut inner = self.inner.lock().await;

        // Both uniqueness rules are checked under one lock hold, matching
        // the unique constraints a single INSERT hits in Postgres.
        let key_taken = inner
            .audits
            .iter()
            .any(|a| a.idempotency_key == audit.idempotency_key);
        let target_active = inner.audits.iter().any(|a| {
            a.url == audit.url
                && a.strategy == audit.strategy
                && matches!(a.status, AuditStatus::Pending | AuditStatus::Processing)
        });
        if key_taken || target_active {
            return Ok(false);
        }

        inner.audits.push(audit.clone());
        Ok(true)
    }

    async fn get_audit(&self, id: Uuid) -> Result<Option<Audit>> {
        let inner = self.inner.lock().await;
        Ok(inner.audits.iter().find(|a| a.id == id).cloned())
    }

    async fn newest_for_target(&self, url: &str, strategy: Strategy) -> Result<Option<Audit>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .audits
            .iter()
            .rev()
            .find(|a| a.url == url && a.strategy == strategy)
            .cloned())
    }

    async fn mark_processing(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(audit) = inner.audit_mut(id) {
            if audit.status != AuditStatus::Completed {
                audit.status = AuditStatus::Processing;
                audit.last_attempt_at = Some(Utc::now());
                Inner::touch(audit);
            }
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        message: &str,
        context: Option<&serde_json::Value>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let Some(audit) = inner.audit_mut(id) else {
            return Ok(false);
        };
        if matches!(audit.status, AuditStatus::Completed | AuditStatus::Failed) {
            return Ok(false);
        }
        audit.status = AuditStatus::Failed;
        audit.error_message = Some(message.to_string());
        audit.error_context = context.cloned();
        Inner::touch(audit);
        Ok(true)
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        score: i16,
        metrics: &AuditMetrics,
        pdf_path: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(audit) = inner.audit_mut(id) {
            audit.status = AuditStatus::Completed;
            audit.score = Some(score);
            audit.metrics = Some(metrics.clone());
            audit.pdf_path = Some(pdf_path.to_string());
            audit.completed_at = Some(Utc::now());
            Inner::touch(audit);
        }
        Ok(())
    }

    async fn append_step(&self, id: Uuid, step: &StepEntry) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(audit) = inner.audit_mut(id) {
            audit.steps.push(step.clone());
            Inner::touch(audit);
        }
        Ok(())
    }

    async fn store_insights(&self, id: Uuid, insights: &serde_json::Value) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(audit) = inner.audit_mut(id) {
            audit.insights = Some(insights.clone());
            Inner::touch(audit);
        }
        Ok(())
    }

    async fn store_screenshots(&self, id: Uuid, shots: &ScreenshotSet) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(audit) = inner.audit_mut(id) {
            audit.screenshots = Some(shots.clone());
            Inner::touch(audit);
        }
        Ok(())
    }

    async fn record_webhook_attempt(
        &self,
        id: Uuid,
        status: Option<i16>,
        delivered: bool,
        attempts: i32,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(audit) = inner.audit_mut(id) {
            audit.webhook_status = status;
            audit.webhook_attempts = attempts;
            if delivered {
                audit.webhook_delivered_at = Some(Utc::now());
            }
            Inner::touch(audit);
        }
        Ok(())
    }

    async fn insert_delivery(&self, delivery: &NewWebhookDelivery) -> Result<i64> {
        let mut inner = self.inner.lock().await;
        inner.next_delivery_id += 1;
        let id = inner.next_delivery_id;
        inner.deliveries.push(WebhookDelivery {
            id,
            audit_id: delivery.audit_id,
            attempt_number: delivery.attempt_number,
            url: delivery.url.clone(),
            payload: delivery.payload.clone(),
            response_status: delivery.response_status,
            response_body: delivery.response_body.clone(),
            response_time_ms: delivery.response_time_ms,
            error_message: delivery.error_message.clone(),
            delivered_at: delivery.delivered_at,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn deliveries_for(&self, audit_id: Uuid) -> Result<Vec<WebhookDelivery>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .deliveries
            .iter()
            .filter(|d| d.audit_id == audit_id)
            .cloned()
            .collect())
    }

    async fn undelivered_completed(&self, max_attempts: i32, limit: i64) -> Result<Vec<Audit>> {
        let inner = self.inner.lock().await;
        let mut matches: Vec<Audit> = inner
            .audits
            .iter()
            .filter(|a| {
                a.status == AuditStatus::Completed
                    && a.pdf_path.is_some()
                    && a.webhook_delivered_at.is_none()
                    && a.webhook_attempts < max_attempts
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matches.truncate(limit as usize);
        Ok(matches)
    }

    async fn audits_last_hour(&self) -> Result<i64> {
        let inner = self.inner.lock().await;
        let cutoff = Utc::now() - Duration::hours(1);
        Ok(inner.audits.iter().filter(|a| a.created_at > cutoff).count() as i64)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JobQueue
// ---------------------------------------------------------------------------

#[async_trait]
impl JobQueue for MemoryStore {
    async fn enqueue(
        &self,
        audit_id: Uuid,
        kind: JobKind,
        payload: serde_json::Value,
        max_attempts: i32,
        run_at: DateTime<Utc>,
    ) -> Result<i64> {
        let mut inner = self.inner.lock().await;
        inner.next_job_id += 1;
        let id = inner.next_job_id;
        inner.jobs.push(QueuedJob {
            id,
            audit_id,
            kind,
            status: JobStatus::Queued,
            attempt: 0,
            max_attempts,
            deferral_count: 0,
            payload,
            last_error: None,
            run_at,
            started_at: None,
            finished_at: None,
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn claim_due(&self, limit: i64) -> Result<Vec<QueuedJob>> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        let mut due: Vec<(DateTime<Utc>, i64)> = inner
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Queued && j.run_at <= now)
            .map(|j| (j.run_at, j.id))
            .collect();
        due.sort();
        due.truncate(limit as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(job) = inner.job_mut(id) {
                job.status = JobStatus::Running;
                job.attempt += 1;
                job.started_at = Some(now);
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, job_id: i64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.job_mut(job_id) {
            job.status = JobStatus::Completed;
            job.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn retry(&self, job_id: i64, run_at: DateTime<Utc>, error: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.job_mut(job_id) {
            job.status = JobStatus::Queued;
            job.run_at = run_at;
            job.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn defer(&self, job_id: i64, run_at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.job_mut(job_id) {
            job.status = JobStatus::Queued;
            job.run_at = run_at;
            job.attempt = (job.attempt - 1).max(0);
            job.deferral_count += 1;
        }
        Ok(())
    }

    async fn fail(&self, job_id: i64, error: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(job) = inner.job_mut(job_id) {
            job.status = JobStatus::Failed;
            job.last_error = Some(error.to_string());
            job.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn recover_stale(&self, kind: JobKind, cutoff: DateTime<Utc>) -> Result<Vec<QueuedJob>> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut recovered = Vec::new();
        for job in inner.jobs.iter_mut() {
            let stale = job.status == JobStatus::Running
                && job.kind == kind
                && job.started_at.is_some_and(|t| t < cutoff);
            if stale {
                job.status = JobStatus::Queued;
                job.run_at = now;
                recovered.push(job.clone());
            }
        }
        Ok(recovered)
    }

    async fn queue_depth(&self) -> Result<i64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .iter()
            .filter(|j| matches!(j.status, JobStatus::Queued | JobStatus::Running))
            .count() as i64)
    }

    async fn failed_last_hour(&self) -> Result<i64> {
        let inner = self.inner.lock().await;
        let cutoff = Utc::now() - Duration::hours(1);
        Ok(inner
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Failed && j.finished_at.is_some_and(|t| t > cutoff))
            .count() as i64)
    }

    async fn has_active_job(&self, audit_id: Uuid, kind: JobKind) -> Result<bool> {
        let inner = self.inner.lock().await;
        Ok(inner.jobs.iter().any(|j| {
            j.audit_id == audit_id
                && j.kind == kind
                && matches!(j.status, JobStatus::Queued | JobStatus::Running)
        }))
    }
}

// ---------------------------------------------------------------------------
// CounterStore
// ---------------------------------------------------------------------------

#[async_trait]
impl CounterStore for MemoryStore {
    async fn incr_below(
        &self,
        key: &str,
        limit: i64,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        let mut inner = self.inner.lock().await;
        match inner.counters.get_mut(key) {
            Some(counter) => {
                if counter.count >= limit {
                    return Ok(None);
                }
                counter.count += 1;
                Ok(Some(counter.count))
            }
            None => {
                if limit < 1 {
                    return Ok(None);
                }
                inner
                    .counters
                    .insert(key.to_string(), Counter { count: 1, expires_at });
                Ok(Some(1))
            }
        }
    }

    async fn incr(&self, key: &str, expires_at: DateTime<Utc>) -> Result<i64> {
        let mut inner = self.inner.lock().await;
        match inner.counters.get_mut(key) {
            Some(counter) => {
                counter.count += 1;
                Ok(counter.count)
            }
            None => {
                inner
                    .counters
                    .insert(key.to_string(), Counter { count: 1, expires_at });
                Ok(1)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<i64> {
        let inner = self.inner.lock().await;
        Ok(inner.counters.get(key).map(|c| c.count).unwrap_or(0))
    }

    async fn decr(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(counter) = inner.counters.get_mut(key) {
            if counter.count > 0 {
                counter.count -= 1;
            }
        }
        Ok(())
    }

    async fn set_marker(&self, key: &str, expires_at: DateTime<Utc>) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        if let Some(existing) = inner.counters.get(key) {
            if existing.expires_at >= now {
                return Ok(false);
            }
        }
        inner
            .counters
            .insert(key.to_string(), Counter { count: 1, expires_at });
        Ok(true)
    }

    async fn prune_expired(&self) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let before = inner.counters.len();
        inner.counters.retain(|_, c| c.expires_at >= now);
        Ok((before - inner.counters.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// LockStore
// ---------------------------------------------------------------------------

#[async_trait]
impl LockStore for MemoryStore {
    async fn acquire(&self, key: &str, ttl_secs: i64) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        if let Some(expires_at) = inner.locks.get(key) {
            if *expires_at >= now {
                return Ok(false);
            }
            inner.locks.remove(key);
        }
        inner
            .locks
            .insert(key.to_string(), now + Duration::seconds(ttl_secs));
        Ok(true)
    }

    async fn release(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.locks.remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use pagebeat_common::Language;
    use serde_json::json;

    fn sample_audit(url: &str) -> Audit {
        Audit::new(url.to_string(), Strategy::Mobile, Language::En)
    }

    #[tokio::test]
    async fn test_second_active_audit_for_same_target_is_rejected() {
        let store = MemoryStore::new();
        let first = sample_audit("https://example.com");
        let second = sample_audit("https://example.com");

        assert!(store.insert_audit(&first).await.unwrap());
        assert!(!store.insert_audit(&second).await.unwrap());

        // A different strategy is a different target.
        let desktop = Audit::new(
            "https://example.com".to_string(),
            Strategy::Desktop,
            Language::En,
        );
        assert!(store.insert_audit(&desktop).await.unwrap());
    }

    #[tokio::test]
    async fn test_terminal_audit_frees_the_target() {
        let store = MemoryStore::new();
        let first = sample_audit("https://example.com");
        store.insert_audit(&first).await.unwrap();
        store
            .mark_failed(first.id, "fetch failed", None)
            .await
            .unwrap();

        let second = sample_audit("https://example.com");
        assert!(store.insert_audit(&second).await.unwrap());
    }

    #[tokio::test]
    async fn test_mark_failed_is_idempotent() {
        let store = MemoryStore::new();
        let audit = sample_audit("https://example.com");
        store.insert_audit(&audit).await.unwrap();

        assert!(store.mark_failed(audit.id, "first", None).await.unwrap());
        assert!(!store.mark_failed(audit.id, "second", None).await.unwrap());

        let stored = store.get_audit(audit.id).await.unwrap().unwrap();
        assert_eq!(stored.error_message.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_claim_charges_attempt_and_claims_each_job_once() {
        let store = MemoryStore::new();
        let audit = sample_audit("https://example.com");
        store.insert_audit(&audit).await.unwrap();
        store
            .enqueue(audit.id, JobKind::FetchInsights, json!({}), 3, Utc::now())
            .await
            .unwrap();

        let claimed = store.claim_due(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attempt, 1);
        assert_eq!(claimed[0].status, JobStatus::Running);

        assert!(store.claim_due(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_defer_requeues_without_charging_the_attempt() {
        let store = MemoryStore::new();
        let audit = sample_audit("https://example.com");
        store.insert_audit(&audit).await.unwrap();
        let job_id = store
            .enqueue(audit.id, JobKind::FetchInsights, json!({}), 3, Utc::now())
            .await
            .unwrap();

        let claimed = store.claim_due(10).await.unwrap();
        assert_eq!(claimed[0].attempt, 1);

        store.defer(job_id, Utc::now()).await.unwrap();
        let reclaimed = store.claim_due(10).await.unwrap();
        assert_eq!(reclaimed[0].attempt, 1);
        assert_eq!(reclaimed[0].deferral_count, 1);
    }

    #[tokio::test]
    async fn test_incr_below_stops_at_the_limit() {
        let store = MemoryStore::new();
        let expires = Utc::now() + Duration::minutes(1);

        assert_eq!(store.incr_below("k", 2, expires).await.unwrap(), Some(1));
        assert_eq!(store.incr_below("k", 2, expires).await.unwrap(), Some(2));
        assert_eq!(store.incr_below("k", 2, expires).await.unwrap(), None);
        assert_eq!(
            store.incr_below("closed", 0, expires).await.unwrap(),
            None,
            "a zero limit admits nothing"
        );

        // A denied call consumes nothing, so a decr opens one slot back up.
        store.decr("k").await.unwrap();
        assert_eq!(store.incr_below("k", 2, expires).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn test_marker_dedups_until_it_expires() {
        let store = MemoryStore::new();

        let live = Utc::now() + Duration::hours(1);
        assert!(store.set_marker("m", live).await.unwrap());
        assert!(!store.set_marker("m", live).await.unwrap());

        // Simulate expiry by planting a marker already in the past.
        let stale = Utc::now() - Duration::hours(1);
        store.inner.lock().await.counters.insert(
            "old".to_string(),
            Counter { count: 1, expires_at: stale },
        );
        assert!(store.set_marker("old", live).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken_over() {
        let store = MemoryStore::new();
        assert!(store.acquire("pdf:abc", 60).await.unwrap());
        assert!(!store.acquire("pdf:abc", 60).await.unwrap());

        store
            .inner
            .lock()
            .await
            .locks
            .insert("pdf:abc".to_string(), Utc::now() - Duration::seconds(1));
        assert!(store.acquire("pdf:abc", 60).await.unwrap());

        store.release("pdf:abc").await.unwrap();
        assert!(store.acquire("pdf:abc", 60).await.unwrap());
    }
}
