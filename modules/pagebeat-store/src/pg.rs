//! Postgres implementations of the store traits, all on one shared pool.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use pagebeat_common::{
    Audit, AuditMetrics, AuditStatus, JobKind, JobStatus, Language, QueuedJob, ScreenshotSet,
    StepEntry, Strategy, WebhookDelivery,
};

use crate::traits::{AuditStore, CounterStore, JobQueue, LockStore, NewWebhookDelivery};

const AUDIT_COLUMNS: &str = "id, idempotency_key, url, strategy, lang, status, score, metrics, \
    insights, screenshots, steps, pdf_path, error_message, error_context, webhook_delivered_at, \
    webhook_status, webhook_attempts, created_by_token, created_by_ip, user_agent, \
    last_attempt_at, completed_at, created_at, updated_at";

const JOB_COLUMNS: &str = "id, audit_id, kind, status, attempt, max_attempts, deferral_count, \
    payload, last_error, run_at, started_at, finished_at, created_at";

const DELIVERY_COLUMNS: &str = "id, audit_id, attempt_number, url, payload, response_status, \
    response_body, response_time_ms, error_message, delivered_at, created_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn decode_label<T>(raw: &str, what: &str, parse: impl Fn(&str) -> Option<T>) -> Result<T, sqlx::Error> {
    parse(raw).ok_or_else(|| sqlx::Error::Decode(format!("unknown {what}: {raw}").into()))
}

fn decode_json<T: serde::de::DeserializeOwned>(
    value: Option<serde_json::Value>,
) -> Result<Option<T>, sqlx::Error> {
    value
        .map(|v| serde_json::from_value(v).map_err(|e| sqlx::Error::Decode(Box::new(e))))
        .transpose()
}

fn audit_from_row(row: &PgRow) -> Result<Audit, sqlx::Error> {
    let strategy: String = row.try_get("strategy")?;
    let lang: String = row.try_get("lang")?;
    let status: String = row.try_get("status")?;
    let steps: serde_json::Value = row.try_get("steps")?;
    let steps: Vec<StepEntry> =
        serde_json::from_value(steps).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

    Ok(Audit {
        id: row.try_get("id")?,
        idempotency_key: row.try_get("idempotency_key")?,
        url: row.try_get("url")?,
        strategy: decode_label(&strategy, "strategy", Strategy::parse)?,
        lang: decode_label(&lang, "lang", Language::parse)?,
        status: decode_label(&status, "audit status", AuditStatus::parse)?,
        score: row.try_get("score")?,
        metrics: decode_json::<AuditMetrics>(row.try_get("metrics")?)?,
        insights: row.try_get("insights")?,
        screenshots: decode_json::<ScreenshotSet>(row.try_get("screenshots")?)?,
        steps,
        pdf_path: row.try_get("pdf_path")?,
        error_message: row.try_get("error_message")?,
        error_context: row.try_get("error_context")?,
        webhook_delivered_at: row.try_get("webhook_delivered_at")?,
        webhook_status: row.try_get("webhook_status")?,
        webhook_attempts: row.try_get("webhook_attempts")?,
        created_by_token: row.try_get("created_by_token")?,
        created_by_ip: row.try_get("created_by_ip")?,
        user_agent: row.try_get("user_agent")?,
        last_attempt_at: row.try_get("last_attempt_at")?,
        completed_at: row.try_get("completed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn job_from_row(row: &PgRow) -> Result<QueuedJob, sqlx::Error> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;

    Ok(QueuedJob {
        id: row.try_get("id")?,
        audit_id: row.try_get("audit_id")?,
        kind: decode_label(&kind, "job kind", JobKind::parse)?,
        status: decode_label(&status, "job status", JobStatus::parse)?,
        attempt: row.try_get("attempt")?,
        max_attempts: row.try_get("max_attempts")?,
        deferral_count: row.try_get("deferral_count")?,
        payload: row.try_get("payload")?,
        last_error: row.try_get("last_error")?,
        run_at: row.try_get("run_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn delivery_from_row(row: &PgRow) -> Result<WebhookDelivery, sqlx::Error> {
    Ok(WebhookDelivery {
        id: row.try_get("id")?,
        audit_id: row.try_get("audit_id")?,
        attempt_number: row.try_get("attempt_number")?,
        url: row.try_get("url")?,
        payload: row.try_get("payload")?,
        response_status: row.try_get("response_status")?,
        response_body: row.try_get("response_body")?,
        response_time_ms: row.try_get("response_time_ms")?,
        error_message: row.try_get("error_message")?,
        delivered_at: row.try_get("delivered_at")?,
        created_at: row.try_get("created_at")?,
    })
}

// ---------------------------------------------------------------------------
// AuditStore
// ---------------------------------------------------------------------------

#[async_trait]
impl AuditStore for PgStore {
    async fn insert_audit(&self, audit: &Audit) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO audits (id, idempotency_key, url, strategy, lang, status,
                                created_by_token, created_by_ip, user_agent)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(audit.id)
        .bind(&audit.idempotency_key)
        .bind(&audit.url)
        .bind(audit.strategy.to_string())
        .bind(audit.lang.to_string())
        .bind(audit.status.to_string())
        .bind(&audit.created_by_token)
        .bind(&audit.created_by_ip)
        .bind(&audit.user_agent)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_audit(&self, id: Uuid) -> Result<Option<Audit>> {
        let sql = format!("SELECT {AUDIT_COLUMNS} FROM audits WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        Ok(row.map(|r| audit_from_row(&r)).transpose()?)
    }

    async fn newest_for_target(&self, url: &str, strategy: Strategy) -> Result<Option<Audit>> {
        let sql = format!(
            "SELECT {AUDIT_COLUMNS} FROM audits \
             WHERE url = $1 AND strategy = $2 \
             ORDER BY created_at DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(url)
            .bind(strategy.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| audit_from_row(&r)).transpose()?)
    }

    async fn mark_processing(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE audits
            SET status = 'processing', last_attempt_at = now(), updated_at = now()
            WHERE id = $1 AND status != 'completed'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: Uuid,
        message: &str,
        context: Option<&serde_json::Value>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE audits
            SET status = 'failed', error_message = $2, error_context = $3, updated_at = now()
            WHERE id = $1 AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(id)
        .bind(message)
        .bind(context)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_completed(
        &self,
        id: Uuid,
        score: i16,
        metrics: &AuditMetrics,
        pdf_path: &str,
    ) -> Result<()> {
        let metrics = serde_json::to_value(metrics)?;
        sqlx::query(
            r#"
            UPDATE audits
            SET status = 'completed', score = $2, metrics = $3, pdf_path = $4,
                completed_at = now(), updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(score)
        .bind(metrics)
        .bind(pdf_path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_step(&self, id: Uuid, step: &StepEntry) -> Result<()> {
        let step = serde_json::to_value(step)?;
        sqlx::query(
            r#"
            UPDATE audits
            SET steps = steps || $2, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(step)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn store_insights(&self, id: Uuid, insights: &serde_json::Value) -> Result<()> {
        sqlx::query("UPDATE audits SET insights = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(insights)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn store_screenshots(&self, id: Uuid, shots: &ScreenshotSet) -> Result<()> {
        let shots = serde_json::to_value(shots)?;
        sqlx::query("UPDATE audits SET screenshots = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(shots)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_webhook_attempt(
        &self,
        id: Uuid,
        status: Option<i16>,
        delivered: bool,
        attempts: i32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE audits
            SET webhook_status = $2,
                webhook_attempts = $3,
                webhook_delivered_at = CASE WHEN $4 THEN now() ELSE webhook_delivered_at END,
                updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(attempts)
        .bind(delivered)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_delivery(&self, delivery: &NewWebhookDelivery) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO webhook_deliveries (audit_id, attempt_number, url, payload,
                                            response_status, response_body, response_time_ms,
                                            error_message, delivered_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(delivery.audit_id)
        .bind(delivery.attempt_number)
        .bind(&delivery.url)
        .bind(&delivery.payload)
        .bind(delivery.response_status)
        .bind(&delivery.response_body)
        .bind(delivery.response_time_ms)
        .bind(&delivery.error_message)
        .bind(delivery.delivered_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn deliveries_for(&self, audit_id: Uuid) -> Result<Vec<WebhookDelivery>> {
        let sql = format!(
            "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries \
             WHERE audit_id = $1 ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql).bind(audit_id).fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(delivery_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn undelivered_completed(&self, max_attempts: i32, limit: i64) -> Result<Vec<Audit>> {
        let sql = format!(
            "SELECT {AUDIT_COLUMNS} FROM audits \
             WHERE status = 'completed' AND pdf_path IS NOT NULL \
               AND webhook_delivered_at IS NULL AND webhook_attempts < $1 \
             ORDER BY created_at DESC LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(max_attempts)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(audit_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn audits_last_hour(&self) -> Result<i64> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM audits WHERE created_at > now() - interval '1 hour'")
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JobQueue
// ---------------------------------------------------------------------------

#[async_trait]
impl JobQueue for PgStore {
    async fn enqueue(
        &self,
        audit_id: Uuid,
        kind: JobKind,
        payload: serde_json::Value,
        max_attempts: i32,
        run_at: DateTime<Utc>,
    ) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO jobs (audit_id, kind, payload, max_attempts, run_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(audit_id)
        .bind(kind.to_string())
        .bind(payload)
        .bind(max_attempts)
        .bind(run_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn claim_due(&self, limit: i64) -> Result<Vec<QueuedJob>> {
        let mut tx = self.pool.begin().await?;

        let ids: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT id FROM jobs
            WHERE status = 'queued' AND run_at <= now()
            ORDER BY run_at ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = ids.into_iter().map(|(id,)| id).collect();
        let sql = format!(
            "UPDATE jobs \
             SET status = 'running', attempt = attempt + 1, started_at = now() \
             WHERE id = ANY($1) \
             RETURNING {JOB_COLUMNS}"
        );
        let rows = sqlx::query(&sql).bind(&ids).fetch_all(&mut *tx).await?;
        tx.commit().await?;

        Ok(rows
            .iter()
            .map(job_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn complete(&self, job_id: i64) -> Result<()> {
        sqlx::query("UPDATE jobs SET status = 'completed', finished_at = now() WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn retry(&self, job_id: i64, run_at: DateTime<Utc>, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued', run_at = $2, last_error = $3
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(run_at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn defer(&self, job_id: i64, run_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued', run_at = $2,
                attempt = GREATEST(attempt - 1, 0),
                deferral_count = deferral_count + 1
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(run_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail(&self, job_id: i64, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', last_error = $2, finished_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recover_stale(&self, kind: JobKind, cutoff: DateTime<Utc>) -> Result<Vec<QueuedJob>> {
        let sql = format!(
            "UPDATE jobs \
             SET status = 'queued', run_at = now() \
             WHERE status = 'running' AND kind = $1 AND started_at < $2 \
             RETURNING {JOB_COLUMNS}"
        );
        let rows = sqlx::query(&sql)
            .bind(kind.to_string())
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(job_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn queue_depth(&self) -> Result<i64> {
        let row: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE status IN ('queued', 'running')")
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0)
    }

    async fn failed_last_hour(&self) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM jobs \
             WHERE status = 'failed' AND finished_at > now() - interval '1 hour'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn has_active_job(&self, audit_id: Uuid, kind: JobKind) -> Result<bool> {
        let row: (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM jobs
                WHERE audit_id = $1 AND kind = $2 AND status IN ('queued', 'running')
            )
            "#,
        )
        .bind(audit_id)
        .bind(kind.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }
}

// ---------------------------------------------------------------------------
// CounterStore
// ---------------------------------------------------------------------------

#[async_trait]
impl CounterStore for PgStore {
    async fn incr_below(
        &self,
        key: &str,
        limit: i64,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        // Single-statement conditional increment: the row either comes
        // back incremented or is left untouched at the limit. The SELECT
        // guard keeps a fresh key out too when the limit is zero.
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO counters (key, count, expires_at)
            SELECT $1, 1, $2 WHERE $3 >= 1
            ON CONFLICT (key) DO UPDATE
            SET count = counters.count + 1
            WHERE counters.count < $3
            RETURNING count
            "#,
        )
        .bind(key)
        .bind(expires_at)
        .bind(limit)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(count,)| count))
    }

    async fn incr(&self, key: &str, expires_at: DateTime<Utc>) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO counters (key, count, expires_at)
            VALUES ($1, 1, $2)
            ON CONFLICT (key) DO UPDATE
            SET count = counters.count + 1
            RETURNING count
            "#,
        )
        .bind(key)
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn get(&self, key: &str) -> Result<i64> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT count FROM counters WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(count,)| count).unwrap_or(0))
    }

    async fn decr(&self, key: &str) -> Result<()> {
        sqlx::query("UPDATE counters SET count = count - 1 WHERE key = $1 AND count > 0")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_marker(&self, key: &str, expires_at: DateTime<Utc>) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO counters (key, count, expires_at)
            VALUES ($1, 1, $2)
            ON CONFLICT (key) DO UPDATE
            SET count = 1, expires_at = EXCLUDED.expires_at
            WHERE counters.expires_at < now()
            RETURNING count
            "#,
        )
        .bind(key)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn prune_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM counters WHERE expires_at < now()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// ---------------------------------------------------------------------------
// LockStore
// ---------------------------------------------------------------------------

#[async_trait]
impl LockStore for PgStore {
    async fn acquire(&self, key: &str, ttl_secs: i64) -> Result<bool> {
        sqlx::query("DELETE FROM stage_locks WHERE key = $1 AND expires_at < now()")
            .bind(key)
            .execute(&self.pool)
            .await?;

        let expires_at = Utc::now() + chrono::Duration::seconds(ttl_secs);
        let result = sqlx::query(
            r#"
            INSERT INTO stage_locks (key, locked_at, expires_at)
            VALUES ($1, now(), $2)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM stage_locks WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
