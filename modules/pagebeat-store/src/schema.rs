//! Idempotent schema bootstrap. Binaries call [`ensure_schema`] at
//! startup; every statement is safe to re-run.

use anyhow::Result;
use sqlx::PgPool;

const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS audits (
        id                   UUID         PRIMARY KEY,
        idempotency_key      VARCHAR(64)  NOT NULL UNIQUE,
        url                  TEXT         NOT NULL,
        strategy             VARCHAR(10)  NOT NULL DEFAULT 'mobile',
        lang                 VARCHAR(10)  NOT NULL DEFAULT 'en',
        status               VARCHAR(20)  NOT NULL DEFAULT 'pending',
        score                SMALLINT,
        metrics              JSONB,
        insights             JSONB,
        screenshots          JSONB,
        steps                JSONB        NOT NULL DEFAULT '[]',
        pdf_path             TEXT,
        error_message        TEXT,
        error_context        JSONB,
        webhook_delivered_at TIMESTAMPTZ,
        webhook_status       SMALLINT,
        webhook_attempts     INTEGER      NOT NULL DEFAULT 0,
        created_by_token     VARCHAR(255),
        created_by_ip        VARCHAR(45),
        user_agent           TEXT,
        last_attempt_at      TIMESTAMPTZ,
        completed_at         TIMESTAMPTZ,
        created_at           TIMESTAMPTZ  NOT NULL DEFAULT now(),
        updated_at           TIMESTAMPTZ  NOT NULL DEFAULT now()
    )
    "#,
    // At most one pending/processing audit per target. Concurrent
    // duplicate submissions collide here and fall back to the reuse
    // lookup; the salted idempotency key alone cannot provide this.
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS uq_audits_active_target
        ON audits (url, strategy)
        WHERE status IN ('pending', 'processing')
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_audits_target
        ON audits (url, strategy, created_at DESC)
    "#,
    r#"CREATE INDEX IF NOT EXISTS idx_audits_status ON audits (status)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_audits_created_at ON audits (created_at)"#,
    r#"
    CREATE TABLE IF NOT EXISTS webhook_deliveries (
        id               BIGSERIAL    PRIMARY KEY,
        audit_id         UUID         NOT NULL REFERENCES audits (id) ON DELETE CASCADE,
        attempt_number   INTEGER      NOT NULL,
        url              TEXT         NOT NULL,
        payload          JSONB        NOT NULL,
        response_status  SMALLINT,
        response_body    TEXT,
        response_time_ms BIGINT,
        error_message    TEXT,
        delivered_at     TIMESTAMPTZ,
        created_at       TIMESTAMPTZ  NOT NULL DEFAULT now()
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_deliveries_audit
        ON webhook_deliveries (audit_id, created_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_deliveries_delivered
        ON webhook_deliveries (delivered_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id             BIGSERIAL    PRIMARY KEY,
        audit_id       UUID         NOT NULL REFERENCES audits (id) ON DELETE CASCADE,
        kind           VARCHAR(32)  NOT NULL,
        status         VARCHAR(16)  NOT NULL DEFAULT 'queued',
        attempt        INTEGER      NOT NULL DEFAULT 0,
        max_attempts   INTEGER      NOT NULL DEFAULT 3,
        deferral_count INTEGER      NOT NULL DEFAULT 0,
        payload        JSONB        NOT NULL DEFAULT '{}',
        last_error     TEXT,
        run_at         TIMESTAMPTZ  NOT NULL DEFAULT now(),
        started_at     TIMESTAMPTZ,
        finished_at    TIMESTAMPTZ,
        created_at     TIMESTAMPTZ  NOT NULL DEFAULT now()
    )
    "#,
    r#"CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs (status, run_at)"#,
    r#"CREATE INDEX IF NOT EXISTS idx_jobs_audit ON jobs (audit_id, kind)"#,
    r#"
    CREATE TABLE IF NOT EXISTS counters (
        key        VARCHAR(255) PRIMARY KEY,
        count      BIGINT       NOT NULL DEFAULT 0,
        expires_at TIMESTAMPTZ  NOT NULL
    )
    "#,
    r#"CREATE INDEX IF NOT EXISTS idx_counters_expiry ON counters (expires_at)"#,
    r#"
    CREATE TABLE IF NOT EXISTS stage_locks (
        key        VARCHAR(255) PRIMARY KEY,
        locked_at  TIMESTAMPTZ  NOT NULL DEFAULT now(),
        expires_at TIMESTAMPTZ  NOT NULL
    )
    "#,
];

pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
