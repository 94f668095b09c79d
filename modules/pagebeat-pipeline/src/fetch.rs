//! First pipeline stage: run the PageSpeed analysis and persist the
//! extracted insight bundle on the audit row.

use anyhow::anyhow;
use chrono::Utc;
use serde_json::json;
use tracing::info;

use pagebeat_common::{AuditStatus, JobKind, QueuedJob, StepEntry};

use crate::deps::PipelineDeps;
use crate::error::{StageError, StageResult};
use crate::quota::QuotaGovernor;

pub async fn run(deps: &PipelineDeps, job: &QueuedJob) -> StageResult<()> {
    let audit = deps
        .audits
        .get_audit(job.audit_id)
        .await?
        .ok_or_else(|| StageError::permanent(anyhow!("audit {} not found", job.audit_id)))?;

    // A replayed job for a finished audit has nothing left to do.
    if audit.status == AuditStatus::Completed {
        return Ok(());
    }

    deps.audits.mark_processing(audit.id).await?;

    // Spend upstream quota before touching the API; a denial defers the
    // job without charging the attempt.
    QuotaGovernor::new(deps.counters.clone(), deps.quota.clone())
        .admit()
        .await?;

    let strategy = audit.strategy.to_string();
    let bundle = deps.pagespeed.fetch_insights(&audit.url, &strategy).await?;

    let insights = serde_json::to_value(&bundle).map_err(StageError::retryable)?;
    deps.audits.store_insights(audit.id, &insights).await?;
    deps.audits
        .append_step(
            audit.id,
            &StepEntry::completed(
                &JobKind::FetchInsights.to_string(),
                Some(json!({
                    "score": bundle.performance_score,
                    "analyzed_url": bundle.final_url,
                })),
            ),
        )
        .await?;

    deps.jobs
        .enqueue(
            audit.id,
            JobKind::CaptureScreenshots,
            json!({}),
            deps.pipeline.job_max_attempts,
            Utc::now(),
        )
        .await?;

    info!(audit_id = %audit.id, score = bundle.performance_score, "insights fetched");
    Ok(())
}
