//! Submission admission: URL vetting, reuse of in-flight audits, and
//! race-safe creation.
//!
//! Concurrent submissions for the same target are collapsed by the
//! store's one-active-audit-per-target constraint: whoever loses the
//! insert race re-runs the reuse lookup and walks away with the winner's
//! audit. Creation side effects (usage counters, the first pipeline job)
//! happen only on the winning path.

use anyhow::anyhow;
use chrono::{Duration, Utc};
use serde_json::json;
use tracing::{info, warn};

use pagebeat_common::{Audit, AuditStatus, JobKind, Language, PagebeatError, SafeUrl, Strategy};

use crate::deps::PipelineDeps;

const CREATE_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub url: String,
    pub strategy: Strategy,
    pub lang: Language,
    pub token_id: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug)]
pub enum SubmitOutcome {
    Created(Audit),
    Reused(Audit),
}

impl SubmitOutcome {
    pub fn audit(&self) -> &Audit {
        match self {
            Self::Created(audit) | Self::Reused(audit) => audit,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

pub async fn submit(
    deps: &PipelineDeps,
    req: SubmitRequest,
) -> Result<SubmitOutcome, PagebeatError> {
    let safe = SafeUrl::parse(&req.url, &deps.url_policy).await?;
    let url = safe.as_str().to_string();

    // Fast path: the target already has an audit in flight, or one that
    // failed too recently to hammer again.
    if let Some(existing) = reusable(deps, &url, req.strategy).await? {
        info!(audit_id = %existing.id, %url, "reusing existing audit");
        return Ok(SubmitOutcome::Reused(existing));
    }

    let mut delay = std::time::Duration::from_millis(10);
    for _ in 0..CREATE_ATTEMPTS {
        let mut audit = Audit::new(url.clone(), req.strategy, req.lang);
        audit.created_by_token = req.token_id.clone();
        audit.created_by_ip = req.ip.clone();
        audit.user_agent = req.user_agent.clone();

        if deps.audits.insert_audit(&audit).await? {
            record_submission_counters(deps).await;
            deps.jobs
                .enqueue(
                    audit.id,
                    JobKind::FetchInsights,
                    json!({}),
                    deps.pipeline.job_max_attempts,
                    Utc::now(),
                )
                .await?;
            info!(audit_id = %audit.id, %url, strategy = %req.strategy, "audit queued");
            return Ok(SubmitOutcome::Created(audit));
        }

        // Lost the insert race. The winner's audit is usually reusable;
        // when it is not (it already finished), take another swing.
        if let Some(existing) = reusable(deps, &url, req.strategy).await? {
            info!(audit_id = %existing.id, %url, "reusing audit created concurrently");
            return Ok(SubmitOutcome::Reused(existing));
        }
        tokio::time::sleep(delay).await;
        delay *= 2;
    }

    Err(anyhow!("could not create audit for {url} after {CREATE_ATTEMPTS} attempts").into())
}

/// The newest audit for a target, when its state warrants handing it
/// back instead of creating a fresh one.
async fn reusable(
    deps: &PipelineDeps,
    url: &str,
    strategy: Strategy,
) -> Result<Option<Audit>, PagebeatError> {
    let Some(existing) = deps.audits.newest_for_target(url, strategy).await? else {
        return Ok(None);
    };
    let reuse = match existing.status {
        AuditStatus::Pending | AuditStatus::Processing => true,
        AuditStatus::Failed => {
            let cooloff = Duration::seconds(deps.pipeline.retry_failed_after_secs);
            existing.created_at > Utc::now() - cooloff
        }
        AuditStatus::Completed => false,
    };
    Ok(reuse.then_some(existing))
}

/// Usage counters feed the stats endpoint. Best effort: a counter
/// hiccup must not reject a submission that already exists.
async fn record_submission_counters(deps: &PipelineDeps) {
    let now = Utc::now();
    let windows = [
        (format!("scans:minute:{}", now.format("%Y-%m-%d-%H-%M")), now + Duration::minutes(5)),
        (format!("scans:hour:{}", now.format("%Y-%m-%d-%H")), now + Duration::hours(2)),
        (format!("scans:day:{}", now.format("%Y-%m-%d")), now + Duration::days(2)),
        (format!("scans:month:{}", now.format("%Y-%m")), now + Duration::days(35)),
    ];
    for (key, expires_at) in windows {
        if let Err(error) = deps.counters.incr(&key, expires_at).await {
            warn!(%key, %error, "failed to record submission counter");
        }
    }
}
