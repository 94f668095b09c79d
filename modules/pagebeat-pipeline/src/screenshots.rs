//! Second pipeline stage: capture desktop and mobile screenshots.
//!
//! The two captures are independent, and one surviving device is
//! enough. Only when both fail does policy apply: with screenshots
//! required the audit fails outright, otherwise the report degrades
//! and the combined failure note travels forward.

use std::path::Path;

use anyhow::anyhow;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use browserless_client::ScreenshotOptions;
use pagebeat_common::{AuditStatus, JobKind, QueuedJob, ScreenshotSet, StepEntry};

use crate::deps::PipelineDeps;
use crate::error::{StageError, StageResult};

pub async fn run(deps: &PipelineDeps, job: &QueuedJob) -> StageResult<()> {
    let audit = deps
        .audits
        .get_audit(job.audit_id)
        .await?
        .ok_or_else(|| StageError::permanent(anyhow!("audit {} not found", job.audit_id)))?;

    if audit.status == AuditStatus::Completed {
        return Ok(());
    }

    let _permit = deps
        .screenshot_permits
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| StageError::retryable(anyhow!("screenshot permit pool closed")))?;

    let dir = Path::new(&deps.storage.root).join("screenshots");
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(StageError::retryable)?;

    let mut set = ScreenshotSet::default();
    let mut failures: Vec<String> = Vec::new();

    let desktop =
        capture_device(deps, &audit.url, audit.id, "desktop", &ScreenshotOptions::desktop(), &dir)
            .await?;
    match desktop {
        Ok(path) => set.desktop = Some(path),
        Err(message) => {
            warn!(audit_id = %audit.id, %message, "desktop screenshot failed");
            failures.push(format!("Desktop: {message}"));
        }
    }

    let mobile =
        capture_device(deps, &audit.url, audit.id, "mobile", &ScreenshotOptions::mobile(), &dir)
            .await?;
    match mobile {
        Ok(path) => set.mobile = Some(path),
        Err(message) => {
            warn!(audit_id = %audit.id, %message, "mobile screenshot failed");
            failures.push(format!("Mobile: {message}"));
        }
    }

    if !failures.is_empty() {
        set.error = Some(failures.join(" | "));
        set.failed = set.is_empty();
    }

    deps.audits.store_screenshots(audit.id, &set).await?;

    // Policy failure, not a transient one: both devices came back empty
    // and the operator requires screenshots. Retrying the stage would
    // rerun both captures for nothing.
    if set.is_empty() && deps.pipeline.require_screenshots {
        return Err(StageError::permanent(anyhow!(
            "screenshot capture failed: {}",
            set.error.clone().unwrap_or_default()
        )));
    }

    let step_name = JobKind::CaptureScreenshots.to_string();
    let step_data = json!({
        "desktop": set.desktop.clone(),
        "mobile": set.mobile.clone(),
        "error": set.error.clone(),
    });
    let step = if failures.is_empty() {
        StepEntry::completed(&step_name, Some(step_data))
    } else {
        StepEntry::completed_with_warnings(&step_name, Some(step_data))
    };
    deps.audits.append_step(audit.id, &step).await?;

    deps.jobs
        .enqueue(
            audit.id,
            JobKind::GeneratePdf,
            json!({}),
            deps.pipeline.job_max_attempts,
            Utc::now(),
        )
        .await?;

    info!(
        audit_id = %audit.id,
        desktop = set.desktop.is_some(),
        mobile = set.mobile.is_some(),
        "screenshots captured"
    );
    Ok(())
}

/// One device capture. An inner `Err` is a tolerated device failure;
/// the outer error is a stage-level problem (a file that cannot be
/// written helps nobody on either device).
async fn capture_device(
    deps: &PipelineDeps,
    url: &str,
    audit_id: Uuid,
    device: &str,
    options: &ScreenshotOptions,
    dir: &Path,
) -> StageResult<Result<String, String>> {
    match deps.renderer.screenshot(url, options).await {
        Ok(bytes) => {
            let filename = format!("{audit_id}_{device}.webp");
            tokio::fs::write(dir.join(&filename), &bytes)
                .await
                .map_err(StageError::retryable)?;
            Ok(Ok(format!("screenshots/{filename}")))
        }
        Err(error) => Ok(Err(error.to_string())),
    }
}
