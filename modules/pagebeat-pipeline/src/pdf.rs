//! Third pipeline stage: render the report PDF, mark the audit
//! complete, and hand off to webhook delivery.
//!
//! Rendering is the expensive step, so it is double-gated: a per-audit
//! lease stops two workers from rendering the same report, and a permit
//! pool caps how many renders hit the headless browser at once.

use std::path::Path;

use anyhow::anyhow;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use pagebeat_common::{
    Audit, AuditMetrics, AuditStatus, JobKind, MetricValue, QueuedJob, Score, StepEntry,
};
use pagespeed_client::InsightBundle;

use crate::deps::PipelineDeps;
use crate::error::{StageError, StageResult};
use crate::report::{self, ScreenshotImages};

const LOCK_TTL_SECS: i64 = 300;

pub async fn run(deps: &PipelineDeps, job: &QueuedJob) -> StageResult<()> {
    let audit = deps
        .audits
        .get_audit(job.audit_id)
        .await?
        .ok_or_else(|| StageError::permanent(anyhow!("audit {} not found", job.audit_id)))?;

    if audit.status == AuditStatus::Completed {
        return Ok(());
    }

    let lock_key = format!("pdf:{}", audit.id);
    if !deps.locks.acquire(&lock_key, LOCK_TTL_SECS).await? {
        return Err(StageError::Busy(format!(
            "PDF for audit {} is already rendering",
            audit.id
        )));
    }

    let result = render_and_complete(deps, &audit).await;
    if let Err(error) = deps.locks.release(&lock_key).await {
        warn!(%lock_key, %error, "failed to release render lease");
    }
    result
}

async fn render_and_complete(deps: &PipelineDeps, audit: &Audit) -> StageResult<()> {
    let _permit = deps
        .pdf_permits
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| StageError::retryable(anyhow!("pdf permit pool closed")))?;

    // A corrupt or missing insights row cannot repair itself by retry.
    let insights = audit
        .insights
        .clone()
        .ok_or_else(|| StageError::permanent(anyhow!("audit {} has no stored insights", audit.id)))?;
    let bundle: InsightBundle = serde_json::from_value(insights).map_err(StageError::permanent)?;
    let score = Score::new(bundle.performance_score).map_err(StageError::permanent)?;

    let images = load_screenshots(&deps.storage.root, audit).await;
    let html = report::render(audit, &bundle, score, &images);
    let pdf_bytes = deps.renderer.pdf(&html).await?;

    let dir = Path::new(&deps.storage.root).join("reports");
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(StageError::retryable)?;
    let filename = format!("{}.pdf", audit.id);
    tokio::fs::write(dir.join(&filename), &pdf_bytes)
        .await
        .map_err(StageError::retryable)?;
    let pdf_path = format!("reports/{filename}");

    let metrics = AuditMetrics {
        lcp: formatted_metric(bundle.lcp_display.as_deref()),
        fcp: formatted_metric(bundle.fcp_display.as_deref()),
        cls: formatted_metric(bundle.cls_display.as_deref()),
    };
    deps.audits
        .mark_completed(audit.id, score.to_percentage(), &metrics, &pdf_path)
        .await?;
    deps.audits
        .append_step(
            audit.id,
            &StepEntry::completed(
                &JobKind::GeneratePdf.to_string(),
                Some(json!({ "pdf_path": pdf_path, "score": score.to_percentage() })),
            ),
        )
        .await?;

    if deps.pipeline.delete_screenshots_after_pdf {
        delete_screenshot_files(&deps.storage.root, audit).await;
    }

    if deps.webhook.url.is_some() {
        deps.jobs
            .enqueue(
                audit.id,
                JobKind::DeliverWebhook,
                json!({}),
                deps.webhook.max_attempts,
                Utc::now(),
            )
            .await?;
    }

    info!(audit_id = %audit.id, score = score.to_percentage(), "audit completed");
    Ok(())
}

fn formatted_metric(display: Option<&str>) -> String {
    display
        .map(|d| MetricValue::from_display_value(d).format())
        .unwrap_or_else(|| "N/A".to_string())
}

async fn load_screenshots(root: &str, audit: &Audit) -> ScreenshotImages {
    let mut images = ScreenshotImages::default();
    let Some(set) = &audit.screenshots else {
        return images;
    };
    images.desktop = load_image(root, set.desktop.as_deref()).await;
    images.mobile = load_image(root, set.mobile.as_deref()).await;
    images
}

async fn load_image(root: &str, relative: Option<&str>) -> Option<String> {
    let relative = relative?;
    match tokio::fs::read(Path::new(root).join(relative)).await {
        Ok(bytes) => Some(format!("data:image/webp;base64,{}", BASE64.encode(&bytes))),
        Err(error) => {
            warn!(%relative, %error, "screenshot file unreadable, omitting from report");
            None
        }
    }
}

/// Screenshots are embedded in the PDF by now; the loose files only
/// take up disk.
async fn delete_screenshot_files(root: &str, audit: &Audit) {
    let Some(set) = &audit.screenshots else { return };
    for relative in [set.desktop.as_deref(), set.mobile.as_deref()].into_iter().flatten() {
        if let Err(error) = tokio::fs::remove_file(Path::new(root).join(relative)).await {
            if error.kind() != std::io::ErrorKind::NotFound {
                warn!(%relative, %error, "failed to delete screenshot file");
            }
        }
    }
}
