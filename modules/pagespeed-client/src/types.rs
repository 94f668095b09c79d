use serde::{Deserialize, Serialize};

use crate::error::{PageSpeedError, Result};

/// Extracted measurement data carried between pipeline stages.
/// Display values stay in the API's localized form; formatting happens
/// where the report is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsightBundle {
    pub final_url: String,
    /// Performance category score, 0.0 to 1.0.
    pub performance_score: f64,
    pub lcp_display: Option<String>,
    pub fcp_display: Option<String>,
    pub cls_display: Option<String>,
    pub seo: CategoryReport,
    pub accessibility: CategoryReport,
}

/// Summary for a non-performance category: score plus the audits that
/// did not pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryReport {
    pub score: f64,
    pub failed_audits: Vec<FailedAudit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedAudit {
    pub id: String,
    pub title: String,
    pub description: String,
}

impl InsightBundle {
    /// Extract the bundle from a raw `lighthouseResult` document.
    pub fn from_lighthouse_result(result: &serde_json::Value) -> Result<Self> {
        let performance_score = result
            .pointer("/categories/performance/score")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| {
                PageSpeedError::Parse("lighthouseResult missing performance score".to_string())
            })?;

        Ok(Self {
            final_url: result
                .get("finalDisplayedUrl")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            performance_score,
            lcp_display: display_value(result, "largest-contentful-paint"),
            fcp_display: display_value(result, "first-contentful-paint"),
            cls_display: display_value(result, "cumulative-layout-shift"),
            seo: CategoryReport::extract(result, "seo"),
            accessibility: CategoryReport::extract(result, "accessibility"),
        })
    }
}

impl CategoryReport {
    /// A missing category yields score 0 and no audit details rather
    /// than failing the whole extraction.
    fn extract(result: &serde_json::Value, category: &str) -> Self {
        let Some(cat) = result.pointer(&format!("/categories/{category}")) else {
            return Self::default();
        };

        let score = cat.get("score").and_then(|v| v.as_f64()).unwrap_or(0.0);

        let mut failed_audits = Vec::new();
        let refs = cat
            .get("auditRefs")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        for audit_ref in refs {
            let Some(id) = audit_ref.get("id").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some(audit) = result.pointer(&format!("/audits/{id}")) else {
                continue;
            };
            // Informative audits carry a null score and are not failures.
            let Some(audit_score) = audit.get("score").and_then(|v| v.as_f64()) else {
                continue;
            };
            if audit_score < 1.0 {
                failed_audits.push(FailedAudit {
                    id: id.to_string(),
                    title: audit
                        .get("title")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    description: audit
                        .get("description")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string(),
                });
            }
        }

        Self {
            score,
            failed_audits,
        }
    }
}

fn display_value(result: &serde_json::Value, audit_id: &str) -> Option<String> {
    result
        .pointer(&format!("/audits/{audit_id}/displayValue"))
        .and_then(|v| v.as_str())
        .map(String::from)
}
