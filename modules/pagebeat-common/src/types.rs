use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Enums ---

/// Measurement strategy requested for an audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Mobile,
    Desktop,
}

impl Strategy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mobile" => Some(Strategy::Mobile),
            "desktop" => Some(Strategy::Desktop),
            _ => None,
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::Mobile => write!(f, "mobile"),
            Strategy::Desktop => write!(f, "desktop"),
        }
    }
}

/// Report language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Language {
    #[serde(rename = "en")]
    En,
    #[serde(rename = "pt_BR")]
    PtBr,
    #[serde(rename = "es")]
    Es,
}

impl Language {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "en" => Some(Language::En),
            "pt_BR" => Some(Language::PtBr),
            "es" => Some(Language::Es),
            _ => None,
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Language::En => write!(f, "en"),
            Language::PtBr => write!(f, "pt_BR"),
            Language::Es => write!(f, "es"),
        }
    }
}

/// Audit lifecycle status. Transitions are monotonic
/// (pending → processing → completed | failed) except that a failed
/// audit may re-enter processing on a manual retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl AuditStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AuditStatus::Pending),
            "processing" => Some(AuditStatus::Processing),
            "completed" => Some(AuditStatus::Completed),
            "failed" => Some(AuditStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditStatus::Pending => write!(f, "pending"),
            AuditStatus::Processing => write!(f, "processing"),
            AuditStatus::Completed => write!(f, "completed"),
            AuditStatus::Failed => write!(f, "failed"),
        }
    }
}

// --- Step Ledger ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    CompletedWithWarnings,
    Failed,
}

/// One entry in an audit's ordered processing ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEntry {
    pub name: String,
    pub status: StepStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepEntry {
    pub fn completed(name: &str, data: Option<serde_json::Value>) -> Self {
        Self {
            name: name.to_string(),
            status: StepStatus::Completed,
            timestamp: Utc::now(),
            data,
            error: None,
        }
    }

    pub fn completed_with_warnings(name: &str, data: Option<serde_json::Value>) -> Self {
        Self {
            name: name.to_string(),
            status: StepStatus::CompletedWithWarnings,
            timestamp: Utc::now(),
            data,
            error: None,
        }
    }

    pub fn failed(name: &str, error: String, data: Option<serde_json::Value>) -> Self {
        Self {
            name: name.to_string(),
            status: StepStatus::Failed,
            timestamp: Utc::now(),
            data,
            error: Some(error),
        }
    }
}

// --- Screenshots ---

/// Capture results carried out of the screenshot stage. `failed` means
/// neither device produced a file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScreenshotSet {
    pub desktop: Option<String>,
    pub mobile: Option<String>,
    pub failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScreenshotSet {
    pub fn is_empty(&self) -> bool {
        self.desktop.is_none() && self.mobile.is_none()
    }
}

// --- Metrics ---

/// Formatted metric display strings persisted on a completed audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditMetrics {
    pub lcp: String,
    pub fcp: String,
    pub cls: String,
}

impl Default for AuditMetrics {
    fn default() -> Self {
        Self {
            lcp: "N/A".to_string(),
            fcp: "N/A".to_string(),
            cls: "N/A".to_string(),
        }
    }
}

// --- Audit ---

/// One requested performance check and its full lifecycle record.
/// The persisted row is the single source of truth for cross-stage state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audit {
    pub id: Uuid,
    pub idempotency_key: String,
    pub url: String,
    pub strategy: Strategy,
    pub lang: Language,
    pub status: AuditStatus,
    pub score: Option<i16>,
    pub metrics: Option<AuditMetrics>,
    pub insights: Option<serde_json::Value>,
    pub screenshots: Option<ScreenshotSet>,
    pub steps: Vec<StepEntry>,
    pub pdf_path: Option<String>,
    pub error_message: Option<String>,
    pub error_context: Option<serde_json::Value>,
    pub webhook_delivered_at: Option<DateTime<Utc>>,
    pub webhook_status: Option<i16>,
    pub webhook_attempts: i32,
    pub created_by_token: Option<String>,
    pub created_by_ip: Option<String>,
    pub user_agent: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Audit {
    /// A fresh pending audit with a salted idempotency key.
    pub fn new(url: String, strategy: Strategy, lang: Language) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            idempotency_key: generate_idempotency_key(&url, strategy),
            url,
            strategy,
            lang,
            status: AuditStatus::Pending,
            score: None,
            metrics: None,
            insights: None,
            screenshots: None,
            steps: Vec::new(),
            pdf_path: None,
            error_message: None,
            error_context: None,
            webhook_delivered_at: None,
            webhook_status: None,
            webhook_attempts: 0,
            created_by_token: None,
            created_by_ip: None,
            user_agent: None,
            last_attempt_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Public download URL for the generated report, if one exists.
    pub fn pdf_url(&self, public_base_url: &str) -> Option<String> {
        let path = self.pdf_path.as_deref()?;
        let filename = path.rsplit('/').next().unwrap_or(path);
        Some(format!(
            "{}/reports/{filename}",
            public_base_url.trim_end_matches('/')
        ))
    }
}

/// Storage uniqueness key: SHA-256 over url, strategy, a nanosecond
/// timestamp, and 16 random bytes. The salt makes collisions between
/// distinct submissions practically impossible; deduplication is the
/// reuse lookup, not this key.
pub fn generate_idempotency_key(url: &str, strategy: Strategy) -> String {
    use rand::RngCore;
    use sha2::{Digest, Sha256};

    let mut salt = [0u8; 16];
    rand::rng().fill_bytes(&mut salt);
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update(strategy.to_string().as_bytes());
    hasher.update(nanos.to_le_bytes());
    hasher.update(salt);
    hex::encode(hasher.finalize())
}

// --- Jobs ---

/// Work item kinds flowing through the queue. The first three double as
/// step-ledger names for their stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    FetchInsights,
    CaptureScreenshots,
    GeneratePdf,
    DeliverWebhook,
}

impl JobKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fetch_insights" => Some(JobKind::FetchInsights),
            "capture_screenshots" => Some(JobKind::CaptureScreenshots),
            "generate_pdf" => Some(JobKind::GeneratePdf),
            "deliver_webhook" => Some(JobKind::DeliverWebhook),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::FetchInsights => write!(f, "fetch_insights"),
            JobKind::CaptureScreenshots => write!(f, "capture_screenshots"),
            JobKind::GeneratePdf => write!(f, "generate_pdf"),
            JobKind::DeliverWebhook => write!(f, "deliver_webhook"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One unit of work in the queue. `deferral_count` tracks quota waits,
/// which are rescheduled without charging an attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: i64,
    pub audit_id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    pub attempt: i32,
    pub max_attempts: i32,
    pub deferral_count: i32,
    pub payload: serde_json::Value,
    pub last_error: Option<String>,
    pub run_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// --- Webhook Deliveries ---

/// One webhook delivery attempt. Rows are append-only and immutable;
/// `delivered_at` is set only for 2xx responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: i64,
    pub audit_id: Uuid,
    pub attempt_number: i32,
    pub url: String,
    pub payload: serde_json::Value,
    pub response_status: Option<i16>,
    pub response_body: Option<String>,
    pub response_time_ms: Option<i64>,
    pub error_message: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_keys_are_distinct_for_identical_input() {
        let a = generate_idempotency_key("https://example.com", Strategy::Mobile);
        let b = generate_idempotency_key("https://example.com", Strategy::Mobile);
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }

    #[test]
    fn test_language_serializes_with_original_casing() {
        assert_eq!(
            serde_json::to_string(&Language::PtBr).unwrap(),
            "\"pt_BR\""
        );
        let parsed: Language = serde_json::from_str("\"pt_BR\"").unwrap();
        assert_eq!(parsed, Language::PtBr);
    }

    #[test]
    fn test_pdf_url_uses_report_filename_only() {
        let mut audit = Audit::new(
            "https://example.com".to_string(),
            Strategy::Mobile,
            Language::En,
        );
        assert_eq!(audit.pdf_url("https://pagebeat.io"), None);

        audit.pdf_path = Some(format!("/var/storage/reports/{}.pdf", audit.id));
        assert_eq!(
            audit.pdf_url("https://pagebeat.io/"),
            Some(format!("https://pagebeat.io/reports/{}.pdf", audit.id))
        );
    }

    #[test]
    fn test_failed_step_carries_error() {
        let step = StepEntry::failed("fetch_insights", "boom".to_string(), None);
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.error.as_deref(), Some("boom"));

        let json = serde_json::to_value(&step).unwrap();
        assert!(json.get("data").is_none());
    }
}
