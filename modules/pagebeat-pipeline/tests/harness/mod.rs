//! Harness for pipeline integration tests.
//!
//! Every upstream is faked over real HTTP with wiremock: the
//! measurement API answers `GET /`, the renderer `POST /screenshot`
//! and `POST /pdf`, the webhook receiver `POST /hook`. State lives in
//! a `MemoryStore` and artifacts in a per-test temp dir.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use browserless_client::BrowserlessClient;
use pagebeat_common::config::{
    PipelineConfig, QuotaConfig, StorageConfig, UrlPolicy, WebhookConfig,
};
use pagebeat_common::{Audit, AuditMetrics, AuditStatus, Language, Strategy};
use pagebeat_pipeline::notify::AlertRouter;
use pagebeat_pipeline::PipelineDeps;
use pagebeat_store::MemoryStore;
use pagespeed_client::PageSpeedClient;

pub struct TestStack {
    pub server: MockServer,
    pub store: Arc<MemoryStore>,
    pub deps: PipelineDeps,
    _storage: TempDir,
}

pub async fn stack() -> TestStack {
    stack_with(|_| {}).await
}

/// Build a stack and let the test adjust deps before use.
pub async fn stack_with(tweak: impl FnOnce(&mut PipelineDeps)) -> TestStack {
    let server = MockServer::start().await;
    let store = Arc::new(MemoryStore::new());
    let storage = tempfile::tempdir().expect("temp dir");

    let mut deps = PipelineDeps::builder()
        .audits(store.clone())
        .jobs(store.clone())
        .counters(store.clone())
        .locks(store.clone())
        .pagespeed(Arc::new(PageSpeedClient::new(&server.uri(), None, 5)))
        .renderer(Arc::new(BrowserlessClient::new(&server.uri(), None)))
        .alerts(Arc::new(AlertRouter::disabled(store.clone())))
        .url_policy(UrlPolicy::default())
        .pipeline(PipelineConfig {
            job_max_attempts: 3,
            job_backoff_base_secs: 0,
            require_screenshots: false,
            delete_screenshots_after_pdf: false,
            retry_failed_after_secs: 300,
            pdf_concurrency: 3,
            screenshot_concurrency: 5,
        })
        .quota(QuotaConfig {
            per_minute: 100,
            per_day: 1000,
            warn_fraction: 0.8,
            deferral_delay_secs: 60,
            max_deferrals: 10,
        })
        .webhook(WebhookConfig {
            url: Some(format!("{}/hook", server.uri())),
            secret: Some("test-signing-secret".to_string()),
            timeout_secs: 5,
            max_attempts: 5,
            tolerance_secs: 300,
        })
        .storage(StorageConfig {
            root: storage.path().display().to_string(),
            public_base_url: "https://reports.example.com".to_string(),
        })
        .build();
    tweak(&mut deps);

    TestStack {
        server,
        store,
        deps,
        _storage: storage,
    }
}

/// A `lighthouseResult` document: performance 0.87, localized display
/// values, one failing SEO audit.
pub fn lighthouse_result() -> serde_json::Value {
    json!({
        "finalDisplayedUrl": "https://example.com/",
        "categories": {
            "performance": { "score": 0.87 },
            "seo": { "score": 0.92, "auditRefs": [{ "id": "meta-description" }] },
            "accessibility": { "score": 1.0, "auditRefs": [] }
        },
        "audits": {
            "largest-contentful-paint": { "displayValue": "1.8\u{00A0}s" },
            "first-contentful-paint": { "displayValue": "0.9 s" },
            "cumulative-layout-shift": { "displayValue": "0.05" },
            "meta-description": {
                "score": 0,
                "title": "Document does not have a meta description",
                "description": "Meta descriptions may be included in search results."
            }
        }
    })
}

pub async fn mount_insights_ok(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "lighthouseResult": lighthouse_result() })),
        )
        .mount(server)
        .await;
}

pub async fn mount_screenshot_ok(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/screenshot"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"RIFFfakewebp".to_vec()))
        .mount(server)
        .await;
}

pub async fn mount_pdf_ok(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-1.4 fake".to_vec()))
        .mount(server)
        .await;
}

pub async fn mount_renderer_ok(server: &MockServer) {
    mount_screenshot_ok(server).await;
    mount_pdf_ok(server).await;
}

pub async fn mount_hook(server: &MockServer, status: u16) {
    let body = if (200..300).contains(&status) { "OK" } else { "rejected" };
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(status).set_body_string(body))
        .mount(server)
        .await;
}

/// Requests the server saw for one path, in arrival order.
pub async fn requests_to(server: &MockServer, wanted: &str) -> Vec<Request> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path() == wanted)
        .collect()
}

/// An audit that already went through the pipeline, ready for delivery.
pub fn completed_audit() -> Audit {
    let mut audit = Audit::new(
        "https://example.com".to_string(),
        Strategy::Mobile,
        Language::En,
    );
    audit.status = AuditStatus::Completed;
    audit.score = Some(87);
    audit.metrics = Some(AuditMetrics {
        lcp: "1.8 s".to_string(),
        fcp: "0.9 s".to_string(),
        cls: "0.050".to_string(),
    });
    audit.pdf_path = Some(format!("reports/{}.pdf", audit.id));
    audit.completed_at = Some(Utc::now());
    audit
}
