use std::sync::Arc;

use browserless_client::BrowserlessClient;
use pagebeat_common::config::{
    PipelineConfig, QuotaConfig, StorageConfig, UrlPolicy, WebhookConfig,
};
use pagebeat_store::MemoryStore;
use pagespeed_client::PageSpeedClient;

use crate::deps::PipelineDeps;
use crate::notify::AlertRouter;

/// Offline pipeline deps: in-memory store, HTTP clients aimed at a
/// closed port, alerts disabled. Tests that need a live endpoint swap
/// in wiremock URIs through the builder instead.
pub(crate) fn test_deps(store: Arc<MemoryStore>) -> PipelineDeps {
    PipelineDeps::builder()
        .audits(store.clone())
        .jobs(store.clone())
        .counters(store.clone())
        .locks(store.clone())
        .pagespeed(Arc::new(PageSpeedClient::new("http://127.0.0.1:9", None, 1)))
        .renderer(Arc::new(BrowserlessClient::new("http://127.0.0.1:9", None)))
        .alerts(Arc::new(AlertRouter::disabled(store)))
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
            url: None,
            secret: None,
            timeout_secs: 5,
            max_attempts: 5,
            tolerance_secs: 300,
        })
        .storage(StorageConfig {
            root: "./storage".to_string(),
            public_base_url: "http://localhost:3000".to_string(),
        })
        .build()
}
