use std::sync::Arc;

use tokio::sync::Semaphore;
use typed_builder::TypedBuilder;

use browserless_client::BrowserlessClient;
use pagebeat_common::config::{PipelineConfig, QuotaConfig, StorageConfig, UrlPolicy, WebhookConfig};
use pagebeat_store::{AuditStore, CounterStore, JobQueue, LockStore};
use pagespeed_client::PageSpeedClient;

use crate::notify::AlertRouter;

/// Everything a stage needs, behind one cloneable handle. The four store
/// traits usually point at one `PgStore`, but tests swap in a
/// `MemoryStore` and wiremock-backed clients.
#[derive(Clone, TypedBuilder)]
pub struct PipelineDeps {
    pub audits: Arc<dyn AuditStore>,
    pub jobs: Arc<dyn JobQueue>,
    pub counters: Arc<dyn CounterStore>,
    pub locks: Arc<dyn LockStore>,

    pub pagespeed: Arc<PageSpeedClient>,
    pub renderer: Arc<BrowserlessClient>,
    pub alerts: Arc<AlertRouter>,

    pub url_policy: UrlPolicy,
    pub pipeline: PipelineConfig,
    pub quota: QuotaConfig,
    pub webhook: WebhookConfig,
    pub storage: StorageConfig,

    /// Shared HTTP client for webhook posts.
    #[builder(default = reqwest::Client::new())]
    pub http: reqwest::Client,

    /// Renderer admission: screenshots and PDFs contend for the headless
    /// browser, so each gets its own permit pool.
    #[builder(default = Arc::new(Semaphore::new(5)))]
    pub screenshot_permits: Arc<Semaphore>,
    #[builder(default = Arc::new(Semaphore::new(3)))]
    pub pdf_permits: Arc<Semaphore>,
}
