use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Semaphore;
use tracing::info;
use tracing_subscriber::EnvFilter;

use browserless_client::BrowserlessClient;
use pagebeat_common::Config;
use pagebeat_pipeline::notify::AlertRouter;
use pagebeat_pipeline::{PipelineDeps, Worker};
use pagebeat_store::{ensure_schema, PgStore};
use pagespeed_client::PageSpeedClient;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("pagebeat=info".parse()?))
        .init();

    info!("Pagebeat worker starting...");

    let config = Config::from_env();

    let store = Arc::new(PgStore::connect(&config.database_url).await?);
    ensure_schema(store.pool()).await?;

    let pagespeed = Arc::new(PageSpeedClient::new(
        &config.insight_api.base_url,
        config.insight_api.api_key.as_deref(),
        config.insight_api.timeout_secs,
    ));
    let renderer = Arc::new(BrowserlessClient::new(
        &config.renderer.base_url,
        config.renderer.token.as_deref(),
    ));
    let alerts = Arc::new(AlertRouter::from_config(&config.alerts, store.clone()));

    let deps = PipelineDeps::builder()
        .audits(store.clone())
        .jobs(store.clone())
        .counters(store.clone())
        .locks(store.clone())
        .pagespeed(pagespeed)
        .renderer(renderer)
        .alerts(alerts)
        .url_policy(config.url_policy.clone())
        .pipeline(config.pipeline.clone())
        .quota(config.quota.clone())
        .webhook(config.webhook.clone())
        .storage(config.storage.clone())
        .screenshot_permits(Arc::new(Semaphore::new(config.pipeline.screenshot_concurrency)))
        .pdf_permits(Arc::new(Semaphore::new(config.pipeline.pdf_concurrency)))
        .build();

    Worker::new(deps, config.worker).run().await
}
