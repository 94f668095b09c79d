use std::sync::Arc;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use browserless_client::BrowserlessClient;
use pagebeat_common::config::{ApiToken, ThrottleConfig};
use pagebeat_common::Config;
use pagebeat_pipeline::notify::AlertRouter;
use pagebeat_pipeline::PipelineDeps;
use pagebeat_store::{ensure_schema, PgStore};
use pagespeed_client::PageSpeedClient;

mod auth;
mod rest;
mod throttle;

pub struct AppState {
    pub deps: PipelineDeps,
    pub api_tokens: Vec<ApiToken>,
    pub throttle: ThrottleConfig,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/scan", post(rest::scan::api_scan))
        .route("/v1/audits/{id}", get(rest::audits::api_audit_detail))
        .route("/v1/stats", get(rest::stats::api_stats))
        .route("/health", get(rest::health::api_health))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("pagebeat=info".parse()?))
        .init();

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
        .build();

    let state = Arc::new(AppState {
        deps,
        api_tokens: config.api_tokens.clone(),
        throttle: config.throttle.clone(),
    });

    let app = router(state);

    let addr = format!("{}:{}", config.bind_host, config.bind_port);
    info!(%addr, "Pagebeat API listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::Body;
    use axum::extract::connect_info::ConnectInfo;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use pagebeat_common::config::{
        PipelineConfig, QuotaConfig, StorageConfig, UrlPolicy, WebhookConfig,
    };
    use pagebeat_store::{JobQueue, MemoryStore};

    /// Offline app: in-memory store, HTTP clients aimed at a closed
    /// port, no credentials configured.
    fn test_state(store: Arc<MemoryStore>, tokens: Vec<ApiToken>) -> Arc<AppState> {
        let deps = PipelineDeps::builder()
            .audits(store.clone())
            .jobs(store.clone())
            .counters(store.clone())
            .locks(store.clone())
            .pagespeed(Arc::new(PageSpeedClient::new("http://127.0.0.1:9", None, 1)))
            .renderer(Arc::new(BrowserlessClient::new("http://127.0.0.1:9", None)))
            .alerts(Arc::new(AlertRouter::disabled(store)))
            .url_policy(UrlPolicy::default())
            .pipeline(PipelineConfig::default())
            .quota(QuotaConfig::default())
            .webhook(WebhookConfig::default())
            .storage(StorageConfig {
                root: "./storage".to_string(),
                public_base_url: "http://localhost:3000".to_string(),
            })
            .build();
        Arc::new(AppState {
            deps,
            api_tokens: tokens,
            throttle: ThrottleConfig::default(),
        })
    }

    fn scan_request(body: Value, bearer: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/v1/scan")
            .header("content-type", "application/json")
            .header("user-agent", "pagebeat-tests/1.0");
        if let Some(token) = bearer {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let mut request = builder.body(Body::from(body.to_string())).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(std::net::SocketAddr::from(([203, 0, 113, 7], 40000))));
        request
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_scan_accepts_and_queues() {
        let store = Arc::new(MemoryStore::new());
        let app = router(test_state(store.clone(), Vec::new()));

        let response = app
            .oneshot(scan_request(
                json!({"url": "https://example.com", "strategy": "mobile", "lang": "en"}),
                None,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert!(response.headers().contains_key("x-ratelimit-limit"));
        assert!(response.headers().contains_key("x-ratelimit-remaining"));

        let body = body_json(response).await;
        assert_eq!(body["message"], "Audit queued");
        assert_eq!(body["status"], "pending");
        assert_eq!(body["url"], "https://example.com/");
        assert!(body["audit_id"].is_string());

        assert_eq!(store.claim_due(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_scan_defaults_lang_and_strategy() {
        let store = Arc::new(MemoryStore::new());
        let app = router(test_state(store, Vec::new()));

        let response = app
            .oneshot(scan_request(json!({"url": "https://example.com"}), None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        assert_eq!(body["lang"], "en");
        assert_eq!(body["strategy"], "mobile");
    }

    #[tokio::test]
    async fn test_scan_repeat_submission_returns_same_audit() {
        let store = Arc::new(MemoryStore::new());
        let state = test_state(store.clone(), Vec::new());

        let first = router(state.clone())
            .oneshot(scan_request(json!({"url": "https://example.com"}), None))
            .await
            .unwrap();
        let second = router(state)
            .oneshot(scan_request(json!({"url": "https://example.com"}), None))
            .await
            .unwrap();

        let first = body_json(first).await;
        let second = body_json(second).await;
        assert_eq!(first["audit_id"], second["audit_id"]);
        assert_eq!(store.claim_due(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_scan_validation_messages() {
        let cases = [
            (json!({}), "The URL field is required"),
            (json!({"url": "  "}), "The URL field is required"),
            (
                json!({"url": "https://example.com", "lang": "fr"}),
                "The language must be one of: en, pt_BR, es",
            ),
            (
                json!({"url": "https://example.com", "strategy": "tablet"}),
                "The strategy must be either mobile or desktop",
            ),
            (
                json!({"url": "ftp://example.com"}),
                "Only http and https schemes are allowed, got: ftp",
            ),
        ];

        for (body, expected) in cases {
            let app = router(test_state(Arc::new(MemoryStore::new()), Vec::new()));
            let response = app.oneshot(scan_request(body, None)).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
            let body = body_json(response).await;
            assert_eq!(body["message"], "Invalid request");
            assert_eq!(body["error"], expected);
        }
    }

    #[tokio::test]
    async fn test_scan_requires_a_known_token_when_configured() {
        let tokens = vec![ApiToken { id: "ci".to_string(), token: "secret-1".to_string() }];
        let state = test_state(Arc::new(MemoryStore::new()), tokens);

        let response = router(state.clone())
            .oneshot(scan_request(json!({"url": "https://example.com"}), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["message"], "Unauthenticated");

        let response = router(state)
            .oneshot(scan_request(json!({"url": "https://example.com"}), Some("secret-1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_scan_throttles_with_retry_after() {
        let store = Arc::new(MemoryStore::new());
        let mut state = test_state(store, Vec::new());
        Arc::get_mut(&mut state).unwrap().throttle.per_minute = 1;

        let response = router(state.clone())
            .oneshot(scan_request(json!({"url": "https://example.com"}), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        // Different URL so the second request is not an idempotent reuse.
        let response = router(state)
            .oneshot(scan_request(json!({"url": "https://example.org"}), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key("retry-after"));
        let body = body_json(response).await;
        assert_eq!(body["message"], crate::throttle::MINUTE_MESSAGE);
        assert!(body["retry_after"].as_i64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn test_audit_detail_and_missing_audit() {
        let store = Arc::new(MemoryStore::new());
        let state = test_state(store, Vec::new());

        let created = router(state.clone())
            .oneshot(scan_request(json!({"url": "https://example.com"}), None))
            .await
            .unwrap();
        let audit_id = body_json(created).await["audit_id"].as_str().unwrap().to_string();

        let response = router(state.clone())
            .oneshot(
                Request::builder()
                    .uri(format!("/v1/audits/{audit_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["id"], audit_id.as_str());
        assert_eq!(body["status"], "pending");
        assert!(body["score"].is_null());
        assert!(body["pdf_url"].is_null());

        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri(format!("/v1/audits/{}", uuid::Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stats_counts_submissions() {
        let store = Arc::new(MemoryStore::new());
        let state = test_state(store, Vec::new());

        router(state.clone())
            .oneshot(scan_request(json!({"url": "https://example.com"}), None))
            .await
            .unwrap();

        let response = router(state)
            .oneshot(Request::builder().uri("/v1/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        // The submission may straddle a minute boundary mid-test; the
        // month window cannot.
        assert_eq!(body["month"], 1);
        assert!(body["minute"].as_i64().is_some());
    }

    #[tokio::test]
    async fn test_health_reports_unreachable_renderer() {
        let state = test_state(Arc::new(MemoryStore::new()), Vec::new());

        let response = router(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["status"], "unhealthy");
        assert_eq!(body["checks"]["renderer"], "fail");
        assert_eq!(body["checks"]["database"], "ok");
        assert_eq!(body["checks"]["cache"], "ok");
        assert_eq!(body["metrics"]["queue_depth"], 0);
    }
}
