use std::env;

/// Admission policy for submitted URLs.
#[derive(Debug, Clone, Default)]
pub struct UrlPolicy {
    /// Enforce host and network checks. Off for local development so
    /// http://localhost targets stay reachable.
    pub restricted: bool,
    /// Domains rejected outright, matched case-insensitively as exact
    /// host or dot-suffix.
    pub blocked_domains: Vec<String>,
}

/// Outbound webhook delivery settings.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: Option<String>,
    pub secret: Option<String>,
    pub timeout_secs: u64,
    pub max_attempts: i32,
    /// Receiver-side timestamp skew tolerance for signature verification.
    pub tolerance_secs: i64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            secret: None,
            timeout_secs: 30,
            max_attempts: 5,
            tolerance_secs: 300,
        }
    }
}

/// Caller-facing rate limits, per token plus one global ceiling.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    pub per_minute: i64,
    pub per_hour: i64,
    pub per_day: i64,
    pub global_per_minute: i64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            per_minute: 10,
            per_hour: 100,
            per_day: 1000,
            global_per_minute: 30,
        }
    }
}

/// Upstream measurement API budget.
#[derive(Debug, Clone)]
pub struct QuotaConfig {
    pub per_minute: i64,
    pub per_day: i64,
    /// Usage fraction of either window that triggers a warning log.
    pub warn_fraction: f64,
    /// Reschedule delay for quota-denied jobs; these do not charge an attempt.
    pub deferral_delay_secs: i64,
    /// Deferrals allowed before the denial becomes permanent.
    pub max_deferrals: i32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            per_minute: 6,
            per_day: 25_000,
            warn_fraction: 0.8,
            deferral_delay_secs: 60,
            max_deferrals: 10,
        }
    }
}

/// Stage retry policy and pipeline behavior.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub job_max_attempts: i32,
    pub job_backoff_base_secs: i64,
    /// When set, an audit fails if both screenshots fail; otherwise the
    /// PDF is generated without them.
    pub require_screenshots: bool,
    pub delete_screenshots_after_pdf: bool,
    /// Failed audits younger than this are returned as-is on resubmission.
    pub retry_failed_after_secs: i64,
    pub pdf_concurrency: usize,
    pub screenshot_concurrency: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            job_max_attempts: 3,
            job_backoff_base_secs: 30,
            require_screenshots: false,
            delete_screenshots_after_pdf: true,
            retry_failed_after_secs: 300,
            pdf_concurrency: 3,
            screenshot_concurrency: 5,
        }
    }
}

/// Worker loop behavior.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// In-flight job cap for one worker process.
    pub concurrency: usize,
    pub poll_interval_secs: u64,
    /// Completed-but-undelivered audits re-enqueued per sweep.
    pub redelivery_batch: i64,
    pub housekeeping_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            poll_interval_secs: 2,
            redelivery_batch: 50,
            housekeeping_interval_secs: 60,
        }
    }
}

/// Headless renderer endpoint (screenshots and PDFs).
#[derive(Debug, Clone)]
pub struct RendererConfig {
    pub base_url: String,
    pub token: Option<String>,
}

/// Measurement API endpoint.
#[derive(Debug, Clone)]
pub struct InsightApiConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for InsightApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.googleapis.com/pagespeedonline/v5/runPagespeed".to_string(),
            api_key: None,
            timeout_secs: 60,
        }
    }
}

/// Escalation channels for permanently failed webhook deliveries.
#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub enabled: bool,
    pub slack_webhook_url: Option<String>,
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub email_from: Option<String>,
    pub email_to: Option<String>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            slack_webhook_url: None,
            smtp_host: None,
            smtp_port: 587,
            smtp_username: None,
            smtp_password: None,
            email_from: None,
            email_to: None,
        }
    }
}

/// Storage tree for screenshots and reports, plus the public URL the
/// reports are served from.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub root: String,
    pub public_base_url: String,
}

/// One API credential. `id` is what audit rows and logs record.
#[derive(Debug, Clone)]
pub struct ApiToken {
    pub id: String,
    pub token: String,
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_host: String,
    pub bind_port: u16,
    pub api_tokens: Vec<ApiToken>,
    pub url_policy: UrlPolicy,
    pub webhook: WebhookConfig,
    pub throttle: ThrottleConfig,
    pub quota: QuotaConfig,
    pub pipeline: PipelineConfig,
    pub worker: WorkerConfig,
    pub renderer: RendererConfig,
    pub insight_api: InsightApiConfig,
    pub alerts: AlertConfig,
    pub storage: StorageConfig,
}

impl Config {
    /// Load configuration from environment variables.
    /// Panics with a clear message if required vars are missing.
    pub fn from_env() -> Self {
        let webhook = WebhookConfig::default();
        let throttle = ThrottleConfig::default();
        let quota = QuotaConfig::default();
        let pipeline = PipelineConfig::default();
        let worker = WorkerConfig::default();
        let insight_api = InsightApiConfig::default();
        let alerts = AlertConfig::default();

        Self {
            database_url: required_env("DATABASE_URL"),
            bind_host: env_or("WEB_HOST", "0.0.0.0"),
            bind_port: env_parse("WEB_PORT", 3000),
            api_tokens: parse_api_tokens(&env_or("API_TOKENS", "")),
            url_policy: UrlPolicy {
                restricted: env_bool("RESTRICTED_MODE", true),
                blocked_domains: split_csv(&env_or("BLOCKED_DOMAINS", "")),
            },
            webhook: WebhookConfig {
                url: env_opt("WEBHOOK_URL"),
                secret: env_opt("WEBHOOK_SECRET"),
                timeout_secs: env_parse("WEBHOOK_TIMEOUT_SECS", webhook.timeout_secs),
                max_attempts: env_parse("WEBHOOK_MAX_ATTEMPTS", webhook.max_attempts),
                tolerance_secs: env_parse("WEBHOOK_TOLERANCE_SECS", webhook.tolerance_secs),
            },
            throttle: ThrottleConfig {
                per_minute: env_parse("THROTTLE_PER_MINUTE", throttle.per_minute),
                per_hour: env_parse("THROTTLE_PER_HOUR", throttle.per_hour),
                per_day: env_parse("THROTTLE_PER_DAY", throttle.per_day),
                global_per_minute: env_parse(
                    "THROTTLE_GLOBAL_PER_MINUTE",
                    throttle.global_per_minute,
                ),
            },
            quota: QuotaConfig {
                per_minute: env_parse("QUOTA_PER_MINUTE", quota.per_minute),
                per_day: env_parse("QUOTA_PER_DAY", quota.per_day),
                warn_fraction: env_parse("QUOTA_WARN_FRACTION", quota.warn_fraction),
                deferral_delay_secs: env_parse(
                    "QUOTA_DEFERRAL_DELAY_SECS",
                    quota.deferral_delay_secs,
                ),
                max_deferrals: env_parse("QUOTA_MAX_DEFERRALS", quota.max_deferrals),
            },
            pipeline: PipelineConfig {
                job_max_attempts: env_parse("JOB_MAX_ATTEMPTS", pipeline.job_max_attempts),
                job_backoff_base_secs: env_parse(
                    "JOB_BACKOFF_BASE_SECS",
                    pipeline.job_backoff_base_secs,
                ),
                require_screenshots: env_bool("REQUIRE_SCREENSHOTS", pipeline.require_screenshots),
                delete_screenshots_after_pdf: env_bool(
                    "DELETE_SCREENSHOTS_AFTER_PDF",
                    pipeline.delete_screenshots_after_pdf,
                ),
                retry_failed_after_secs: env_parse(
                    "RETRY_FAILED_AFTER_SECS",
                    pipeline.retry_failed_after_secs,
                ),
                pdf_concurrency: env_parse("PDF_CONCURRENCY", pipeline.pdf_concurrency),
                screenshot_concurrency: env_parse(
                    "SCREENSHOT_CONCURRENCY",
                    pipeline.screenshot_concurrency,
                ),
            },
            worker: WorkerConfig {
                concurrency: env_parse("WORKER_CONCURRENCY", worker.concurrency),
                poll_interval_secs: env_parse("WORKER_POLL_INTERVAL_SECS", worker.poll_interval_secs),
                redelivery_batch: env_parse("WORKER_REDELIVERY_BATCH", worker.redelivery_batch),
                housekeeping_interval_secs: env_parse(
                    "WORKER_HOUSEKEEPING_INTERVAL_SECS",
                    worker.housekeeping_interval_secs,
                ),
            },
            renderer: RendererConfig {
                base_url: env_or("BROWSERLESS_URL", "http://localhost:3300"),
                token: env_opt("BROWSERLESS_TOKEN"),
            },
            insight_api: InsightApiConfig {
                base_url: env_or("PAGESPEED_API_URL", &insight_api.base_url),
                api_key: env_opt("PAGESPEED_API_KEY"),
                timeout_secs: env_parse("PAGESPEED_TIMEOUT_SECS", insight_api.timeout_secs),
            },
            alerts: AlertConfig {
                enabled: env_bool("ALERTS_ENABLED", alerts.enabled),
                slack_webhook_url: env_opt("SLACK_WEBHOOK_URL"),
                smtp_host: env_opt("SMTP_HOST"),
                smtp_port: env_parse("SMTP_PORT", alerts.smtp_port),
                smtp_username: env_opt("SMTP_USERNAME"),
                smtp_password: env_opt("SMTP_PASSWORD"),
                email_from: env_opt("ALERT_EMAIL_FROM"),
                email_to: env_opt("ALERT_EMAIL_TO"),
            },
            storage: StorageConfig {
                root: env_or("STORAGE_DIR", "./storage"),
                public_base_url: env_or("PUBLIC_BASE_URL", "http://localhost:3000"),
            },
        }
    }
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .unwrap_or_else(|_| panic!("{key} must be a valid number, got: {raw}")),
        Err(_) => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(raw) => matches!(raw.as_str(), "1" | "true" | "TRUE" | "yes"),
        Err(_) => default,
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `id:token,id2:token2` credential pairs. Entries without a colon
/// use the token itself as the id.
fn parse_api_tokens(raw: &str) -> Vec<ApiToken> {
    split_csv(raw)
        .into_iter()
        .map(|entry| match entry.split_once(':') {
            Some((id, token)) => ApiToken {
                id: id.to_string(),
                token: token.to_string(),
            },
            None => ApiToken {
                id: entry.clone(),
                token: entry,
            },
        })
        .collect()
}
