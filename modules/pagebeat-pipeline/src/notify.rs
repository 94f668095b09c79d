//! Operator escalation for permanently lost webhook deliveries.
//!
//! Slack and SMTP are both optional; whichever is configured gets the
//! alert. Channels are deduplicated per audit for an hour so a noisy
//! endpoint outage does not turn into a pager storm.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use pagebeat_common::config::AlertConfig;
use pagebeat_store::CounterStore;

const DEDUP_TTL_SECS: i64 = 3600;

/// Everything an operator needs to act on a lost delivery.
#[derive(Debug, Clone)]
pub struct WebhookFailureAlert {
    pub audit_id: Uuid,
    pub url: String,
    pub attempts: i32,
    pub score: Option<i16>,
    pub error: String,
    pub pdf_url: Option<String>,
}

#[async_trait]
pub trait AlertBackend: Send + Sync {
    /// Short channel name used in logs and dedup markers.
    fn channel(&self) -> &'static str;

    async fn send(&self, alert: &WebhookFailureAlert) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// Slack
// ---------------------------------------------------------------------------

pub struct SlackBackend {
    client: reqwest::Client,
    webhook_url: String,
}

impl SlackBackend {
    pub fn new(webhook_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("Failed to build HTTP client");
        Self { client, webhook_url }
    }
}

#[async_trait]
impl AlertBackend for SlackBackend {
    fn channel(&self) -> &'static str {
        "slack"
    }

    async fn send(&self, alert: &WebhookFailureAlert) -> anyhow::Result<()> {
        let text = format!(
            "Webhook delivery permanently failed for audit {}",
            alert.audit_id
        );
        let body = json!({
            "text": text.clone(),
            "attachments": [{
                "fallback": text,
                "color": "danger",
                "fields": [
                    { "title": "Audit ID", "value": alert.audit_id.to_string(), "short": true },
                    { "title": "URL", "value": alert.url.clone(), "short": true },
                    { "title": "Attempts", "value": alert.attempts.to_string(), "short": true },
                    {
                        "title": "Score",
                        "value": alert.score.map(|s| s.to_string()).unwrap_or_else(|| "N/A".to_string()),
                        "short": true,
                    },
                    { "title": "Error", "value": alert.error.clone(), "short": false },
                    {
                        "title": "PDF URL",
                        "value": alert.pdf_url.clone().unwrap_or_else(|| "N/A".to_string()),
                        "short": false,
                    },
                ],
            }],
        });

        let resp = self.client.post(&self.webhook_url).json(&body).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("Slack webhook returned status {}", resp.status().as_u16());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Email
// ---------------------------------------------------------------------------

pub struct EmailBackend {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Mailbox,
}

impl EmailBackend {
    pub fn new(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        from: &str,
        to: &str,
    ) -> anyhow::Result<Self> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)?.port(port);
        if let (Some(user), Some(pass)) = (username, password) {
            builder = builder.credentials(Credentials::new(user.to_string(), pass.to_string()));
        }
        Ok(Self {
            transport: builder.build(),
            from: from.parse()?,
            to: to.parse()?,
        })
    }
}

#[async_trait]
impl AlertBackend for EmailBackend {
    fn channel(&self) -> &'static str {
        "email"
    }

    async fn send(&self, alert: &WebhookFailureAlert) -> anyhow::Result<()> {
        let score = alert
            .score
            .map(|s| s.to_string())
            .unwrap_or_else(|| "N/A".to_string());
        let body = format!(
            "Webhook delivery permanently failed.\n\n\
             Audit ID: {}\n\
             URL: {}\n\
             Attempts: {}\n\
             Score: {}\n\
             Error: {}\n\
             PDF URL: {}\n",
            alert.audit_id,
            alert.url,
            alert.attempts,
            score,
            alert.error,
            alert.pdf_url.as_deref().unwrap_or("N/A"),
        );
        let message = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(format!("[Webhook Failed] Audit {}", alert.audit_id))
            .body(body)?;

        self.transport.send(message).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub struct AlertRouter {
    backends: Vec<Box<dyn AlertBackend>>,
    counters: Arc<dyn CounterStore>,
    enabled: bool,
}

impl AlertRouter {
    pub fn from_config(config: &AlertConfig, counters: Arc<dyn CounterStore>) -> Self {
        let mut backends: Vec<Box<dyn AlertBackend>> = Vec::new();

        if let Some(url) = &config.slack_webhook_url {
            backends.push(Box::new(SlackBackend::new(url.clone())));
        }
        if let (Some(host), Some(from), Some(to)) =
            (&config.smtp_host, &config.email_from, &config.email_to)
        {
            match EmailBackend::new(
                host,
                config.smtp_port,
                config.smtp_username.as_deref(),
                config.smtp_password.as_deref(),
                from,
                to,
            ) {
                Ok(backend) => backends.push(Box::new(backend)),
                Err(error) => warn!(%error, "email alerts disabled: backend could not be built"),
            }
        }

        Self { backends, counters, enabled: config.enabled }
    }

    pub fn disabled(counters: Arc<dyn CounterStore>) -> Self {
        Self { backends: Vec::new(), counters, enabled: false }
    }

    #[cfg(test)]
    pub(crate) fn with_backends(
        backends: Vec<Box<dyn AlertBackend>>,
        counters: Arc<dyn CounterStore>,
    ) -> Self {
        Self { backends, counters, enabled: true }
    }

    /// Fan out to every configured channel. Never propagates: a lost
    /// alert must not change job processing. Each channel fires at most
    /// once per audit per hour.
    pub async fn webhook_failed(&self, alert: &WebhookFailureAlert) {
        if !self.enabled {
            return;
        }
        for backend in &self.backends {
            let marker = format!(
                "webhook_failure_{}_sent:{}",
                backend.channel(),
                alert.audit_id
            );
            let expires_at = Utc::now() + chrono::Duration::seconds(DEDUP_TTL_SECS);
            let fresh = match self.counters.set_marker(&marker, expires_at).await {
                Ok(fresh) => fresh,
                Err(error) => {
                    warn!(%error, "alert dedup marker unavailable, sending anyway");
                    true
                }
            };
            if !fresh {
                continue;
            }

            match backend.send(alert).await {
                Ok(()) => info!(
                    channel = backend.channel(),
                    audit_id = %alert.audit_id,
                    "webhook failure alert sent"
                ),
                Err(error) => {
                    warn!(channel = backend.channel(), %error, "alert delivery failed")
                }
            }
        }
    }
}
