pub mod error;

pub use error::{BrowserlessError, Result};

use std::time::Duration;

/// Desktop capture viewport.
pub const DESKTOP_WIDTH: u32 = 1920;
pub const DESKTOP_HEIGHT: u32 = 1080;
/// Mobile capture viewport (mobile emulation on).
pub const MOBILE_WIDTH: u32 = 375;
pub const MOBILE_HEIGHT: u32 = 812;

/// Viewport parameters for one screenshot capture.
#[derive(Debug, Clone, Copy)]
pub struct ScreenshotOptions {
    pub width: u32,
    pub height: u32,
    pub mobile: bool,
}

impl ScreenshotOptions {
    pub fn desktop() -> Self {
        Self {
            width: DESKTOP_WIDTH,
            height: DESKTOP_HEIGHT,
            mobile: false,
        }
    }

    pub fn mobile() -> Self {
        Self {
            width: MOBILE_WIDTH,
            height: MOBILE_HEIGHT,
            mobile: true,
        }
    }
}

pub struct BrowserlessClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl BrowserlessClient {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        let mut endpoint = format!("{}{path}", self.base_url);
        if let Some(ref token) = self.token {
            endpoint.push_str(&format!("?token={token}"));
        }
        endpoint
    }

    /// Capture a webp screenshot of a URL via the /screenshot endpoint.
    pub async fn screenshot(&self, url: &str, options: &ScreenshotOptions) -> Result<Vec<u8>> {
        tracing::debug!(url, width = options.width, mobile = options.mobile, "Capturing screenshot");

        let body = serde_json::json!({
            "url": url,
            "options": { "type": "webp", "fullPage": false },
            "viewport": {
                "width": options.width,
                "height": options.height,
                "deviceScaleFactor": 1,
                "isMobile": options.mobile,
                "hasTouch": options.mobile,
            },
            "gotoOptions": { "waitUntil": "networkidle2", "timeout": 30000 },
        });

        let resp = self
            .client
            .post(self.endpoint("/screenshot"))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(BrowserlessError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Err(BrowserlessError::EmptyDocument);
        }
        Ok(bytes.to_vec())
    }

    /// Render an HTML document to PDF via the /pdf endpoint.
    /// A4 portrait, 15mm margins, backgrounds printed.
    pub async fn pdf(&self, html: &str) -> Result<Vec<u8>> {
        tracing::debug!(html_bytes = html.len(), "Rendering PDF");

        let body = serde_json::json!({
            "html": html,
            "options": {
                "format": "A4",
                "printBackground": true,
                "margin": {
                    "top": "15mm",
                    "right": "15mm",
                    "bottom": "15mm",
                    "left": "15mm",
                },
            },
        });

        let resp = self
            .client
            .post(self.endpoint("/pdf"))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(BrowserlessError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let bytes = resp.bytes().await?;
        if bytes.is_empty() {
            return Err(BrowserlessError::EmptyDocument);
        }
        Ok(bytes.to_vec())
    }

    /// Reachability probe against the /pressure endpoint. Used by health
    /// checks; the body is reported as-is.
    pub async fn pressure(&self) -> Result<serde_json::Value> {
        let resp = self.client.get(self.endpoint("/pressure")).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(BrowserlessError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(resp.json().await?)
    }
}
