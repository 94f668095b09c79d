use std::net::IpAddr;

use url::Url;

use crate::config::UrlPolicy;
use crate::error::PagebeatError;

/// Hostnames rejected outright in restricted mode.
const LOCAL_HOSTS: [&str; 4] = ["localhost", "127.0.0.1", "::1", "0.0.0.0"];

/// A submission URL that has passed scheme, hostname, and network checks.
///
/// In restricted mode the host is resolved at validation time and any
/// loopback, link-local, or private address is rejected. DNS failure is
/// not a rejection; the fetch stage surfaces unreachable hosts on its
/// own schedule.
#[derive(Debug, Clone)]
pub struct SafeUrl {
    url: Url,
}

impl SafeUrl {
    pub async fn parse(raw: &str, policy: &UrlPolicy) -> Result<Self, PagebeatError> {
        let trimmed = raw.trim();
        if trimmed.len() > 2048 {
            return Err(PagebeatError::Validation(
                "The URL may not be greater than 2048 characters".to_string(),
            ));
        }

        let url = Url::parse(trimmed)
            .map_err(|_| PagebeatError::Validation(format!("Invalid URL format: {trimmed}")))?;

        let scheme = url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(PagebeatError::Validation(format!(
                "Only http and https schemes are allowed, got: {scheme}"
            )));
        }

        if !policy.restricted {
            return Ok(Self { url });
        }

        let host = url
            .host_str()
            .map(|h| h.to_ascii_lowercase())
            .ok_or_else(|| PagebeatError::Validation("URL must have a valid host".to_string()))?;
        // IPv6 hosts come through with brackets intact.
        let host = host.trim_matches(|c| c == '[' || c == ']').to_string();

        if is_local_host(&host) {
            return Err(PagebeatError::Validation(format!(
                "Localhost URLs are not allowed: {host}"
            )));
        }

        for blocked in &policy.blocked_domains {
            let blocked = blocked.to_ascii_lowercase();
            if host == blocked || host.ends_with(&format!(".{blocked}")) {
                return Err(PagebeatError::Validation(format!(
                    "Domain is blocked: {host}"
                )));
            }
        }

        for ip in resolve_host(&host).await {
            if is_private_ip(ip) {
                return Err(PagebeatError::Validation(format!(
                    "Private network IP detected: {ip} (resolved from {host})"
                )));
            }
        }

        Ok(Self { url })
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }
}

impl std::fmt::Display for SafeUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.url)
    }
}

fn is_local_host(host: &str) -> bool {
    LOCAL_HOSTS.contains(&host)
        || host.starts_with("127.")
        || host.ends_with(".local")
        || host.ends_with(".internal")
}

/// Candidate addresses for a host. Raw IP literals resolve to themselves;
/// DNS errors yield an empty list so admission does not reject on lookup
/// failure.
async fn resolve_host(host: &str) -> Vec<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return vec![ip];
    }
    match tokio::net::lookup_host((host, 80)).await {
        Ok(addrs) => addrs.map(|a| a.ip()).collect(),
        Err(_) => Vec::new(),
    }
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique-local, fe80::/10 link-local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn restricted() -> UrlPolicy {
        UrlPolicy {
            restricted: true,
            blocked_domains: vec!["blocked.example".to_string()],
        }
    }

    #[tokio::test]
    async fn test_rejects_non_http_scheme() {
        let err = SafeUrl::parse("ftp://example.com/file", &restricted())
            .await
            .unwrap_err();
        assert!(err.message().contains("Only http and https"));
    }

    #[tokio::test]
    async fn test_rejects_localhost_names() {
        for url in [
            "http://localhost/",
            "http://127.0.0.1/",
            "http://127.9.9.9/",
            "http://0.0.0.0/",
            "http://printer.local/",
            "http://db.internal/",
        ] {
            let err = SafeUrl::parse(url, &restricted()).await.unwrap_err();
            assert!(
                err.message().contains("Localhost URLs are not allowed"),
                "expected localhost rejection for {url}"
            );
        }
    }

    #[tokio::test]
    async fn test_rejects_private_and_link_local_ips() {
        for url in [
            "http://10.0.0.5/",
            "http://172.16.1.1/",
            "http://192.168.1.1/",
            "http://169.254.1.1/",
        ] {
            let err = SafeUrl::parse(url, &restricted()).await.unwrap_err();
            assert!(
                err.message().contains("Private network IP detected"),
                "expected private-IP rejection for {url}"
            );
        }
    }

    #[tokio::test]
    async fn test_rejects_ipv6_loopback() {
        let err = SafeUrl::parse("http://[::1]/", &restricted())
            .await
            .unwrap_err();
        assert!(err.message().contains("Localhost URLs are not allowed"));
    }

    #[tokio::test]
    async fn test_rejects_blocked_domain_and_subdomains() {
        let err = SafeUrl::parse("https://blocked.example/page", &restricted())
            .await
            .unwrap_err();
        assert!(err.message().contains("Domain is blocked"));

        let err = SafeUrl::parse("https://www.blocked.example/", &restricted())
            .await
            .unwrap_err();
        assert!(err.message().contains("Domain is blocked"));
    }

    #[tokio::test]
    async fn test_admits_public_ip_literal() {
        let url = SafeUrl::parse("https://93.184.216.34/", &restricted())
            .await
            .unwrap();
        assert_eq!(url.as_str(), "https://93.184.216.34/");
    }

    #[tokio::test]
    async fn test_unrestricted_mode_admits_localhost() {
        let policy = UrlPolicy::default();
        let url = SafeUrl::parse("http://localhost:3000/page", &policy)
            .await
            .unwrap();
        assert_eq!(url.host(), Some("localhost"));
    }

    #[tokio::test]
    async fn test_rejects_overlong_url() {
        let long = format!("https://example.com/{}", "a".repeat(2100));
        let err = SafeUrl::parse(&long, &restricted()).await.unwrap_err();
        assert!(err.message().contains("2048"));
    }

    #[tokio::test]
    async fn test_rejects_garbage() {
        let err = SafeUrl::parse("not a url", &restricted()).await.unwrap_err();
        assert!(err.message().contains("Invalid URL format"));
    }
}
