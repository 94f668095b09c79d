//! Bearer-token authentication against the configured credential list.

use axum::http::{header, HeaderMap};

use pagebeat_common::config::ApiToken;

/// Resolve the presented bearer token to its token id. With no tokens
/// configured the service runs open and every caller is anonymous.
pub enum Caller {
    Token(String),
    Anonymous,
    Unauthenticated,
}

pub fn authenticate(headers: &HeaderMap, tokens: &[ApiToken]) -> Caller {
    if tokens.is_empty() {
        return Caller::Anonymous;
    }
    let Some(presented) = bearer(headers) else {
        return Caller::Unauthenticated;
    };
    match tokens.iter().find(|t| t.token == presented) {
        Some(token) => Caller::Token(token.id.clone()),
        None => Caller::Unauthenticated,
    }
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn tokens() -> Vec<ApiToken> {
        vec![
            ApiToken { id: "ci".to_string(), token: "secret-1".to_string() },
            ApiToken { id: "ops".to_string(), token: "secret-2".to_string() },
        ]
    }

    fn headers_with(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_known_token_resolves_to_its_id() {
        let caller = authenticate(&headers_with("Bearer secret-2"), &tokens());
        assert!(matches!(caller, Caller::Token(id) if id == "ops"));
    }

    #[test]
    fn test_unknown_token_is_rejected() {
        let caller = authenticate(&headers_with("Bearer nope"), &tokens());
        assert!(matches!(caller, Caller::Unauthenticated));
    }

    #[test]
    fn test_missing_or_malformed_header_is_rejected() {
        assert!(matches!(
            authenticate(&HeaderMap::new(), &tokens()),
            Caller::Unauthenticated
        ));
        assert!(matches!(
            authenticate(&headers_with("Basic secret-1"), &tokens()),
            Caller::Unauthenticated
        ));
        assert!(matches!(
            authenticate(&headers_with("Bearer "), &tokens()),
            Caller::Unauthenticated
        ));
    }

    #[test]
    fn test_no_configured_tokens_means_open_service() {
        assert!(matches!(
            authenticate(&HeaderMap::new(), &[]),
            Caller::Anonymous
        ));
    }
}
