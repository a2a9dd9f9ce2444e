//! HTTP side of authentication: the API key exchange and the key set fetch.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::jwks::KeySet;
use crate::types::{CourierError, Result};

const LOGIN_PATH: &str = "/auth/login";
const JWKS_PATH: &str = "/.well-known/jwks.json";

/// Where tokens come from and how they are checked.
///
/// [`HttpAuthBackend`] talks to the real service; tests substitute their own.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Exchange an API key for a signed access token.
    async fn exchange(&self, endpoint: &str, api_key: &str) -> Result<String>;

    /// Fetch the key set that signs access tokens for `endpoint`.
    async fn fetch_key_set(&self, endpoint: &str) -> Result<KeySet>;
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    api_key: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    #[serde(default)]
    access_token: Option<String>,
}

/// Resolve `path` against the service endpoint.
///
/// A bare host is treated as `https`. Any path already on the endpoint is
/// kept as a prefix.
pub fn endpoint_url(endpoint: &str, path: &str) -> Result<Url> {
    let endpoint = endpoint.trim();
    let with_scheme = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("https://{}", endpoint)
    };

    let mut url = Url::parse(&with_scheme)
        .map_err(|e| CourierError::Config(format!("invalid endpoint {:?}: {}", endpoint, e)))?;

    if !matches!(url.scheme(), "https" | "http") {
        return Err(CourierError::Config(format!(
            "unsupported endpoint scheme {:?}",
            url.scheme()
        )));
    }

    let full_path = format!("{}{}", url.path().trim_end_matches('/'), path);
    url.set_path(&full_path);
    url.set_query(None);
    Ok(url)
}

pub fn login_url(endpoint: &str) -> Result<Url> {
    endpoint_url(endpoint, LOGIN_PATH)
}

pub fn jwks_url(endpoint: &str) -> Result<Url> {
    endpoint_url(endpoint, JWKS_PATH)
}

/// Interpret the login response.
pub(crate) fn parse_token_response(status: u16, body: &str) -> Result<String> {
    if status != 200 {
        return Err(CourierError::AuthFailed(format!(
            "HTTP {}: {}",
            status,
            truncate(body, 200)
        )));
    }

    let parsed: LoginResponse = serde_json::from_str(body)
        .map_err(|e| CourierError::Parse(format!("token response: {}", e)))?;

    match parsed.access_token {
        Some(token) if !token.trim().is_empty() => Ok(token),
        _ => Err(CourierError::EmptyAccessToken),
    }
}

fn truncate(body: &str, max: usize) -> &str {
    match body.char_indices().nth(max) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

/// [`AuthBackend`] over HTTPS.
#[derive(Clone)]
pub struct HttpAuthBackend {
    client: reqwest::Client,
}

impl HttpAuthBackend {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("courier/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AuthBackend for HttpAuthBackend {
    async fn exchange(&self, endpoint: &str, api_key: &str) -> Result<String> {
        let url = login_url(endpoint)?;
        debug!(url = %url, "Exchanging API key for access token");

        let response = self
            .client
            .post(url)
            .json(&LoginRequest { api_key })
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        parse_token_response(status, &body)
    }

    async fn fetch_key_set(&self, endpoint: &str) -> Result<KeySet> {
        let url = jwks_url(endpoint)?;
        debug!(url = %url, "Fetching verification keys");

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CourierError::Http(format!(
                "key set request returned HTTP {}",
                status.as_u16()
            )));
        }

        let body = response.text().await?;
        serde_json::from_str(&body)
            .map_err(|e| CourierError::Parse(format!("key set: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_urls() {
        assert_eq!(
            login_url("api.example.com").unwrap().as_str(),
            "https://api.example.com/auth/login"
        );
        assert_eq!(
            jwks_url("https://api.example.com/").unwrap().as_str(),
            "https://api.example.com/.well-known/jwks.json"
        );
        assert_eq!(
            login_url("http://127.0.0.1:4000/v1").unwrap().as_str(),
            "http://127.0.0.1:4000/v1/auth/login"
        );
    }

    #[test]
    fn test_endpoint_url_rejects_socket_scheme() {
        assert!(matches!(login_url("wss://h"), Err(CourierError::Config(_))));
    }

    #[test]
    fn test_parse_token_response_ok() {
        let token = parse_token_response(200, r#"{"access_token":"a.b.c","expires_in":3600}"#);
        assert_eq!(token.unwrap(), "a.b.c");
    }

    #[test]
    fn test_parse_token_response_status() {
        match parse_token_response(401, "invalid api key") {
            Err(CourierError::AuthFailed(msg)) => {
                assert!(msg.contains("401"));
                assert!(msg.contains("invalid api key"));
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(matches!(
            parse_token_response(500, ""),
            Err(CourierError::AuthFailed(_))
        ));
    }

    #[test]
    fn test_parse_token_response_bad_body() {
        assert!(matches!(
            parse_token_response(200, "<html>"),
            Err(CourierError::Parse(_))
        ));
    }

    #[test]
    fn test_parse_token_response_empty_token() {
        for body in [r#"{"access_token":""}"#, r#"{"access_token":"  "}"#, "{}"] {
            assert!(matches!(
                parse_token_response(200, body),
                Err(CourierError::EmptyAccessToken)
            ));
        }
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("short", 200), "short");
    }
}
