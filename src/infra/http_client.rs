use crate::app::ports::{HttpClientPort, HttpGetResult, TransportError};
use crate::constants::USER_AGENT;
use crate::types::RecordProfile;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use std::time::Duration;
use tracing::{debug, warn};

/// reqwest-backed HTTP port. One client per run so connections are pooled.
pub struct ReqwestHttp {
    client: reqwest::Client,
}

impl ReqwestHttp {
    pub fn new(timeout: Duration, api_key: Option<&str>, profile: RecordProfile) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(default_headers(api_key, profile))
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

/// NVD takes the key as an `apiKey` header; the posts API expects a bearer token
fn default_headers(api_key: Option<&str>, profile: RecordProfile) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    let Some(key) = api_key.map(str::trim).filter(|k| !k.is_empty()) else {
        return headers;
    };
    let value = match profile {
        RecordProfile::Nvd => HeaderValue::from_str(key),
        RecordProfile::Posts => HeaderValue::from_str(&format!("Bearer {}", key)),
    };
    match value {
        Ok(mut value) => {
            value.set_sensitive(true);
            match profile {
                RecordProfile::Nvd => headers.insert("apiKey", value),
                RecordProfile::Posts => headers.insert(AUTHORIZATION, value),
            };
        }
        Err(_) => warn!("API key contains characters not allowed in a header; sending without it"),
    }
    headers
}

/// Seconds form only; HTTP-date values are ignored
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn transport_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        TransportError::transient(err.to_string())
    } else {
        TransportError::fatal(err.to_string())
    }
}

#[async_trait]
impl HttpClientPort for ReqwestHttp {
    async fn get(&self, url: &str, query: &[(String, String)]) -> Result<HttpGetResult, TransportError> {
        let resp = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(transport_error)?;
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let bytes = resp.bytes().await.map_err(transport_error)?.to_vec();
        let content_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let retry_after = headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        debug!("GET {} -> {} ({} bytes)", url, status, bytes.len());
        Ok(HttpGetResult {
            status,
            bytes,
            content_type,
            retry_after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_after_seconds() {
        assert_eq!(parse_retry_after(" 30 "), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn test_client_builds_with_key() {
        assert!(ReqwestHttp::new(Duration::from_secs(5), Some("secret"), RecordProfile::Nvd).is_ok());
        assert!(ReqwestHttp::new(Duration::from_secs(5), None, RecordProfile::Posts).is_ok());
    }

    #[test]
    fn test_key_header_follows_profile() {
        let nvd = default_headers(Some("secret"), RecordProfile::Nvd);
        assert_eq!(nvd.get("apiKey").unwrap(), "secret");
        assert!(nvd.get(AUTHORIZATION).is_none());

        let posts = default_headers(Some("secret"), RecordProfile::Posts);
        assert_eq!(posts.get(AUTHORIZATION).unwrap(), "Bearer secret");
        assert!(posts.get("apiKey").is_none());

        let anonymous = default_headers(Some("  "), RecordProfile::Posts);
        assert!(anonymous.get(AUTHORIZATION).is_none());
        assert_eq!(anonymous.get(ACCEPT).unwrap(), "application/json");
    }
}
