//! Typed HTTP helpers executed through a circuit breaker.
//!
//! Each client is bound to exactly one [`CircuitBreaker`] at construction.
//! Every call enforces a hard timeout, and GET requests always carry
//! cache-defeating headers so providers never serve stale metadata.

use std::time::Duration;

use reqwest::header::{CACHE_CONTROL, HeaderMap, HeaderName, HeaderValue, PRAGMA};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::NetError;
use super::breaker::CircuitBreaker;

/// User agent sent with every request.
const USER_AGENT: &str = concat!("addonsync/", env!("CARGO_PKG_VERSION"));

/// Headers that defeat intermediate caches on GET requests.
fn cache_defeating_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    headers
}

/// Merges caller-supplied headers over the defaults.
///
/// Caller headers win on key collisions; defaults that the caller does not
/// name are kept.
fn merge_headers(defaults: HeaderMap, extra: &[(&str, &str)]) -> HeaderMap {
    let mut merged = defaults;
    for (name, value) in extra {
        let Ok(name) = HeaderName::try_from(*name) else {
            warn!("[NET] Skipping invalid header name '{}'", name);
            continue;
        };
        let Ok(value) = HeaderValue::try_from(*value) else {
            warn!("[NET] Skipping invalid header value for '{}'", name);
            continue;
        };
        merged.insert(name, value);
    }
    merged
}

/// HTTP client bound to a single circuit breaker.
pub struct ResilientHttpClient {
    http: reqwest::Client,
    breaker: CircuitBreaker,
    default_timeout: Duration,
}

impl ResilientHttpClient {
    /// Creates a client executing through the given breaker.
    #[must_use]
    pub fn new(breaker: CircuitBreaker, default_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http,
            breaker,
            default_timeout,
        }
    }

    /// Returns the breaker guarding this client.
    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// GETs a JSON document.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        timeout: Option<Duration>,
    ) -> Result<T, NetError> {
        let request = self
            .http
            .get(url)
            .headers(merge_headers(cache_defeating_headers(), headers));
        let body = self.execute(request, timeout).await?;
        serde_json::from_slice(&body).map_err(|e| NetError::Body(e.to_string()))
    }

    /// POSTs a JSON body and decodes the JSON response.
    pub async fn post_json<T: DeserializeOwned>(
        &self,
        url: &str,
        body: &impl Serialize,
        headers: &[(&str, &str)],
        timeout: Option<Duration>,
    ) -> Result<T, NetError> {
        let request = self
            .http
            .post(url)
            .headers(merge_headers(HeaderMap::new(), headers))
            .json(body);
        let body = self.execute(request, timeout).await?;
        serde_json::from_slice(&body).map_err(|e| NetError::Body(e.to_string()))
    }

    /// DELETEs and decodes the JSON response.
    pub async fn delete_json<T: DeserializeOwned>(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        timeout: Option<Duration>,
    ) -> Result<T, NetError> {
        let request = self
            .http
            .delete(url)
            .headers(merge_headers(HeaderMap::new(), headers));
        let body = self.execute(request, timeout).await?;
        serde_json::from_slice(&body).map_err(|e| NetError::Body(e.to_string()))
    }

    /// GETs a plain-text document.
    pub async fn get_text(&self, url: &str, timeout: Option<Duration>) -> Result<String, NetError> {
        let request = self.http.get(url).headers(cache_defeating_headers());
        let body = self.execute(request, timeout).await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// GETs a raw body, e.g. an addon archive.
    pub async fn get_bytes(
        &self,
        url: &str,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, NetError> {
        let request = self.http.get(url).headers(cache_defeating_headers());
        self.execute(request, timeout).await
    }

    /// Runs a request through the breaker under the hard timeout.
    ///
    /// The timeout covers sending the request and receiving the full body.
    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, NetError> {
        let limit = timeout.unwrap_or(self.default_timeout);

        self.breaker
            .execute(async move {
                let call = async {
                    let response = request.send().await?;
                    let status = response.status();
                    if !status.is_success() {
                        debug!("[NET] Request failed with status {}", status);
                        return Err(NetError::Status {
                            code: status.as_u16(),
                        });
                    }
                    let body = response.bytes().await?;
                    Ok(body.to_vec())
                };

                match tokio::time::timeout(limit, call).await {
                    Ok(result) => result,
                    Err(_) => Err(NetError::Timeout(limit)),
                }
            })
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_defeating_headers_present() {
        let headers = cache_defeating_headers();
        assert_eq!(headers.get(CACHE_CONTROL).unwrap(), "no-cache");
        assert_eq!(headers.get(PRAGMA).unwrap(), "no-cache");
    }

    #[test]
    fn test_merge_headers_keeps_defaults() {
        let merged = merge_headers(cache_defeating_headers(), &[("Accept", "application/json")]);
        assert_eq!(merged.get(CACHE_CONTROL).unwrap(), "no-cache");
        assert_eq!(merged.get("Accept").unwrap(), "application/json");
    }

    #[test]
    fn test_merge_headers_caller_wins_on_collision() {
        let merged = merge_headers(cache_defeating_headers(), &[("Cache-Control", "max-age=60")]);
        assert_eq!(merged.get(CACHE_CONTROL).unwrap(), "max-age=60");
        assert_eq!(merged.get(PRAGMA).unwrap(), "no-cache");
    }

    #[test]
    fn test_merge_headers_skips_invalid_names() {
        let merged = merge_headers(HeaderMap::new(), &[("bad header\n", "x"), ("Ok", "y")]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.get("Ok").unwrap(), "y");
    }
}
