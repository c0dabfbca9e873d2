//! JSON-over-HTTPS plumbing shared by the hosted providers.

use std::time::Duration;

use reqwest::{
    Response,
    StatusCode,
    header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue},
};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::{Error, Result};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Retries after the first attempt for 429 and 5xx responses.
pub const DEFAULT_MAX_RETRIES: usize = 3;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// An authenticated client for one provider's REST API.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    provider: &'static str,
    base_url: String,
    timeout: Duration,
}

impl ApiClient {
    pub fn new(
        provider: &'static str,
        base_url: &str,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).map_err(|_| {
                Error::Config(format!("invalid {provider} API key"))
            })?,
        );
        headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            provider,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn provider(&self) -> &'static str {
        self.provider
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// POST `body` and decode the JSON response.
    pub async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let resp = self.send(path, body, Some(self.timeout)).await?;
        let text = resp.text().await?;
        serde_json::from_str(&text).map_err(|e| Error::Provider {
            provider: self.provider,
            message: format!("unexpected response: {e}"),
        })
    }

    /// POST `body` and hand back the successful response for streaming.
    ///
    /// Only connecting is bounded by the client; callers bound the body.
    pub async fn post_stream<B>(&self, path: &str, body: &B) -> Result<Response>
    where
        B: Serialize + ?Sized,
    {
        self.send(path, body, None).await
    }

    async fn send<B>(
        &self,
        path: &str,
        body: &B,
        timeout: Option<Duration>,
    ) -> Result<Response>
    where
        B: Serialize + ?Sized,
    {
        let url = self.endpoint(path);
        let mut attempt = 0usize;
        loop {
            let mut request = self.http.post(&url).json(body);
            if let Some(timeout) = timeout {
                request = request.timeout(timeout);
            }

            match request.send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => {
                    let status = resp.status();
                    if should_retry(status) && attempt < DEFAULT_MAX_RETRIES {
                        attempt += 1;
                        tracing::warn!(
                            provider = self.provider,
                            %status,
                            attempt,
                            "retrying request"
                        );
                        tokio::time::sleep(retry_backoff(attempt)).await;
                        continue;
                    }
                    let text = resp
                        .text()
                        .await
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    return Err(Error::Provider {
                        provider: self.provider,
                        message: format!("{status}: {}", text.trim()),
                    });
                }
                Err(e) => {
                    if is_retryable_error(&e) && attempt < DEFAULT_MAX_RETRIES {
                        attempt += 1;
                        tracing::warn!(
                            provider = self.provider,
                            error = %e,
                            attempt,
                            "retrying request"
                        );
                        tokio::time::sleep(retry_backoff(attempt)).await;
                        continue;
                    }
                    return Err(e.into());
                }
            }
        }
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

pub fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Backoff before retry `attempt` (1-based): 500ms doubled per attempt,
/// capped at five doublings.
pub fn retry_backoff(attempt: usize) -> Duration {
    let capped = attempt.min(5) as u32;
    Duration::from_millis(500 * (1 << capped))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(retry_backoff(1), Duration::from_millis(1000));
        assert_eq!(retry_backoff(2), Duration::from_millis(2000));
        assert_eq!(retry_backoff(5), Duration::from_millis(16000));
        assert_eq!(retry_backoff(9), retry_backoff(5));
    }

    #[test]
    fn retries_rate_limits_and_server_errors_only() {
        assert!(should_retry(StatusCode::TOO_MANY_REQUESTS));
        assert!(should_retry(StatusCode::BAD_GATEWAY));
        assert!(!should_retry(StatusCode::UNAUTHORIZED));
        assert!(!should_retry(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn endpoint_joins_paths() {
        let client = ApiClient::new(
            "voyage",
            "https://api.voyageai.com/v1/",
            "key",
            DEFAULT_TIMEOUT,
        )
        .unwrap();
        assert_eq!(
            client.endpoint("/embeddings"),
            "https://api.voyageai.com/v1/embeddings"
        );
    }

    #[test]
    fn rejects_unprintable_keys() {
        let err =
            ApiClient::new("openai", "http://x", "bad\nkey", DEFAULT_TIMEOUT)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
