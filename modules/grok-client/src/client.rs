use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::types::ChatRequest;
use crate::util::extract_upstream_request_id;

#[derive(Debug, Error)]
pub enum GrokCallError {
    /// The per-call timeout elapsed before a response arrived.
    #[error("upstream request timed out")]
    Timeout,

    #[error("invalid outbound payload: {0}")]
    InvalidPayload(String),

    #[error("upstream transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Raw upstream response. Non-2xx statuses are returned, not raised —
/// callers decide which statuses are retryable.
#[derive(Debug, Clone)]
pub struct GrokResponse {
    pub status: u16,
    pub request_id: Option<String>,
    pub body: serde_json::Value,
}

impl GrokResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub struct GrokClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl GrokClient {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: resolve_chat_endpoint(base_url),
            api_key: api_key.to_string(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn headers(&self) -> Result<HeaderMap, GrokCallError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let bearer = format!("Bearer {}", self.api_key);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&bearer)
                .map_err(|e| GrokCallError::InvalidPayload(e.to_string()))?,
        );
        Ok(headers)
    }

    /// POST a chat request with a per-call timeout. The timeout is the only
    /// abort mechanism: an elapsed timer surfaces as `GrokCallError::Timeout`
    /// so callers can distinguish it from transport failures.
    pub async fn post_chat(
        &self,
        request: &ChatRequest,
        timeout: Duration,
    ) -> Result<GrokResponse, GrokCallError> {
        request
            .validate()
            .map_err(GrokCallError::InvalidPayload)?;

        debug!(model = %request.model, timeout_ms = timeout.as_millis() as u64, "Grok chat request");

        let response = self
            .http
            .post(&self.endpoint)
            .headers(self.headers()?)
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GrokCallError::Timeout
                } else {
                    GrokCallError::Transport(e)
                }
            })?;

        let status = response.status().as_u16();
        let request_id = extract_upstream_request_id(response.headers());

        let text = response.text().await.unwrap_or_default();
        let body = serde_json::from_str(&text)
            .unwrap_or_else(|_| serde_json::json!({ "text": text }));

        debug!(status, "Grok chat response");

        Ok(GrokResponse {
            status,
            request_id,
            body,
        })
    }
}

/// Normalize a configured base URL to the chat-completions endpoint.
/// Proxy paths and already-complete endpoints pass through untouched.
fn resolve_chat_endpoint(raw: &str) -> String {
    let trimmed = raw.trim();
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    let Ok(mut url) = Url::parse(&with_scheme) else {
        return with_scheme;
    };

    let path = url.path().to_ascii_lowercase();
    if path.contains("/proxy") || path.ends_with("/v1/chat/completions") || path.ends_with("/v1/responses") {
        return url.to_string().trim_end_matches('/').to_string();
    }

    let base = url.path().trim_end_matches('/').trim_end_matches("/v1");
    let joined = format!("{}/v1/chat/completions", base.trim_end_matches('/'));
    url.set_path(&joined);
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_host_gets_chat_completions_path() {
        assert_eq!(
            resolve_chat_endpoint("api.x.ai"),
            "https://api.x.ai/v1/chat/completions"
        );
    }

    #[test]
    fn v1_base_is_not_doubled() {
        assert_eq!(
            resolve_chat_endpoint("https://api.x.ai/v1"),
            "https://api.x.ai/v1/chat/completions"
        );
    }

    #[test]
    fn complete_endpoint_passes_through() {
        assert_eq!(
            resolve_chat_endpoint("https://api.x.ai/v1/chat/completions"),
            "https://api.x.ai/v1/chat/completions"
        );
    }

    #[test]
    fn proxy_path_passes_through() {
        assert_eq!(
            resolve_chat_endpoint("https://example.com/proxy-grok"),
            "https://example.com/proxy-grok"
        );
    }
}
