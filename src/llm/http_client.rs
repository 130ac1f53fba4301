//! Shared HTTP plumbing for OpenAI-compatible providers (§9a).

use std::time::Duration;

use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error};

use crate::error::{CoreError, ProviderError, Result};

pub struct HttpProviderClient {
    client: Client,
    timeout: Duration,
}

impl HttpProviderClient {
    pub fn new(timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub async fn post_json<T: Serialize, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &T,
        headers: Vec<(&str, String)>,
    ) -> Result<R> {
        debug!(url, "POST");
        let mut request = self.client.post(url).json(body);
        for (key, value) in headers {
            request = request.header(key, value);
        }

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| ProviderError::Timeout)?
            .map_err(|e| ProviderError::ConnectionFailed(e.to_string()))?;

        self.handle_response(response).await
    }

    /// Issues a POST and returns the raw streaming response for the caller
    /// to parse as `text/event-stream` incrementally.
    pub async fn post_stream<T: Serialize>(
        &self,
        url: &str,
        body: &T,
        headers: Vec<(&str, String)>,
    ) -> Result<Response> {
        debug!(url, "POST (stream)");
        let mut request = self.client.post(url).json(body);
        for (key, value) in headers {
            request = request.header(key, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::ConnectionFailed(e.to_string()))?;
        self.check_status(&response).await
    }

    pub async fn get<R: DeserializeOwned>(&self, url: &str, headers: Vec<(&str, String)>) -> Result<R> {
        debug!(url, "GET");
        let mut request = self.client.get(url);
        for (key, value) in headers {
            request = request.header(key, value);
        }

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| ProviderError::Timeout)?
            .map_err(|e| ProviderError::ConnectionFailed(e.to_string()))?;

        self.handle_response(response).await
    }

    async fn handle_response<R: DeserializeOwned>(&self, response: Response) -> Result<R> {
        let response = self.check_status(&response).await.map(|_| response)?;
        response
            .json()
            .await
            .map_err(|e| CoreError::Provider(ProviderError::InvalidResponse(e.to_string())))
    }

    /// Returns `Ok(())` on a success status; on failure, consumes the
    /// response body for diagnostics and returns the mapped error. Callers
    /// that need the body on success must pass the original `response`
    /// through separately.
    async fn check_status(&self, response: &Response) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        error!(status = status.as_u16(), "provider returned non-success status");
        Err(match status.as_u16() {
            401 | 403 => ProviderError::Unauthorized,
            429 => ProviderError::RateLimited,
            500..=599 => ProviderError::ServerError(status.as_u16()),
            _ => ProviderError::InvalidResponse(format!("unexpected status {status}")),
        }
        .into())
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// Adapter trait an OpenAI-Chat-Completions-shaped provider implements to
/// plug into [`HttpProviderClient`] for URL/auth construction.
pub trait OpenAICompatible {
    fn base_url(&self) -> &str;
    fn api_key(&self) -> Option<&str>;

    fn auth_headers(&self) -> Vec<(&str, String)> {
        let mut headers = Vec::new();
        if let Some(key) = self.api_key() {
            headers.push(("Authorization", format!("Bearer {key}")));
        }
        headers
    }

    fn build_url(&self, endpoint: &str) -> String {
        let base = self.base_url().trim_end_matches('/');
        let path = endpoint.trim_start_matches('/');
        format!("{base}/{path}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestProvider {
        base_url: String,
        api_key: Option<String>,
    }

    impl OpenAICompatible for TestProvider {
        fn base_url(&self) -> &str {
            &self.base_url
        }

        fn api_key(&self) -> Option<&str> {
            self.api_key.as_deref()
        }
    }

    #[test]
    fn build_url_joins_base_and_endpoint() {
        let provider = TestProvider {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            api_key: Some("key".to_string()),
        };
        assert_eq!(
            provider.build_url("chat/completions"),
            "https://openrouter.ai/api/v1/chat/completions"
        );
        assert_eq!(
            provider.build_url("/embeddings"),
            "https://openrouter.ai/api/v1/embeddings"
        );
    }

    #[test]
    fn auth_headers_carries_bearer_token() {
        let provider = TestProvider {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            api_key: Some("secret".to_string()),
        };
        let headers = provider.auth_headers();
        assert_eq!(headers[0], ("Authorization", "Bearer secret".to_string()));
    }

    #[test]
    fn missing_api_key_yields_no_auth_header() {
        let provider = TestProvider {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            api_key: None,
        };
        assert!(provider.auth_headers().is_empty());
    }
}
