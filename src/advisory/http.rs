use std::time::Duration;

use async_trait::async_trait;

use super::{AdvisoryClient, AdvisoryRequest, AdvisoryResponse, parse_response};
use crate::errors::AdvisoryError;

/// Advisory backend reached over HTTP.
///
/// Posts the request as JSON and parses the response body. Transport errors
/// and non-2xx statuses are reported as unavailable.
pub struct HttpAdvisor {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpAdvisor {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, AdvisoryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AdvisoryError::Unavailable(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
            token: None,
        })
    }

    /// Send `Authorization: Bearer <token>` with every request.
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }
}

#[async_trait]
impl AdvisoryClient for HttpAdvisor {
    fn name(&self) -> &str {
        &self.url
    }

    async fn advise(&self, request: &AdvisoryRequest) -> Result<AdvisoryResponse, AdvisoryError> {
        let mut builder = self.client.post(&self.url).json(request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| AdvisoryError::Unavailable(format!("request to {} failed: {}", self.url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AdvisoryError::Unavailable(format!(
                "{} returned HTTP {}",
                self.url, status
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| AdvisoryError::Unavailable(format!("failed to read body: {}", e)))?;
        tracing::debug!(url = %self.url, mode = request.mode.as_str(), bytes = body.len(), "advisory response");
        parse_response(&body)
    }
}
