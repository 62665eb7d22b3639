//! HTTP client for the `/completion` endpoint

use bench_core::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

/// Body of a non-streaming completion request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub prompt: String,
    pub n_predict: u32,
    pub temperature: f32,
    pub stream: bool,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>, n_predict: u32, temperature: f32) -> Self {
        Self {
            prompt: prompt.into(),
            n_predict,
            temperature,
            stream: false,
        }
    }

    /// Request used to bring a freshly started deployment to steady state
    pub fn warmup(n_predict: u32) -> Self {
        Self::new("warmup", n_predict, 0.0)
    }
}

/// Sends completion requests, one connection per request
#[derive(Debug, Clone)]
pub struct CompletionClient {
    client: reqwest::Client,
}

impl CompletionClient {
    /// Create a client whose calls fail after `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// POST `request` to `{base_url}/completion` and return the JSON body.
    ///
    /// Non-success statuses are classified by [`Error::from_http_status`];
    /// connection failures and timeouts become [`Error::Transport`]. The
    /// `Connection: close` header makes a proxy pick a fresh upstream for
    /// every request.
    pub async fn complete(&self, base_url: &str, request: &CompletionRequest) -> Result<Value> {
        let response = self
            .client
            .post(format!("{}/completion", base_url))
            .header(reqwest::header::CONNECTION, "close")
            .json(request)
            .send()
            .await
            .map_err(|e| Error::transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::transport(format!("failed to read response: {}", e)))?;

        if !status.is_success() {
            return Err(Error::from_http_status(status.as_u16(), body));
        }
        Ok(serde_json::from_str(&body)?)
    }
}
