//! Two-phase readiness probing of inference servers
//!
//! Liveness waits for the HTTP listener to route requests, inference
//! readiness waits for a one-token completion to succeed. Each phase has
//! its own deadline.

use crate::process::ManagedProcess;
use bench_core::{Error, ReadinessConfig, ReadinessPhase, Result};
use reqwest::StatusCode;
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Outcome of a single inference probe
enum InferenceProbe {
    Ready,
    NotYet(String),
}

/// Polls a server until it is live and can run inference
#[derive(Debug, Clone)]
pub struct ReadinessProber {
    client: reqwest::Client,
    config: ReadinessConfig,
}

impl ReadinessProber {
    pub fn new(config: ReadinessConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ReadinessConfig {
        &self.config
    }

    /// Run both phases against `base_url`, failing fast if `process` exits
    pub async fn wait_ready(
        &self,
        base_url: &str,
        target: &str,
        mut process: Option<&mut ManagedProcess>,
    ) -> Result<()> {
        let started = Instant::now();
        self.wait_live(base_url, target, process.as_deref_mut()).await?;
        self.wait_inference_ready(base_url, target, process).await?;
        info!(target, elapsed = ?started.elapsed(), "Server ready");
        Ok(())
    }

    /// Poll `/health` then `/v1/models` until either answers.
    ///
    /// 200 or 404 on either route counts as alive: the process is up and
    /// routing even when that route is absent.
    pub async fn wait_live(
        &self,
        base_url: &str,
        target: &str,
        mut process: Option<&mut ManagedProcess>,
    ) -> Result<()> {
        let timeout = self.config.liveness_timeout();
        let deadline = Instant::now() + timeout;
        let mut last_error = String::from("no response");

        loop {
            if let Some(process) = process.as_deref_mut() {
                process.ensure_running()?;
            }

            match self.probe_live(base_url).await {
                Ok(()) => {
                    debug!(target, "Liveness confirmed");
                    return Ok(());
                }
                Err(e) => last_error = e,
            }

            if Instant::now() >= deadline {
                return Err(Error::ReadinessTimeout {
                    target: target.to_string(),
                    phase: ReadinessPhase::Liveness,
                    timeout,
                    last_error,
                });
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    /// Poll a one-token completion until it returns 200.
    ///
    /// 503 means the model is still loading and polling continues; any
    /// other HTTP error fails immediately with [`Error::ReadinessFatal`].
    pub async fn wait_inference_ready(
        &self,
        base_url: &str,
        target: &str,
        mut process: Option<&mut ManagedProcess>,
    ) -> Result<()> {
        let timeout = self.config.inference_timeout();
        let deadline = Instant::now() + timeout;
        let mut last_error = String::from("no response");

        loop {
            if let Some(process) = process.as_deref_mut() {
                process.ensure_running()?;
            }

            match self.probe_inference(base_url, target).await? {
                InferenceProbe::Ready => {
                    debug!(target, "Inference readiness confirmed");
                    return Ok(());
                }
                InferenceProbe::NotYet(e) => last_error = e,
            }

            if Instant::now() >= deadline {
                return Err(Error::ReadinessTimeout {
                    target: target.to_string(),
                    phase: ReadinessPhase::Inference,
                    timeout,
                    last_error,
                });
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    async fn probe_live(&self, base_url: &str) -> std::result::Result<(), String> {
        let mut last_error = String::new();

        for route in ["/health", "/v1/models"] {
            let response = self
                .client
                .get(format!("{}{}", base_url, route))
                .timeout(self.config.probe_timeout())
                .send()
                .await;

            match response {
                Ok(resp) if matches!(resp.status(), StatusCode::OK | StatusCode::NOT_FOUND) => {
                    return Ok(());
                }
                Ok(resp) => last_error = format!("GET {} returned HTTP {}", route, resp.status()),
                Err(e) => last_error = format!("GET {} failed: {}", route, e),
            }
        }

        Err(last_error)
    }

    async fn probe_inference(&self, base_url: &str, target: &str) -> Result<InferenceProbe> {
        let response = self
            .client
            .post(format!("{}/completion", base_url))
            .timeout(self.config.completion_probe_timeout())
            .json(&json!({
                "prompt": "ping",
                "n_predict": 1,
                "temperature": 0.0,
                "stream": false,
            }))
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => return Ok(InferenceProbe::NotYet(format!("completion probe failed: {}", e))),
        };

        let status = response.status();
        if status == StatusCode::OK {
            return Ok(InferenceProbe::Ready);
        }
        if status == StatusCode::SERVICE_UNAVAILABLE {
            return Ok(InferenceProbe::NotYet("HTTP 503: model loading".to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        Err(Error::ReadinessFatal {
            target: target.to_string(),
            status: status.as_u16(),
            body,
        })
    }
}

/// Probe deadlines suited to local test servers
pub fn quick_readiness(timeout: Duration) -> ReadinessConfig {
    let seconds = timeout.as_secs_f64();
    ReadinessConfig {
        liveness_timeout_seconds: seconds,
        inference_timeout_seconds: seconds,
        poll_interval_ms: 50,
        probe_timeout_seconds: 1.0,
        completion_probe_timeout_seconds: 1.0,
    }
}
