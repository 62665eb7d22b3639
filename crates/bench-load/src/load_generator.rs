//! Concurrent completion load against one base URL
//!
//! A batch issues `total_requests` independent completions with at most
//! `concurrency` in flight, then aggregates tokens, errors and latency.

use crate::client::{CompletionClient, CompletionRequest};
use crate::retry::RetryPolicy;
use crate::tokens::{LlamaTokenExtractor, TokenExtractor};
use bench_core::{BatchResult, Error, LoadConfig, Result};
use futures::stream::{self, StreamExt};
use hdrhistogram::Histogram;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Highest latency the histogram tracks, in milliseconds
const MAX_TRACKED_LATENCY_MS: u64 = 3_600_000;

/// Shape of one measured batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchSpec {
    pub prompt: String,
    pub n_predict: u32,
    pub temperature: f32,
    pub concurrency: usize,
    pub total_requests: usize,
}

/// Running totals of one batch
struct BatchTally {
    total_tokens: u64,
    successes: usize,
    errors: usize,
    last_error: Option<String>,
    rate_sum: f64,
    rate_samples: usize,
    latency: Histogram<u64>,
}

impl BatchTally {
    fn new() -> Result<Self> {
        let latency = Histogram::new_with_bounds(1, MAX_TRACKED_LATENCY_MS, 3)
            .map_err(|e| Error::Other(anyhow::anyhow!("latency histogram: {}", e)))?;
        Ok(Self {
            total_tokens: 0,
            successes: 0,
            errors: 0,
            last_error: None,
            rate_sum: 0.0,
            rate_samples: 0,
            latency,
        })
    }

    fn record_success(&mut self, extractor: &dyn TokenExtractor, response: &Value, latency: Duration) {
        self.successes += 1;
        self.total_tokens += extractor.token_count(response);
        if let Some(rate) = extractor.tokens_per_second(response) {
            self.rate_sum += rate;
            self.rate_samples += 1;
        }
        let ms = (latency.as_millis() as u64).clamp(1, MAX_TRACKED_LATENCY_MS);
        self.latency.saturating_record(ms);
    }

    fn record_failure(&mut self, error: &Error) {
        self.errors += 1;
        self.last_error = Some(error.to_string());
    }

    fn finish(self, elapsed: Duration) -> BatchResult {
        let elapsed_seconds = elapsed.as_secs_f64();
        let quantile = |q: f64| {
            if self.latency.is_empty() {
                0
            } else {
                self.latency.value_at_quantile(q)
            }
        };

        BatchResult {
            throughput_tokens_per_sec: BatchResult::throughput(self.total_tokens, elapsed_seconds),
            total_tokens: self.total_tokens,
            elapsed_seconds,
            error_count: self.errors,
            last_error: self.last_error.clone(),
            successful_requests: self.successes,
            mean_request_tps: if self.rate_samples > 0 {
                self.rate_sum / self.rate_samples as f64
            } else {
                0.0
            },
            latency_p50_ms: quantile(0.5),
            latency_p95_ms: quantile(0.95),
            latency_max_ms: if self.latency.is_empty() { 0 } else { self.latency.max() },
        }
    }
}

/// Issues batches of completion requests
#[derive(Clone)]
pub struct LoadGenerator {
    client: CompletionClient,
    retry: RetryPolicy,
    extractor: Arc<dyn TokenExtractor>,
}

impl std::fmt::Debug for LoadGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadGenerator")
            .field("client", &self.client)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl LoadGenerator {
    /// Create a generator with a per-request `timeout`
    pub fn new(timeout: Duration, retry: RetryPolicy) -> Result<Self> {
        Ok(Self {
            client: CompletionClient::new(timeout)?,
            retry,
            extractor: Arc::new(LlamaTokenExtractor),
        })
    }

    pub fn from_config(load: &LoadConfig, retry: RetryPolicy) -> Result<Self> {
        Self::new(load.request_timeout(), retry)
    }

    /// Use a different token accounting policy
    pub fn with_extractor(mut self, extractor: Arc<dyn TokenExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Run one measured batch against `base_url`.
    ///
    /// Requests that exhaust their retries or fail in transport count as
    /// errors. A fatal request error abandons the batch and is returned.
    pub async fn run_batch(&self, base_url: &str, spec: &BatchSpec) -> Result<BatchResult> {
        let request = CompletionRequest::new(spec.prompt.clone(), spec.n_predict, spec.temperature);
        let concurrency = spec.concurrency.max(1);
        let mut tally = BatchTally::new()?;

        debug!(
            base_url,
            concurrency,
            total_requests = spec.total_requests,
            n_predict = spec.n_predict,
            "Starting batch"
        );

        let request = &request;
        let started = Instant::now();
        let mut outcomes = stream::iter(0..spec.total_requests)
            .map(move |_| async move {
                let sent = Instant::now();
                let result = self
                    .retry
                    .run(|_| self.client.complete(base_url, request))
                    .await;
                (result, sent.elapsed())
            })
            .buffer_unordered(concurrency);

        while let Some((result, latency)) = outcomes.next().await {
            match result {
                Ok(response) => tally.record_success(self.extractor.as_ref(), &response, latency),
                Err(e) if e.is_fatal_request() => {
                    warn!(base_url, error = %e, "Fatal request error, abandoning batch");
                    return Err(e);
                }
                Err(e) => {
                    debug!(base_url, error = %e, "Request failed");
                    tally.record_failure(&e);
                }
            }
        }

        let result = tally.finish(started.elapsed());
        info!(
            concurrency,
            total_requests = spec.total_requests,
            throughput = %format!("{:.1}", result.throughput_tokens_per_sec),
            total_tokens = result.total_tokens,
            errors = result.error_count,
            "Batch complete"
        );
        Ok(result)
    }

    /// Send `count` discarded requests, one at a time, through the retry
    /// policy. Any failure that survives retries is returned.
    pub async fn warmup(&self, base_url: &str, count: usize, n_predict: u32) -> Result<()> {
        let request = CompletionRequest::warmup(n_predict);
        for index in 0..count {
            self.retry
                .run(|_| self.client.complete(base_url, &request))
                .await?;
            debug!(base_url, index, "Warmup request complete");
        }
        Ok(())
    }
}

/// Run one batch with a fresh generator
#[allow(clippy::too_many_arguments)]
pub async fn run_batch(
    base_url: &str,
    prompt: &str,
    n_predict: u32,
    concurrency: usize,
    total_requests: usize,
    temperature: f32,
    timeout: Duration,
    retry_policy: RetryPolicy,
) -> Result<BatchResult> {
    let spec = BatchSpec {
        prompt: prompt.to_string(),
        n_predict,
        temperature,
        concurrency,
        total_requests,
    };
    LoadGenerator::new(timeout, retry_policy)?
        .run_batch(base_url, &spec)
        .await
}
