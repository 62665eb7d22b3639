//! Core data model shared by the runtime, load and sweep crates

use serde::{Deserialize, Serialize};
use std::fmt;

/// One backend server instance behind the proxy
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
}

impl Upstream {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `http://host:port`
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Render an optional axis value the way result rows show it
pub fn axis_label(value: Option<u32>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "default".to_string(),
    }
}

/// One point of the sweep's parameter space.
///
/// Constructed once by the sweep plan and consumed by a single load
/// generator invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SweepCell {
    /// Number of server instances behind the proxy
    pub instances: usize,

    /// Parallel decoding slots per instance
    pub parallel: u32,

    /// Logical batch size, `None` leaves the server default
    pub batch: Option<u32>,

    /// Physical micro-batch size, `None` leaves the server default
    pub ubatch: Option<u32>,

    /// Tokens requested per completion (`n_predict`)
    pub max_tokens: u32,

    /// Requests in flight at once
    pub concurrency: usize,

    /// Requests issued for this cell
    pub total_requests: usize,
}

impl SweepCell {
    pub fn batch_label(&self) -> String {
        axis_label(self.batch)
    }

    pub fn ubatch_label(&self) -> String {
        axis_label(self.ubatch)
    }
}

impl fmt::Display for SweepCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "instances={} parallel={} batch={} ubatch={} max_tokens={} concurrency={}",
            self.instances,
            self.parallel,
            self.batch_label(),
            self.ubatch_label(),
            self.max_tokens,
            self.concurrency
        )
    }
}

/// Aggregated outcome of one batch of completion requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    /// Generated tokens per wall-clock second across the whole batch
    pub throughput_tokens_per_sec: f64,

    /// Sum of tokens over all successful responses
    pub total_tokens: u64,

    /// Wall-clock time from first dispatch to last completion
    pub elapsed_seconds: f64,

    /// Requests that failed permanently
    pub error_count: usize,

    /// Text of the most recent failure
    pub last_error: Option<String>,

    /// Requests that returned a usable response
    pub successful_requests: usize,

    /// Mean of the server-reported per-request generation rate
    pub mean_request_tps: f64,

    pub latency_p50_ms: u64,
    pub latency_p95_ms: u64,
    pub latency_max_ms: u64,
}

impl BatchResult {
    /// Zero-valued result standing in for a cell that never ran
    pub fn failed(total_requests: usize, error: impl Into<String>) -> Self {
        Self {
            throughput_tokens_per_sec: 0.0,
            total_tokens: 0,
            elapsed_seconds: 0.0,
            error_count: total_requests,
            last_error: Some(error.into()),
            successful_requests: 0,
            mean_request_tps: 0.0,
            latency_p50_ms: 0,
            latency_p95_ms: 0,
            latency_max_ms: 0,
        }
    }

    /// Throughput in tokens/second, 0.0 when nothing was measured
    pub fn throughput(total_tokens: u64, elapsed_seconds: f64) -> f64 {
        if elapsed_seconds > 0.0 && elapsed_seconds.is_finite() {
            total_tokens as f64 / elapsed_seconds
        } else {
            0.0
        }
    }
}
