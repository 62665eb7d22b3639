//! Configuration for llama-sweep
//!
//! One explicit configuration tree, threaded from the sweep driver down to
//! each component. Sources are merged with precedence:
//! 1. Command line arguments (highest, applied by the binary)
//! 2. `LLAMA_*` environment variables
//! 3. Configuration file (YAML or JSON)
//! 4. Defaults (lowest)
//!
//! Only the binary calls [`SweepConfig::load`]; library code receives the
//! already-merged structs.

use crate::axes::{parse_comma_args, parse_flag, parse_int_list, parse_optional_int_list};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Host every component binds to unless told otherwise
pub const DEFAULT_HOST: &str = "127.0.0.1";

fn seconds(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

/// Main configuration structure for a sweep run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// How server instances are launched
    pub server: ServerLaunchConfig,

    /// Readiness probing of launched servers
    pub readiness: ReadinessConfig,

    /// Round-robin reverse proxy in front of the pool
    pub proxy: ProxyConfig,

    /// Request shape and batch sizing
    pub load: LoadConfig,

    /// Per-request retry policy
    pub retry: RetryConfig,

    /// Swept parameter axes
    pub axes: SweepAxes,

    /// Result file location
    pub output: OutputConfig,

    /// Record zero rows and move on when a tier fails
    pub continue_on_error: bool,

    /// Pause between cells in seconds
    pub cell_pause_seconds: f64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            server: ServerLaunchConfig::default(),
            readiness: ReadinessConfig::default(),
            proxy: ProxyConfig::default(),
            load: LoadConfig::default(),
            retry: RetryConfig::default(),
            axes: SweepAxes::default(),
            output: OutputConfig::default(),
            continue_on_error: true,
            cell_pause_seconds: 0.0,
        }
    }
}

impl SweepConfig {
    /// Load configuration from an optional file plus `LLAMA_*` environment
    /// variables, then validate it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };

        EnvOverrides::from_env()?.apply(&mut config)?;
        config.validate()?;

        tracing::debug!(
            file = ?path,
            cells = config.axes.cell_count(),
            "Loaded sweep configuration"
        );
        Ok(config)
    }

    /// Load configuration from a specific file without consulting the
    /// environment
    pub fn load_from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Err(Error::config(format!(
                "config file not found: {}",
                path.display()
            )));
        }

        let parsed: Self = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?
            .try_deserialize()?;
        Ok(parsed)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.readiness.validate()?;
        self.proxy.validate()?;
        self.load.validate()?;
        self.retry.validate()?;
        self.axes.validate()?;

        if !self.proxy.enabled && self.axes.instances.iter().any(|&n| n > 1) {
            return Err(Error::config(
                "multiple instances need the proxy; enable proxy or sweep instances=1 only",
            ));
        }

        if self.cell_pause_seconds < 0.0 {
            return Err(Error::config("cell pause must be >= 0"));
        }

        Ok(())
    }

    pub fn cell_pause(&self) -> Duration {
        seconds(self.cell_pause_seconds)
    }

    /// Render the effective configuration as YAML
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// How each inference server instance is launched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerLaunchConfig {
    /// Explicit server executable
    pub binary: Option<PathBuf>,

    /// llama.cpp checkout to search for a server executable
    pub llama_cpp_dir: Option<PathBuf>,

    /// Model file passed as `--model`
    pub model_path: Option<PathBuf>,

    /// Host the servers bind to
    pub host: String,

    /// First port of the pool, picked automatically when unset
    pub base_port: Option<u16>,

    /// Extra arguments appended to every launch
    pub extra_args: Vec<String>,

    /// Working directory for the server processes
    pub working_dir: Option<PathBuf>,

    /// Extra environment for the server processes
    pub env: HashMap<String, String>,

    /// Pause between instance launches in seconds
    pub startup_delay_seconds: f64,

    /// Grace period between SIGTERM and SIGKILL in seconds
    pub shutdown_grace_seconds: f64,
}

impl Default for ServerLaunchConfig {
    fn default() -> Self {
        Self {
            binary: None,
            llama_cpp_dir: None,
            model_path: None,
            host: DEFAULT_HOST.to_string(),
            base_port: Some(9000),
            extra_args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            startup_delay_seconds: 0.0,
            shutdown_grace_seconds: 10.0,
        }
    }
}

impl ServerLaunchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::config("server host cannot be empty"));
        }
        if self.startup_delay_seconds < 0.0 || self.shutdown_grace_seconds < 0.0 {
            return Err(Error::config("server delays must be >= 0"));
        }
        Ok(())
    }

    pub fn startup_delay(&self) -> Duration {
        seconds(self.startup_delay_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        seconds(self.shutdown_grace_seconds)
    }
}

/// Two-phase readiness probing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    /// Deadline for `/health` or `/v1/models` to answer
    pub liveness_timeout_seconds: f64,

    /// Deadline for a one-token completion to succeed
    pub inference_timeout_seconds: f64,

    /// Delay between probe rounds in milliseconds
    pub poll_interval_ms: u64,

    /// Timeout of a single liveness request
    pub probe_timeout_seconds: f64,

    /// Timeout of a single readiness completion request
    pub completion_probe_timeout_seconds: f64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            liveness_timeout_seconds: 180.0,
            inference_timeout_seconds: 180.0,
            poll_interval_ms: 500,
            probe_timeout_seconds: 2.0,
            completion_probe_timeout_seconds: 5.0,
        }
    }
}

impl ReadinessConfig {
    pub fn validate(&self) -> Result<()> {
        if self.liveness_timeout_seconds <= 0.0 || self.inference_timeout_seconds <= 0.0 {
            return Err(Error::config("readiness timeouts must be > 0"));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::config("readiness poll interval must be > 0"));
        }
        Ok(())
    }

    pub fn liveness_timeout(&self) -> Duration {
        seconds(self.liveness_timeout_seconds)
    }

    pub fn inference_timeout(&self) -> Duration {
        seconds(self.inference_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        seconds(self.probe_timeout_seconds)
    }

    pub fn completion_probe_timeout(&self) -> Duration {
        seconds(self.completion_probe_timeout_seconds)
    }
}

/// Reverse proxy (nginx) settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Put a proxy in front of the pool
    pub enabled: bool,

    /// Explicit proxy executable, `nginx` on PATH otherwise
    pub binary: Option<PathBuf>,

    /// Listen host, defaults to the server host
    pub listen_host: Option<String>,

    pub listen_port: u16,

    /// Deadline for the listener to accept connections
    pub ready_timeout_seconds: f64,

    pub shutdown_grace_seconds: f64,

    pub worker_connections: u32,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            binary: None,
            listen_host: None,
            listen_port: 8088,
            ready_timeout_seconds: 20.0,
            shutdown_grace_seconds: 5.0,
            worker_connections: 1024,
        }
    }
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.listen_port == 0 {
            return Err(Error::config("proxy listen port must be set"));
        }
        if self.ready_timeout_seconds <= 0.0 {
            return Err(Error::config("proxy ready timeout must be > 0"));
        }
        if self.worker_connections == 0 {
            return Err(Error::config("proxy worker connections must be > 0"));
        }
        Ok(())
    }

    pub fn ready_timeout(&self) -> Duration {
        seconds(self.ready_timeout_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        seconds(self.shutdown_grace_seconds)
    }
}

/// Completion request shape and batch sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    pub prompt: String,

    pub temperature: f32,

    /// Timeout of one completion call in seconds
    pub request_timeout_seconds: f64,

    /// Fixed request count per cell, overrides the multiplier
    pub num_requests: Option<usize>,

    /// Requests per cell as a multiple of concurrency
    pub requests_multiplier: usize,

    /// Discarded requests sent before each measured batch
    pub warmup_requests: usize,

    /// `n_predict` of warmup requests
    pub warmup_n_predict: u32,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            prompt: "Share three optimization tips for model serving.".to_string(),
            temperature: 0.3,
            request_timeout_seconds: 120.0,
            num_requests: None,
            requests_multiplier: 1,
            warmup_requests: 2,
            warmup_n_predict: 8,
        }
    }
}

impl LoadConfig {
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_seconds <= 0.0 {
            return Err(Error::config("request timeout must be > 0"));
        }
        if self.num_requests == Some(0) {
            return Err(Error::config("num_requests must be >= 1"));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        seconds(self.request_timeout_seconds)
    }

    /// Requests issued for a cell with the given concurrency
    pub fn total_requests(&self, concurrency: usize) -> usize {
        match self.num_requests {
            Some(n) => n.max(1),
            None => concurrency.saturating_mul(self.requests_multiplier.max(1)).max(1),
        }
    }
}

/// Retry policy for completion requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,

    /// Linear backoff unit: attempt `n` sleeps `n × base` before retrying
    pub base_sleep_seconds: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_sleep_seconds: 0.5,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::config("retry attempts must be >= 1"));
        }
        if self.base_sleep_seconds < 0.0 {
            return Err(Error::config("retry sleep must be >= 0"));
        }
        Ok(())
    }

    pub fn base_sleep(&self) -> Duration {
        seconds(self.base_sleep_seconds)
    }
}

/// The swept parameter axes, outermost first
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepAxes {
    pub instances: Vec<usize>,
    pub parallel: Vec<u32>,
    pub batch: Vec<Option<u32>>,
    pub ubatch: Vec<Option<u32>>,
    pub max_tokens: Vec<u32>,
    pub concurrency: Vec<usize>,

    /// max_tokens values up to this share one server lifetime sized for
    /// the threshold; larger values get a dedicated restart each
    pub ctx_threshold: u32,
}

impl Default for SweepAxes {
    fn default() -> Self {
        Self {
            instances: vec![2],
            parallel: vec![1],
            batch: vec![None],
            ubatch: vec![None],
            max_tokens: vec![128],
            concurrency: vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1024],
            ctx_threshold: 2048,
        }
    }
}

impl SweepAxes {
    pub fn validate(&self) -> Result<()> {
        if self.instances.is_empty()
            || self.parallel.is_empty()
            || self.batch.is_empty()
            || self.ubatch.is_empty()
            || self.max_tokens.is_empty()
            || self.concurrency.is_empty()
        {
            return Err(Error::config("every sweep axis needs at least one value"));
        }
        if self.instances.contains(&0) {
            return Err(Error::config("instance count must be >= 1"));
        }
        if self.parallel.contains(&0) {
            return Err(Error::config("parallel must be >= 1"));
        }
        if self.max_tokens.contains(&0) {
            return Err(Error::config("max_tokens must be >= 1"));
        }
        if self.concurrency.contains(&0) {
            return Err(Error::config("concurrency must be >= 1"));
        }
        if self.ctx_threshold == 0 {
            return Err(Error::config("context threshold must be >= 1"));
        }
        Ok(())
    }

    /// Number of leaf cells the axes describe
    pub fn cell_count(&self) -> usize {
        self.instances.len()
            * self.parallel.len()
            * self.batch.len()
            * self.ubatch.len()
            * self.max_tokens.len()
            * self.concurrency.len()
    }
}

/// Where result files go
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub results_dir: PathBuf,
    pub subdir: String,
    pub prefix: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            results_dir: PathBuf::from("results"),
            subdir: "full_sweep".to_string(),
            prefix: "full_sweep".to_string(),
        }
    }
}

/// `LLAMA_*` environment variables, read once by [`SweepConfig::load`]
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct EnvOverrides {
    pub server_bin: Option<String>,
    pub cpp_dir: Option<String>,
    pub model_path: Option<String>,
    pub server_host: Option<String>,
    pub server_base_port: Option<String>,
    pub server_args: Option<String>,
    pub startup_delay_s: Option<String>,
    pub server_bind_timeout: Option<String>,
    pub ready_timeout: Option<String>,
    pub nginx_port: Option<String>,
    pub prompt: Option<String>,
    pub temperature: Option<String>,
    pub request_timeout: Option<String>,
    pub num_requests: Option<String>,
    pub requests_multiplier: Option<String>,
    pub warmup_requests: Option<String>,
    pub retry_attempts: Option<String>,
    pub retry_sleep_s: Option<String>,
    pub instances_list: Option<String>,
    pub parallel_list: Option<String>,
    pub parallel: Option<String>,
    pub batch_list: Option<String>,
    pub ubatch_list: Option<String>,
    pub max_tokens_list: Option<String>,
    pub n_predict: Option<String>,
    pub concurrency_list: Option<String>,
    pub ctx_threshold: Option<String>,
    pub cell_pause_s: Option<String>,
    pub continue_on_error: Option<String>,
    pub results_dir: Option<String>,

    /// From `NGINX_BIN`
    #[serde(skip)]
    pub nginx_bin: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NginxEnv {
    bin: Option<String>,
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| Error::config(format!("invalid value for {}: '{}' ({})", key, raw, e)))
}

impl EnvOverrides {
    /// Collect overrides from the process environment
    pub fn from_env() -> Result<Self> {
        let mut overrides: Self = config::Config::builder()
            .add_source(config::Environment::with_prefix("LLAMA"))
            .build()?
            .try_deserialize()?;

        let nginx: NginxEnv = config::Config::builder()
            .add_source(config::Environment::with_prefix("NGINX"))
            .build()?
            .try_deserialize()?;
        overrides.nginx_bin = nginx.bin;

        Ok(overrides)
    }

    /// Apply every override that is set
    pub fn apply(&self, config: &mut SweepConfig) -> Result<()> {
        if let Some(v) = &self.server_bin {
            config.server.binary = Some(PathBuf::from(v));
        }
        if let Some(v) = &self.cpp_dir {
            config.server.llama_cpp_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = &self.model_path {
            config.server.model_path = Some(PathBuf::from(v));
        }
        if let Some(v) = &self.server_host {
            config.server.host = v.trim().to_string();
        }
        if let Some(v) = &self.server_base_port {
            config.server.base_port = Some(parse_value("LLAMA_SERVER_BASE_PORT", v)?);
        }
        if let Some(v) = &self.server_args {
            config.server.extra_args = parse_comma_args(v);
        }
        if let Some(v) = &self.startup_delay_s {
            config.server.startup_delay_seconds = parse_value("LLAMA_STARTUP_DELAY_S", v)?;
        }
        if let Some(v) = &self.server_bind_timeout {
            config.readiness.liveness_timeout_seconds =
                parse_value("LLAMA_SERVER_BIND_TIMEOUT", v)?;
        }
        if let Some(v) = &self.ready_timeout {
            config.readiness.inference_timeout_seconds = parse_value("LLAMA_READY_TIMEOUT", v)?;
        }
        if let Some(v) = &self.nginx_port {
            config.proxy.listen_port = parse_value("LLAMA_NGINX_PORT", v)?;
        }
        if let Some(v) = &self.nginx_bin {
            config.proxy.binary = Some(PathBuf::from(v));
        }
        if let Some(v) = &self.prompt {
            config.load.prompt = v.clone();
        }
        if let Some(v) = &self.temperature {
            config.load.temperature = parse_value("LLAMA_TEMPERATURE", v)?;
        }
        if let Some(v) = &self.request_timeout {
            config.load.request_timeout_seconds = parse_value("LLAMA_REQUEST_TIMEOUT", v)?;
        }
        if let Some(v) = &self.num_requests {
            config.load.num_requests = Some(parse_value("LLAMA_NUM_REQUESTS", v)?);
        }
        if let Some(v) = &self.requests_multiplier {
            config.load.requests_multiplier = parse_value("LLAMA_REQUESTS_MULTIPLIER", v)?;
        }
        if let Some(v) = &self.warmup_requests {
            config.load.warmup_requests = parse_value("LLAMA_WARMUP_REQUESTS", v)?;
        }
        if let Some(v) = &self.retry_attempts {
            config.retry.max_attempts = parse_value("LLAMA_RETRY_ATTEMPTS", v)?;
        }
        if let Some(v) = &self.retry_sleep_s {
            config.retry.base_sleep_seconds = parse_value("LLAMA_RETRY_SLEEP_S", v)?;
        }
        if let Some(v) = &self.instances_list {
            config.axes.instances = parse_int_list(v)?;
        }
        // A single LLAMA_PARALLEL acts as a one-value list unless the list is set
        if let Some(v) = &self.parallel {
            config.axes.parallel = vec![parse_value("LLAMA_PARALLEL", v)?];
        }
        if let Some(v) = &self.parallel_list {
            config.axes.parallel = parse_int_list(v)?;
        }
        if let Some(v) = &self.batch_list {
            config.axes.batch = parse_optional_int_list(v)?;
        }
        if let Some(v) = &self.ubatch_list {
            config.axes.ubatch = parse_optional_int_list(v)?;
        }
        if let Some(v) = &self.n_predict {
            config.axes.max_tokens = vec![parse_value("LLAMA_N_PREDICT", v)?];
        }
        if let Some(v) = &self.max_tokens_list {
            config.axes.max_tokens = parse_int_list(v)?;
        }
        if let Some(v) = &self.concurrency_list {
            config.axes.concurrency = parse_int_list(v)?;
        }
        if let Some(v) = &self.ctx_threshold {
            config.axes.ctx_threshold = parse_value("LLAMA_CTX_THRESHOLD", v)?;
        }
        if let Some(v) = &self.cell_pause_s {
            config.cell_pause_seconds = parse_value("LLAMA_CELL_PAUSE_S", v)?;
        }
        if let Some(v) = &self.continue_on_error {
            config.continue_on_error = parse_flag(v);
        }
        if let Some(v) = &self.results_dir {
            config.output.results_dir = PathBuf::from(v);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = SweepConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.continue_on_error);
        assert_eq!(config.proxy.listen_port, 8088);
        assert_eq!(config.server.base_port, Some(9000));
        assert_eq!(config.retry.max_attempts, 8);
        assert_eq!(config.axes.ctx_threshold, 2048);
    }

    #[test]
    fn test_config_validation() {
        let mut config = SweepConfig::default();

        config.axes.concurrency.clear();
        assert!(config.validate().is_err());

        config.axes.concurrency = vec![1];
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());

        config.retry.max_attempts = 1;
        config.proxy.enabled = false;
        assert!(config.validate().is_err(), "2 instances without a proxy");

        config.axes.instances = vec![1];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_total_requests() {
        let mut load = LoadConfig::default();
        assert_eq!(load.total_requests(8), 8);

        load.requests_multiplier = 0;
        assert_eq!(load.total_requests(8), 8, "multiplier clamps to 1");

        load.requests_multiplier = 3;
        assert_eq!(load.total_requests(4), 12);

        load.num_requests = Some(5);
        assert_eq!(load.total_requests(64), 5);
    }

    #[test]
    fn test_env_overrides_apply() {
        let overrides = EnvOverrides {
            server_base_port: Some("9100".to_string()),
            server_args: Some("--threads,8".to_string()),
            instances_list: Some("1,2".to_string()),
            parallel: Some("4".to_string()),
            batch_list: Some("default,512".to_string()),
            max_tokens_list: Some("128 4096".to_string()),
            concurrency_list: Some("1,2,4".to_string()),
            continue_on_error: Some("no".to_string()),
            ready_timeout: Some("30".to_string()),
            nginx_bin: Some("/usr/sbin/nginx".to_string()),
            ..Default::default()
        };

        let mut config = SweepConfig::default();
        overrides.apply(&mut config).unwrap();

        assert_eq!(config.server.base_port, Some(9100));
        assert_eq!(config.server.extra_args, vec!["--threads", "8"]);
        assert_eq!(config.axes.instances, vec![1, 2]);
        assert_eq!(config.axes.parallel, vec![4]);
        assert_eq!(config.axes.batch, vec![None, Some(512)]);
        assert_eq!(config.axes.max_tokens, vec![128, 4096]);
        assert_eq!(config.axes.concurrency, vec![1, 2, 4]);
        assert!(!config.continue_on_error);
        assert_eq!(config.readiness.inference_timeout_seconds, 30.0);
        assert_eq!(config.proxy.binary, Some(PathBuf::from("/usr/sbin/nginx")));
    }

    #[test]
    fn test_env_override_rejects_bad_number() {
        let overrides = EnvOverrides {
            nginx_port: Some("eighty".to_string()),
            ..Default::default()
        };
        let err = overrides.apply(&mut SweepConfig::default()).unwrap_err();
        assert!(err.to_string().contains("LLAMA_NGINX_PORT"));
    }

    #[test]
    fn test_load_from_yaml_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sweep.yaml");
        std::fs::write(
            &path,
            "continue_on_error: false\n\
             axes:\n  instances: [1, 4]\n  batch: [null, 256]\n\
             proxy:\n  listen_port: 18088\n",
        )
        .unwrap();

        let config = SweepConfig::load_from_file(&path).unwrap();
        assert!(!config.continue_on_error);
        assert_eq!(config.axes.instances, vec![1, 4]);
        assert_eq!(config.axes.batch, vec![None, Some(256)]);
        assert_eq!(config.proxy.listen_port, 18088);
        // Untouched sections keep their defaults
        assert_eq!(config.retry.max_attempts, 8);
    }

    #[test]
    fn test_config_serialization() {
        let config = SweepConfig::default();

        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("continue_on_error: true"));
        let deserialized: SweepConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_yaml_written_by_to_yaml_loads_back() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("sweep.yaml");

        let mut config = SweepConfig::default();
        config.axes.concurrency = vec![3, 7];
        config.proxy.enabled = false;
        config.axes.instances = vec![1];
        config.axes.batch = vec![Some(512)];
        config.axes.ubatch = vec![Some(128)];
        std::fs::write(&path, config.to_yaml().unwrap()).unwrap();

        assert_eq!(SweepConfig::load_from_file(&path).unwrap(), config);
    }
}
