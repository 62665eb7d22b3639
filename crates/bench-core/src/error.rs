//! Error handling for llama-sweep
//!
//! A single error type shared by every crate in the workspace. The variants
//! follow the failure taxonomy of a benchmark run: launch problems abort the
//! whole run, readiness and fatal request failures take down one tier, and
//! retryable request failures are absorbed by the retry policy.

use std::fmt;
use std::time::Duration;

/// Result type alias for llama-sweep operations
pub type Result<T> = std::result::Result<T, Error>;

/// Which readiness phase a probe was in when it gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessPhase {
    /// Waiting for `/health` or `/v1/models` to answer
    Liveness,
    /// Waiting for a one-token completion to succeed
    Inference,
    /// Waiting for the proxy listener to accept TCP connections
    Listen,
}

impl fmt::Display for ReadinessPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessPhase::Liveness => write!(f, "liveness"),
            ReadinessPhase::Inference => write!(f, "inference"),
            ReadinessPhase::Listen => write!(f, "listen"),
        }
    }
}

/// Unified error type for llama-sweep
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or non-executable binary, or a missing required input file
    #[error("Launch error: {0}")]
    Launch(String),

    /// The proxy executable could not be located
    #[error("Binary not found: {0}")]
    BinaryNotFound(String),

    /// A process never became live/ready before its deadline
    #[error("{target} did not pass {phase} readiness within {timeout:?}: {last_error}")]
    ReadinessTimeout {
        target: String,
        phase: ReadinessPhase,
        timeout: Duration,
        last_error: String,
    },

    /// The server answered the readiness completion with a non-loading error
    #[error("{target} rejected the readiness completion with HTTP {status}: {body}")]
    ReadinessFatal {
        target: String,
        status: u16,
        body: String,
    },

    /// A supervised process exited on its own before it became ready
    #[error("{target} exited before becoming ready ({status})")]
    ProcessExited { target: String, status: String },

    /// Operation attempted on a process handle that was already terminated
    #[error("Process already terminated: {0}")]
    ProcessTerminated(String),

    /// The run was stopped by a shutdown signal
    #[error("Interrupted: {0}")]
    Interrupted(String),

    /// Server is loading, overloaded or returned a transient 5xx
    #[error("HTTP error {}: {message}", status_label(.status))]
    RetryableRequest { status: Option<u16>, message: String },

    /// Request was rejected in a way retrying cannot fix
    #[error("HTTP error {}: {message}", status_label(.status))]
    FatalRequest { status: Option<u16>, message: String },

    /// Connection refused/reset or request timeout
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Result log errors
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Configuration source errors
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Create a launch error
    pub fn launch(msg: impl Into<String>) -> Self {
        Self::Launch(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Classify a non-success HTTP response.
    ///
    /// 500/502/503/504 and any body mentioning model loading are retryable,
    /// everything else is fatal.
    pub fn from_http_status(status: u16, body: impl Into<String>) -> Self {
        let message = body.into();
        if matches!(status, 500 | 502 | 503 | 504) || is_loading_message(&message) {
            Self::RetryableRequest {
                status: Some(status),
                message,
            }
        } else {
            Self::FatalRequest {
                status: Some(status),
                message,
            }
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::RetryableRequest { .. })
    }

    /// Check if this error should unwind the batch it happened in
    pub fn is_fatal_request(&self) -> bool {
        matches!(self, Error::FatalRequest { .. })
    }

    /// Check if this error must abort the whole sweep regardless of
    /// the continue-on-error setting
    pub fn aborts_run(&self) -> bool {
        matches!(
            self,
            Error::Launch(_)
                | Error::BinaryNotFound(_)
                | Error::InvalidConfiguration(_)
                | Error::Interrupted(_)
        )
    }

    /// Check if this error takes down the current tier only. Such errors
    /// become zero rows when continue-on-error is set.
    pub fn is_tier_failure(&self) -> bool {
        !self.aborts_run()
    }

    /// HTTP status carried by the error, if any
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Error::RetryableRequest { status, .. } | Error::FatalRequest { status, .. } => *status,
            Error::ReadinessFatal { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Error::Launch(_) => "launch",
            Error::BinaryNotFound(_) => "binary_not_found",
            Error::ReadinessTimeout { .. } => "readiness_timeout",
            Error::ReadinessFatal { .. } => "readiness_fatal",
            Error::ProcessExited { .. } => "process_exited",
            Error::ProcessTerminated(_) => "process_terminated",
            Error::Interrupted(_) => "interrupted",
            Error::RetryableRequest { .. } => "retryable_request",
            Error::FatalRequest { .. } => "fatal_request",
            Error::Transport(_) => "transport",
            Error::InvalidConfiguration(_) => "configuration",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Yaml(_) => "yaml",
            Error::Csv(_) => "csv",
            Error::Config(_) => "config",
            Error::Other(_) => "other",
        }
    }
}

fn status_label(status: &Option<u16>) -> String {
    status.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string())
}

fn is_loading_message(message: &str) -> bool {
    message.to_ascii_lowercase().contains("loading model")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_classification() {
        for status in [500, 502, 503, 504] {
            let err = Error::from_http_status(status, "boom");
            assert!(err.is_retryable(), "{} should be retryable", status);
            assert!(!err.is_fatal_request());
        }

        let err = Error::from_http_status(400, "bad request");
        assert!(err.is_fatal_request());
        assert!(!err.is_retryable());
        assert_eq!(err.http_status(), Some(400));

        let err = Error::from_http_status(501, "not implemented");
        assert!(err.is_fatal_request());
    }

    #[test]
    fn test_loading_body_is_retryable() {
        let err = Error::from_http_status(
            400,
            r#"{"error":{"code":503,"message":"Loading model","type":"unavailable_error"}}"#,
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::from_http_status(503, "Loading model");
        assert_eq!(err.to_string(), "HTTP error 503: Loading model");

        let err = Error::ReadinessTimeout {
            target: "127.0.0.1:9000".to_string(),
            phase: ReadinessPhase::Liveness,
            timeout: Duration::from_secs(2),
            last_error: "connection refused".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("127.0.0.1:9000"));
        assert!(text.contains("liveness"));
        assert!(text.contains("connection refused"));
    }

    #[test]
    fn test_run_abort_classification() {
        assert!(Error::launch("missing binary").aborts_run());
        assert!(Error::BinaryNotFound("nginx".into()).aborts_run());
        assert!(!Error::transport("reset").aborts_run());
        assert!(!Error::from_http_status(400, "x").aborts_run());
        assert!(Error::from_http_status(400, "x").is_tier_failure());
        assert!(!Error::config("bad").is_tier_failure());
        assert!(Error::Interrupted("SIGTERM".into()).aborts_run());
    }

    #[test]
    fn test_error_categories() {
        assert_eq!(Error::launch("x").category(), "launch");
        assert_eq!(Error::config("x").category(), "configuration");
        assert_eq!(Error::transport("x").category(), "transport");
    }
}
