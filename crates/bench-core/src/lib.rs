//! # bench-core
//!
//! Shared types, configuration and errors for llama-sweep, a benchmark
//! harness that sweeps llama.cpp server deployments and measures
//! generation throughput.
//!
//! This crate provides the pieces every other crate in the workspace
//! builds on:
//!
//! - The unified [`Error`] type and its retry/abort classification
//! - The [`SweepConfig`] tree threaded from the sweep driver downwards
//! - Sweep cells, batch results and axis list parsing

pub mod axes;
pub mod config;
pub mod error;
pub mod types;

// Re-export commonly used types at the crate root
pub use config::{
    EnvOverrides, LoadConfig, OutputConfig, ProxyConfig, ReadinessConfig, RetryConfig,
    ServerLaunchConfig, SweepAxes, SweepConfig,
};
pub use error::{Error, ReadinessPhase, Result};
pub use types::{axis_label, BatchResult, SweepCell, Upstream};
