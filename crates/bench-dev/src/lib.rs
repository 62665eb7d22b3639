//! # bench-dev
//!
//! Development and testing utilities for llama-sweep.
//!
//! This crate provides:
//! - A mock llama.cpp-style inference server with scriptable failures
//! - Helpers for process-level tests (scripts, PID files, liveness checks)
//! - Test logging setup

pub mod mock_server;
pub mod utils;

// Re-export commonly used types
pub use mock_server::{MockBehavior, MockServer, ResponseShape};
pub use utils::{
    pid_alive, read_pids, setup_test_logging, wait_for_exit, write_script, write_sleeper_script,
};
