//! # bench-load
//!
//! Load generation against an inference endpoint: a completion client,
//! pluggable token accounting, a bounded retry policy and a load
//! generator that runs batches with a fixed number of requests in flight.

pub mod client;
pub mod load_generator;
pub mod retry;
pub mod tokens;

// Re-export commonly used types
pub use client::{CompletionClient, CompletionRequest};
pub use load_generator::{run_batch, BatchSpec, LoadGenerator};
pub use retry::{with_retry, RetryPolicy, RetryState};
pub use tokens::{
    extract_token_count, extract_tokens_per_second, FieldPathExtractor, LlamaTokenExtractor,
    TokenExtractor,
};
