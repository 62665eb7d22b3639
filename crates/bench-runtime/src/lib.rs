//! # bench-runtime
//!
//! Lifecycle management for the processes a benchmark drives: inference
//! server instances and the reverse proxy in front of them.
//!
//! Every process lives behind a handle that stops it on all exit paths,
//! so a failed sweep tier never leaks processes or ports.

pub mod args;
pub mod ports;
pub mod pool;
pub mod process;
pub mod proxy;
pub mod readiness;
pub mod resolve;

// Re-export commonly used types
pub use args::{build_server_args, parse_server_args};
pub use ports::{find_free_port_range, is_port_available, pick_free_port};
pub use pool::{start_pool, ServerHandle, ServerPool, ServerTemplate};
pub use process::{ManagedProcess, ProcessSpec, ProcessState};
pub use proxy::{render_nginx_config, start_proxy, ProxyHandle, ProxyLauncher};
pub use readiness::{quick_readiness, ReadinessProber};
pub use resolve::{
    ensure_model, find_executable, resolve_proxy_binary, resolve_server_binary,
};
