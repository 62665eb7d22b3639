//! # bench-sweep
//!
//! Multi-dimensional benchmark sweeps: the sweep plan (cells grouped into
//! tiers by deployment fingerprint), the driver that reuses or redeploys
//! server pools between tiers, the CSV result log, progress reporting and
//! the end-of-run summary.

pub mod deploy;
pub mod driver;
pub mod plan;
pub mod progress;
pub mod results;
pub mod summary;

// Re-export commonly used types
pub use deploy::{ProcessDeployer, ProcessDeployment};
pub use driver::{Deployer, Deployment, SweepDriver, SweepOutcome};
pub use plan::{context_buckets, DeploymentSpec, SweepPlan, Tier};
pub use progress::{ChannelReporter, LogReporter, Progress, ProgressReporter};
pub use results::{results_path, CsvResultLog, MemorySink, ResultRow, ResultSink, CSV_HEADER};
pub use summary::{render_summary, throughput_table, BestCell};
