//! Sweep planning: cells, tiers and deployment fingerprints
//!
//! Cells are ordered outer to inner: instances, parallel, batch, ubatch,
//! context bucket, max_tokens, concurrency. Cells that can share one set
//! of running processes form a tier, identified by a [`DeploymentSpec`].

use bench_core::{axis_label, LoadConfig, SweepAxes, SweepCell};
use std::fmt;

/// Everything that changes how the server processes are launched.
///
/// Two tiers with equal fingerprints can reuse the same deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeploymentSpec {
    pub instances: usize,
    pub parallel: u32,
    pub batch: Option<u32>,
    pub ubatch: Option<u32>,
    pub ctx_per_session: u32,
}

impl fmt::Display for DeploymentSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "instances={} parallel={} batch={} ubatch={} ctx_per_session={}",
            self.instances,
            self.parallel,
            axis_label(self.batch),
            axis_label(self.ubatch),
            self.ctx_per_session
        )
    }
}

/// Group `max_tokens` values by the per-session context they need.
///
/// Values up to `threshold` share one bucket sized for the threshold;
/// every larger value gets its own bucket sized exactly for it.
pub fn context_buckets(max_tokens: &[u32], threshold: u32) -> Vec<(u32, Vec<u32>)> {
    let (low, high): (Vec<u32>, Vec<u32>) =
        max_tokens.iter().copied().partition(|&n| n <= threshold);

    let mut buckets = Vec::with_capacity(high.len() + 1);
    if !low.is_empty() {
        buckets.push((threshold, low));
    }
    buckets.extend(high.into_iter().map(|n| (n, vec![n])));
    buckets
}

/// Cells served by one deployment
#[derive(Debug, Clone, PartialEq)]
pub struct Tier {
    pub deployment: DeploymentSpec,
    pub cells: Vec<SweepCell>,
}

/// The full, ordered sweep
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    pub tiers: Vec<Tier>,
}

impl SweepPlan {
    pub fn build(axes: &SweepAxes, load: &LoadConfig) -> Self {
        let buckets = context_buckets(&axes.max_tokens, axes.ctx_threshold);
        let mut tiers = Vec::new();

        for &instances in &axes.instances {
            for &parallel in &axes.parallel {
                for &batch in &axes.batch {
                    for &ubatch in &axes.ubatch {
                        for (ctx_per_session, bucket) in &buckets {
                            let deployment = DeploymentSpec {
                                instances,
                                parallel,
                                batch,
                                ubatch,
                                ctx_per_session: *ctx_per_session,
                            };

                            let cells = bucket
                                .iter()
                                .flat_map(|&max_tokens| {
                                    axes.concurrency.iter().map(move |&concurrency| SweepCell {
                                        instances,
                                        parallel,
                                        batch,
                                        ubatch,
                                        max_tokens,
                                        concurrency,
                                        total_requests: load.total_requests(concurrency),
                                    })
                                })
                                .collect();

                            tiers.push(Tier { deployment, cells });
                        }
                    }
                }
            }
        }

        Self { tiers }
    }

    pub fn total_cells(&self) -> usize {
        self.tiers.iter().map(|tier| tier.cells.len()).sum()
    }

    /// Deployments actually started when consecutive equal fingerprints
    /// are reused
    pub fn deployment_count(&self) -> usize {
        self.tiers
            .iter()
            .enumerate()
            .filter(|(i, tier)| *i == 0 || self.tiers[i - 1].deployment != tier.deployment)
            .count()
    }

    pub fn cells(&self) -> impl Iterator<Item = &SweepCell> {
        self.tiers.iter().flat_map(|tier| tier.cells.iter())
    }
}
