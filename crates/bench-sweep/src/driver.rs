//! Sweep driver
//!
//! Walks the plan tier by tier, keeping one deployment alive for as long
//! as consecutive tiers share its fingerprint. Every cell produces exactly
//! one row: measured, or zero-valued when its tier could not serve it.

use crate::plan::{DeploymentSpec, SweepPlan, Tier};
use crate::progress::{LogReporter, Progress, ProgressReporter};
use crate::results::{ResultRow, ResultSink};
use crate::summary::BestCell;
use async_trait::async_trait;
use bench_core::{BatchResult, Error, LoadConfig, Result, SweepCell, SweepConfig};
use bench_load::{BatchSpec, LoadGenerator};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Brings up the processes a tier needs
#[async_trait]
pub trait Deployer: Send + Sync {
    async fn deploy(&self, spec: &DeploymentSpec) -> Result<Box<dyn Deployment>>;
}

/// A running deployment that load can be sent to
#[async_trait]
pub trait Deployment: Send {
    /// URL the load generator targets
    fn base_url(&self) -> &str;

    /// Release every process and file the deployment owns
    async fn shutdown(self: Box<Self>) -> Result<()>;
}

/// What a finished sweep produced
#[derive(Debug, Clone, Default)]
pub struct SweepOutcome {
    pub rows: Vec<ResultRow>,
    pub best: Option<BestCell>,
    pub failed_tiers: usize,
    pub deployments: usize,
    pub elapsed: Duration,
}

struct Active {
    spec: DeploymentSpec,
    deployment: Box<dyn Deployment>,
}

struct RunState<'a> {
    sink: &'a mut dyn ResultSink,
    started: Instant,
    total: usize,
    outcome: SweepOutcome,
}

/// Runs a [`SweepPlan`] against deployments from `D`
pub struct SweepDriver<D> {
    deployer: D,
    generator: LoadGenerator,
    load: LoadConfig,
    continue_on_error: bool,
    cell_pause: Duration,
    reporter: Arc<dyn ProgressReporter>,
}

impl<D: Deployer> SweepDriver<D> {
    pub fn new(deployer: D, generator: LoadGenerator, config: &SweepConfig) -> Self {
        Self {
            deployer,
            generator,
            load: config.load.clone(),
            continue_on_error: config.continue_on_error,
            cell_pause: config.cell_pause(),
            reporter: Arc::new(LogReporter),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn deployer(&self) -> &D {
        &self.deployer
    }

    /// Run every tier in order, writing each row to `sink` as it is
    /// produced. The active deployment is torn down on every exit path.
    pub async fn run(&self, plan: &SweepPlan, sink: &mut dyn ResultSink) -> Result<SweepOutcome> {
        self.run_until(plan, sink, std::future::pending()).await
    }

    /// Like [`run`](Self::run), but stops with [`Error::Interrupted`] as
    /// soon as `shutdown` completes. The deployment is torn down first.
    pub async fn run_until<F>(
        &self,
        plan: &SweepPlan,
        sink: &mut dyn ResultSink,
        shutdown: F,
    ) -> Result<SweepOutcome>
    where
        F: Future<Output = ()>,
    {
        let mut state = RunState {
            sink,
            started: Instant::now(),
            total: plan.total_cells(),
            outcome: SweepOutcome::default(),
        };
        let mut active: Option<Active> = None;

        info!(
            tiers = plan.tiers.len(),
            cells = state.total,
            "Starting sweep"
        );

        let result = tokio::select! {
            result = self.run_tiers(plan, &mut active, &mut state) => result,
            _ = shutdown => {
                warn!("Shutdown requested, stopping sweep");
                Err(Error::Interrupted("shutdown signal received".to_string()))
            }
        };
        teardown(&mut active).await;

        let mut outcome = state.outcome;
        outcome.elapsed = state.started.elapsed();
        result?;

        info!(
            cells = outcome.rows.len(),
            failed_tiers = outcome.failed_tiers,
            elapsed = %format!("{:.1}s", outcome.elapsed.as_secs_f64()),
            "Sweep complete"
        );
        Ok(outcome)
    }

    async fn run_tiers(
        &self,
        plan: &SweepPlan,
        active: &mut Option<Active>,
        state: &mut RunState<'_>,
    ) -> Result<()> {
        for tier in &plan.tiers {
            let reuse = matches!(active, Some(current) if current.spec == tier.deployment);
            let mut fresh = false;
            if reuse {
                debug!(deployment = %tier.deployment, "Reusing running deployment");
            } else {
                teardown(active).await;
                info!(deployment = %tier.deployment, "Deploying tier");

                match self.deployer.deploy(&tier.deployment).await {
                    Ok(deployment) => {
                        state.outcome.deployments += 1;
                        fresh = true;
                        *active = Some(Active {
                            spec: tier.deployment,
                            deployment,
                        });
                    }
                    Err(e) => {
                        error!(
                            deployment = %tier.deployment,
                            category = e.category(),
                            "Tier failed to start: {}",
                            e
                        );
                        if e.aborts_run() || !self.continue_on_error {
                            return Err(e);
                        }
                        state.outcome.failed_tiers += 1;
                        self.record_zero_rows(&tier.cells, &e, state)?;
                        continue;
                    }
                }
            }

            self.run_tier(tier, fresh, active, state).await?;
        }
        Ok(())
    }

    /// Measure every cell of `tier`. A freshly started deployment is
    /// warmed up once before its first cell.
    async fn run_tier(
        &self,
        tier: &Tier,
        fresh: bool,
        active: &mut Option<Active>,
        state: &mut RunState<'_>,
    ) -> Result<()> {
        let base_url = match active {
            Some(current) => current.deployment.base_url().to_string(),
            None => return Ok(()),
        };

        if fresh && self.load.warmup_requests > 0 {
            let warmup = self
                .generator
                .warmup(&base_url, self.load.warmup_requests, self.load.warmup_n_predict)
                .await;
            if let Err(e) = warmup {
                error!(
                    deployment = %tier.deployment,
                    category = e.category(),
                    "Warmup failed: {}",
                    e
                );
                return self.fail_tier(&tier.cells, e, active, state).await;
            }
        }

        for (index, cell) in tier.cells.iter().enumerate() {
            match self.run_cell(&base_url, cell).await {
                Ok(result) => self.record(cell, result, state)?,
                Err(e) => {
                    error!(cell = %cell, category = e.category(), "Cell failed: {}", e);
                    return self.fail_tier(&tier.cells[index..], e, active, state).await;
                }
            }

            if !self.cell_pause.is_zero() && state.outcome.rows.len() < state.total {
                tokio::time::sleep(self.cell_pause).await;
            }
        }
        Ok(())
    }

    /// Zero rows for `cells`, then drop the deployment so the next tier
    /// starts from fresh processes
    async fn fail_tier(
        &self,
        cells: &[SweepCell],
        cause: Error,
        active: &mut Option<Active>,
        state: &mut RunState<'_>,
    ) -> Result<()> {
        if cause.aborts_run() || !self.continue_on_error {
            return Err(cause);
        }
        state.outcome.failed_tiers += 1;
        self.record_zero_rows(cells, &cause, state)?;
        teardown(active).await;
        Ok(())
    }

    async fn run_cell(&self, base_url: &str, cell: &SweepCell) -> Result<BatchResult> {
        let spec = BatchSpec {
            prompt: self.load.prompt.clone(),
            n_predict: cell.max_tokens,
            temperature: self.load.temperature,
            concurrency: cell.concurrency,
            total_requests: cell.total_requests,
        };
        self.generator.run_batch(base_url, &spec).await
    }

    fn record_zero_rows(
        &self,
        cells: &[SweepCell],
        cause: &Error,
        state: &mut RunState<'_>,
    ) -> Result<()> {
        warn!(cells = cells.len(), "Recording zero rows");
        let message = cause.to_string();
        for cell in cells {
            self.record(cell, BatchResult::failed(cell.total_requests, message.clone()), state)?;
        }
        Ok(())
    }

    fn record(
        &self,
        cell: &SweepCell,
        result: BatchResult,
        state: &mut RunState<'_>,
    ) -> Result<()> {
        if result.error_count > 0 {
            warn!(
                cell = %cell,
                errors = result.error_count,
                last_error = ?result.last_error,
                "Cell had request errors"
            );
        }

        let row = ResultRow::new(cell.clone(), result);
        state.sink.record(&row)?;

        if BestCell::update(&mut state.outcome.best, &row) {
            debug!(cell = %cell, throughput = row.throughput(), "New best cell");
        }
        let progress = Progress {
            completed: state.outcome.rows.len() + 1,
            total: state.total,
            elapsed: state.started.elapsed(),
            last: cell.clone(),
            errors: row.result.error_count,
            last_error: row.result.last_error.clone(),
        };
        state.outcome.rows.push(row);
        self.reporter.report(&progress);
        Ok(())
    }
}

async fn teardown(active: &mut Option<Active>) {
    if let Some(current) = active.take() {
        info!(deployment = %current.spec, "Tearing down deployment");
        if let Err(e) = current.deployment.shutdown().await {
            warn!(deployment = %current.spec, "Teardown failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ChannelReporter;
    use crate::results::MemorySink;
    use bench_core::SweepAxes;
    use bench_dev::{setup_test_logging, MockBehavior, MockServer};
    use bench_load::RetryPolicy;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Serves each instance count from its own mock server
    #[derive(Default)]
    struct FakeDeployer {
        servers: HashMap<usize, String>,
        failing: Vec<usize>,
        launch_error: bool,
        deploys: Arc<AtomicUsize>,
        shutdowns: Arc<AtomicUsize>,
        seen: Mutex<Vec<DeploymentSpec>>,
    }

    struct FakeDeployment {
        base_url: String,
        shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Deployment for FakeDeployment {
        fn base_url(&self) -> &str {
            &self.base_url
        }

        async fn shutdown(self: Box<Self>) -> Result<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl Deployer for FakeDeployer {
        async fn deploy(&self, spec: &DeploymentSpec) -> Result<Box<dyn Deployment>> {
            self.seen.lock().unwrap().push(*spec);
            if self.launch_error {
                return Err(Error::launch("server binary missing"));
            }
            if self.failing.contains(&spec.instances) {
                return Err(Error::ReadinessTimeout {
                    target: "fake".to_string(),
                    phase: bench_core::ReadinessPhase::Liveness,
                    timeout: Duration::from_secs(1),
                    last_error: "connection refused".to_string(),
                });
            }
            self.deploys.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeDeployment {
                base_url: self.servers[&spec.instances].clone(),
                shutdowns: self.shutdowns.clone(),
            }))
        }
    }

    fn config(instances: Vec<usize>, concurrency: Vec<usize>) -> SweepConfig {
        let mut config = SweepConfig::default();
        config.axes = SweepAxes {
            instances,
            parallel: vec![1],
            batch: vec![None],
            ubatch: vec![None],
            max_tokens: vec![8],
            concurrency,
            ctx_threshold: 2048,
        };
        config.load.warmup_requests = 1;
        config
    }

    fn generator() -> LoadGenerator {
        LoadGenerator::new(
            Duration::from_secs(5),
            RetryPolicy::new(3, Duration::from_millis(10)),
        )
        .unwrap()
    }

    async fn run(
        deployer: FakeDeployer,
        config: &SweepConfig,
    ) -> (Result<SweepOutcome>, MemorySink, FakeDeployer) {
        let plan = SweepPlan::build(&config.axes, &config.load);
        let driver = SweepDriver::new(deployer, generator(), config);
        let mut sink = MemorySink::default();
        let outcome = driver.run(&plan, &mut sink).await;
        (outcome, sink, driver.deployer)
    }

    #[tokio::test]
    async fn test_sweep_records_every_cell_and_best() {
        setup_test_logging();
        let one = MockServer::start(
            MockBehavior::default()
                .with_tokens(10)
                .with_latency(Duration::from_millis(20)),
        )
        .await
        .unwrap();
        let two = MockServer::start(
            MockBehavior::default()
                .with_tokens(20)
                .with_latency(Duration::from_millis(20)),
        )
        .await
        .unwrap();

        let deployer = FakeDeployer {
            servers: HashMap::from([(1, one.base_url()), (2, two.base_url())]),
            ..Default::default()
        };
        let config = config(vec![1, 2], vec![1, 2]);
        let (outcome, sink, deployer) = run(deployer, &config).await;
        let outcome = outcome.unwrap();

        assert_eq!(outcome.rows.len(), 4);
        assert_eq!(sink.rows, outcome.rows);
        assert!(outcome.rows.iter().all(|row| row.throughput() > 0.0));
        assert!(outcome.rows.iter().all(|row| row.result.error_count == 0));

        let max = outcome
            .rows
            .iter()
            .max_by(|a, b| a.throughput().total_cmp(&b.throughput()))
            .unwrap();
        let best = outcome.best.unwrap();
        assert_eq!(best.cell, max.cell);
        assert_eq!(best.throughput, max.throughput());

        assert_eq!(outcome.deployments, 2);
        assert_eq!(deployer.shutdowns.load(Ordering::SeqCst), 2);
        // one warmup after deploy, then total_requests (1 + 2)
        assert_eq!(one.completion_calls(), 1 + 1 + 2);
    }

    #[tokio::test]
    async fn test_failed_tier_records_zero_rows_and_continues() {
        setup_test_logging();
        let server = MockServer::start(MockBehavior::default()).await.unwrap();
        let deployer = FakeDeployer {
            servers: HashMap::from([(2, server.base_url())]),
            failing: vec![1],
            ..Default::default()
        };
        let config = config(vec![1, 2], vec![1, 4]);
        let (outcome, _, _) = run(deployer, &config).await;
        let outcome = outcome.unwrap();

        assert_eq!(outcome.rows.len(), 4);
        assert_eq!(outcome.failed_tiers, 1);
        let zero: Vec<&ResultRow> = outcome
            .rows
            .iter()
            .filter(|row| row.cell.instances == 1)
            .collect();
        assert_eq!(zero.len(), 2);
        for row in zero {
            assert_eq!(row.throughput(), 0.0);
            assert_eq!(row.result.error_count, row.cell.total_requests);
            assert!(row.result.last_error.as_deref().unwrap().contains("liveness"));
        }
        assert_eq!(outcome.best.unwrap().cell.instances, 2);
    }

    #[tokio::test]
    async fn test_failed_tier_aborts_without_continue_on_error() {
        let server = MockServer::start(MockBehavior::default()).await.unwrap();
        let deployer = FakeDeployer {
            servers: HashMap::from([(2, server.base_url())]),
            failing: vec![1],
            ..Default::default()
        };
        let mut config = config(vec![1, 2], vec![1]);
        config.continue_on_error = false;

        let (outcome, sink, deployer) = run(deployer, &config).await;
        assert!(matches!(outcome.unwrap_err(), Error::ReadinessTimeout { .. }));
        assert!(sink.rows.is_empty());
        assert_eq!(deployer.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_launch_error_aborts_even_when_continuing() {
        let deployer = FakeDeployer {
            launch_error: true,
            ..Default::default()
        };
        let config = config(vec![1, 2], vec![1]);

        let (outcome, sink, _) = run(deployer, &config).await;
        assert!(matches!(outcome.unwrap_err(), Error::Launch(_)));
        assert!(sink.rows.is_empty());
    }

    #[tokio::test]
    async fn test_equal_fingerprints_deploy_once() {
        let server = MockServer::start(MockBehavior::default()).await.unwrap();
        let deployer = FakeDeployer {
            servers: HashMap::from([(1, server.base_url())]),
            ..Default::default()
        };
        let mut config = config(vec![1], vec![1, 2]);
        // Two values in the low bucket share one tier
        config.axes.max_tokens = vec![8, 16];

        let (outcome, _, deployer) = run(deployer, &config).await;
        let outcome = outcome.unwrap();
        assert_eq!(outcome.rows.len(), 4);
        assert_eq!(deployer.deploys.load(Ordering::SeqCst), 1);
        assert_eq!(deployer.shutdowns.load(Ordering::SeqCst), 1);
        // A reused deployment is not warmed up again
        assert_eq!(server.completion_calls(), 1 + (1 + 2) + (1 + 2));
    }

    #[tokio::test]
    async fn test_warmup_failure_zeroes_whole_tier() {
        let server = MockServer::start(MockBehavior::default().with_permanent_status(400))
            .await
            .unwrap();
        let deployer = FakeDeployer {
            servers: HashMap::from([(1, server.base_url())]),
            ..Default::default()
        };
        let config = config(vec![1], vec![1, 2]);

        let (outcome, _, deployer) = run(deployer, &config).await;
        let outcome = outcome.unwrap();
        assert_eq!(outcome.rows.len(), 2);
        assert_eq!(outcome.failed_tiers, 1);
        assert!(outcome.rows.iter().all(|row| row.throughput() == 0.0));
        assert_eq!(server.completion_calls(), 1);
        assert_eq!(deployer.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_partial_request_errors_are_reported_with_cell() {
        setup_test_logging();
        let server = MockServer::start(MockBehavior::default()).await.unwrap();
        // Exhausts the 3 attempts of the only request in the cell
        server.push_failures(&[503, 503, 503]);
        let deployer = FakeDeployer {
            servers: HashMap::from([(1, server.base_url())]),
            ..Default::default()
        };
        let mut config = config(vec![1], vec![1, 2]);
        config.load.warmup_requests = 0;

        let plan = SweepPlan::build(&config.axes, &config.load);
        let (reporter, mut progress) = ChannelReporter::new();
        let driver =
            SweepDriver::new(deployer, generator(), &config).with_reporter(Arc::new(reporter));
        let mut sink = MemorySink::default();
        let outcome = driver.run(&plan, &mut sink).await.unwrap();
        drop(driver);

        // The batch itself succeeded, so this is not a failed tier
        assert_eq!(outcome.failed_tiers, 0);
        assert_eq!(outcome.rows[0].result.error_count, 1);

        let first = progress.recv().await.unwrap();
        assert_eq!(first.last.concurrency, 1);
        assert_eq!(first.errors, 1);
        assert!(first.last_error.as_deref().unwrap().contains("503"));

        let second = progress.recv().await.unwrap();
        assert_eq!(second.errors, 0);
        assert!(second.last_error.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_active_deployment() {
        setup_test_logging();
        let server = MockServer::start(
            MockBehavior::default().with_latency(Duration::from_secs(5)),
        )
        .await
        .unwrap();
        let deployer = FakeDeployer {
            servers: HashMap::from([(1, server.base_url())]),
            ..Default::default()
        };
        let mut config = config(vec![1], vec![1]);
        config.load.warmup_requests = 0;

        let plan = SweepPlan::build(&config.axes, &config.load);
        let driver = SweepDriver::new(deployer, generator(), &config);
        let mut sink = MemorySink::default();

        let started = Instant::now();
        let err = driver
            .run_until(&plan, &mut sink, tokio::time::sleep(Duration::from_millis(200)))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Interrupted(_)));
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(sink.rows.is_empty());
        assert_eq!(driver.deployer().shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_high_bucket_redeploys_with_larger_context() {
        let server = MockServer::start(MockBehavior::default()).await.unwrap();
        let deployer = FakeDeployer {
            servers: HashMap::from([(1, server.base_url())]),
            ..Default::default()
        };
        let mut config = config(vec![1], vec![1]);
        config.axes.max_tokens = vec![8, 64];
        config.axes.ctx_threshold = 32;

        let (outcome, _, deployer) = run(deployer, &config).await;
        assert_eq!(outcome.unwrap().rows.len(), 2);
        let seen = deployer.seen.lock().unwrap();
        let contexts: Vec<u32> = seen.iter().map(|spec| spec.ctx_per_session).collect();
        assert_eq!(contexts, vec![32, 64]);
    }

    #[tokio::test]
    async fn test_fatal_request_zeroes_rest_of_tier() {
        setup_test_logging();
        // The first cell's single request succeeds, everything after is a 400
        let server = MockServer::start(MockBehavior::default().with_status_after(1, 400))
            .await
            .unwrap();
        let deployer = FakeDeployer {
            servers: HashMap::from([(1, server.base_url())]),
            ..Default::default()
        };
        let mut config = config(vec![1], vec![1, 2, 4]);
        config.load.warmup_requests = 0;

        let plan = SweepPlan::build(&config.axes, &config.load);
        let (reporter, mut progress) = ChannelReporter::new();
        let driver =
            SweepDriver::new(deployer, generator(), &config).with_reporter(Arc::new(reporter));
        let mut sink = MemorySink::default();
        let outcome = driver.run(&plan, &mut sink).await.unwrap();

        assert_eq!(outcome.rows.len(), 3);
        assert_eq!(outcome.failed_tiers, 1);
        assert!(outcome.rows[0].throughput() > 0.0);
        assert_eq!(outcome.rows[1].throughput(), 0.0);
        assert_eq!(outcome.rows[2].result.error_count, 4);
        assert!(outcome.rows[2]
            .result
            .last_error
            .as_deref()
            .unwrap()
            .contains("400"));
        assert_eq!(driver.deployer().shutdowns.load(Ordering::SeqCst), 1);

        drop(driver);
        let mut completed = Vec::new();
        while let Some(p) = progress.recv().await {
            completed.push(p.completed);
        }
        assert_eq!(completed, vec![1, 2, 3]);
    }
}
