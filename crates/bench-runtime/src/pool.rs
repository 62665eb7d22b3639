//! Server pool management
//!
//! A pool is N server processes launched from one template, instance `i`
//! bound to `base_port + i`. Startup is all-or-nothing: when any member
//! fails, every member already started is stopped before the error is
//! returned.

use crate::ports::{find_free_port_range, port_range};
use crate::process::{ManagedProcess, ProcessSpec, ProcessState};
use crate::readiness::ReadinessProber;
use bench_core::{Error, Result, Upstream};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

/// Launch arguments shared by every member of a pool
#[derive(Debug, Clone)]
pub struct ServerTemplate {
    pub binary: PathBuf,
    pub model: Option<PathBuf>,
    pub host: String,

    /// Arguments appended after the pool-owned flags
    pub extra_args: Vec<String>,

    /// Parallel decoding slots per instance
    pub parallel: u32,

    /// Context tokens available to each slot
    pub ctx_per_session: u32,

    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub shutdown_grace: Duration,
}

impl ServerTemplate {
    pub fn new(binary: impl Into<PathBuf>, host: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            model: None,
            host: host.into(),
            extra_args: Vec::new(),
            parallel: 1,
            ctx_per_session: 2048,
            working_dir: None,
            env: HashMap::new(),
            shutdown_grace: Duration::from_secs(10),
        }
    }

    /// Total context window: every slot gets `ctx_per_session` tokens
    pub fn ctx_size(&self) -> u32 {
        self.ctx_per_session.saturating_mul(self.parallel.max(1))
    }

    /// `--host H --port P [--model M] --ctx-size C --parallel N <extra>`
    pub fn launch_args(&self, port: u16) -> Vec<String> {
        let mut args = vec![
            "--host".to_string(),
            self.host.clone(),
            "--port".to_string(),
            port.to_string(),
        ];
        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.display().to_string());
        }
        args.extend([
            "--ctx-size".to_string(),
            self.ctx_size().to_string(),
            "--parallel".to_string(),
            self.parallel.max(1).to_string(),
        ]);
        args.extend(self.extra_args.iter().cloned());
        args
    }

    pub fn process_spec(&self, port: u16) -> ProcessSpec {
        ProcessSpec::new(&self.binary)
            .args(self.launch_args(port))
            .working_dir(self.working_dir.clone())
            .envs(self.env.clone())
            .shutdown_grace(self.shutdown_grace)
            .label(format!("server {}:{}", self.host, port))
    }
}

/// One running, ready server instance
#[derive(Debug)]
pub struct ServerHandle {
    pub host: String,
    pub port: u16,
    pub base_url: String,
    process: ManagedProcess,
}

impl ServerHandle {
    /// Launch one instance and wait until it can serve completions.
    ///
    /// The process is stopped again if readiness fails.
    pub async fn launch(
        template: &ServerTemplate,
        port: u16,
        prober: &ReadinessProber,
    ) -> Result<Self> {
        let mut process = ManagedProcess::spawn(template.process_spec(port))?;
        let upstream = Upstream::new(template.host.clone(), port);
        let base_url = upstream.base_url();
        let target = upstream.to_string();

        if let Err(e) = prober.wait_ready(&base_url, &target, Some(&mut process)).await {
            warn!(%target, error = %e, "Server failed readiness, stopping it");
            if let Err(stop_err) = process.stop().await {
                error!(%target, "Failed to stop server: {}", stop_err);
            }
            return Err(e);
        }
        process.mark_ready()?;

        Ok(Self {
            host: template.host.clone(),
            port,
            base_url,
            process,
        })
    }

    pub fn upstream(&self) -> Upstream {
        Upstream::new(self.host.clone(), self.port)
    }

    pub fn state(&self) -> ProcessState {
        self.process.state()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.process.stop().await
    }
}

/// A set of ready servers torn down as a unit
#[derive(Debug)]
pub struct ServerPool {
    servers: Vec<ServerHandle>,
}

impl ServerPool {
    /// Start `count` instances sequentially on consecutive ports.
    ///
    /// Without `base_port` a free range is picked. `startup_delay` pauses
    /// between launches for backends that load models one at a time.
    pub async fn start(
        template: &ServerTemplate,
        count: usize,
        base_port: Option<u16>,
        prober: &ReadinessProber,
        startup_delay: Duration,
    ) -> Result<Self> {
        if count == 0 {
            return Err(Error::config("pool needs at least one instance"));
        }

        let base_port = match base_port {
            Some(port) => port,
            None => find_free_port_range(&template.host, count)?,
        };
        let ports = port_range(base_port, count)?;

        info!(
            count,
            base_port,
            parallel = template.parallel,
            ctx_size = template.ctx_size(),
            "Starting server pool"
        );

        let mut servers: Vec<ServerHandle> = Vec::with_capacity(count);
        for (index, port) in ports.into_iter().enumerate() {
            match ServerHandle::launch(template, port, prober).await {
                Ok(handle) => servers.push(handle),
                Err(e) => {
                    error!(index, port, error = %e, "Pool member failed, tearing down pool");
                    stop_all(&mut servers).await;
                    return Err(e);
                }
            }

            if !startup_delay.is_zero() && index + 1 < count {
                tokio::time::sleep(startup_delay).await;
            }
        }

        info!(count, "Server pool ready");
        Ok(Self { servers })
    }

    pub fn servers(&self) -> &[ServerHandle] {
        &self.servers
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn upstreams(&self) -> Vec<Upstream> {
        self.servers.iter().map(ServerHandle::upstream).collect()
    }

    /// Stop every member, last started first
    pub async fn shutdown(mut self) -> Result<()> {
        info!(count = self.servers.len(), "Stopping server pool");
        stop_all(&mut self.servers).await;
        Ok(())
    }
}

async fn stop_all(servers: &mut Vec<ServerHandle>) {
    while let Some(mut server) = servers.pop() {
        if let Err(e) = server.stop().await {
            error!(port = server.port, "Failed to stop server: {}", e);
        }
    }
}

/// Start a pool of `count` servers; see [`ServerPool::start`]
pub async fn start_pool(
    template: &ServerTemplate,
    count: usize,
    base_port: Option<u16>,
    prober: &ReadinessProber,
    startup_delay: Duration,
) -> Result<ServerPool> {
    ServerPool::start(template, count, base_port, prober, startup_delay).await
}
