//! Real deployments: a server pool, fronted by a proxy when enabled

use crate::driver::{Deployer, Deployment};
use crate::plan::DeploymentSpec;
use async_trait::async_trait;
use bench_core::{ProxyConfig, Result, ServerLaunchConfig, SweepConfig};
use bench_runtime::{
    build_server_args, ensure_model, resolve_server_binary, start_pool, ProxyHandle,
    ProxyLauncher, ReadinessProber, ServerPool, ServerTemplate,
};
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// Deploys llama.cpp server pools as local processes
#[derive(Debug)]
pub struct ProcessDeployer {
    server_binary: PathBuf,
    model: Option<PathBuf>,
    server: ServerLaunchConfig,
    proxy: ProxyConfig,
    proxy_launcher: Option<ProxyLauncher>,
    prober: ReadinessProber,
}

impl ProcessDeployer {
    /// Resolve the server binary, model and (when enabled) the proxy
    /// binary up front, so a missing input aborts before any tier runs
    pub fn new(config: &SweepConfig, search_root: &Path) -> Result<Self> {
        let server_binary = resolve_server_binary(
            config.server.binary.as_deref(),
            config.server.llama_cpp_dir.as_deref(),
            search_root,
        )?;
        let model = ensure_model(config.server.model_path.as_deref())?;

        let proxy_launcher = if config.proxy.enabled {
            Some(ProxyLauncher::new(&config.proxy)?)
        } else {
            None
        };

        info!(
            binary = %server_binary.display(),
            model = ?model,
            proxy = config.proxy.enabled,
            "Process deployer ready"
        );

        Ok(Self {
            server_binary,
            model,
            server: config.server.clone(),
            proxy: config.proxy.clone(),
            proxy_launcher,
            prober: ReadinessProber::new(config.readiness.clone())?,
        })
    }

    pub fn server_binary(&self) -> &Path {
        &self.server_binary
    }

    /// Launch template for every member of the pool serving `spec`
    pub fn template(&self, spec: &DeploymentSpec) -> ServerTemplate {
        let mut template = ServerTemplate::new(&self.server_binary, self.server.host.clone());
        template.model = self.model.clone();
        template.extra_args = build_server_args(&self.server.extra_args, spec.batch, spec.ubatch);
        template.parallel = spec.parallel;
        template.ctx_per_session = spec.ctx_per_session;
        template.working_dir = self.server.working_dir.clone();
        template.env = self.server.env.clone();
        template.shutdown_grace = self.server.shutdown_grace();
        template
    }

    fn proxy_host(&self) -> String {
        self.proxy
            .listen_host
            .clone()
            .unwrap_or_else(|| self.server.host.clone())
    }
}

#[async_trait]
impl Deployer for ProcessDeployer {
    async fn deploy(&self, spec: &DeploymentSpec) -> Result<Box<dyn Deployment>> {
        let template = self.template(spec);
        let pool = start_pool(
            &template,
            spec.instances,
            self.server.base_port,
            &self.prober,
            self.server.startup_delay(),
        )
        .await?;

        let Some(launcher) = &self.proxy_launcher else {
            let base_url = pool
                .servers()
                .first()
                .map(|server| server.base_url.clone())
                .unwrap_or_default();
            return Ok(Box::new(ProcessDeployment {
                base_url,
                pool,
                proxy: None,
            }));
        };

        let host = self.proxy_host();
        match launcher
            .start(&pool.upstreams(), &host, self.proxy.listen_port)
            .await
        {
            Ok(proxy) => Ok(Box::new(ProcessDeployment {
                base_url: proxy.base_url.clone(),
                pool,
                proxy: Some(proxy),
            })),
            Err(e) => {
                error!(deployment = %spec, "Proxy failed to start, stopping pool: {}", e);
                if let Err(stop_err) = pool.shutdown().await {
                    error!("Failed to stop pool: {}", stop_err);
                }
                Err(e)
            }
        }
    }
}

/// A running pool and its optional proxy
#[derive(Debug)]
pub struct ProcessDeployment {
    base_url: String,
    pool: ServerPool,
    proxy: Option<ProxyHandle>,
}

#[async_trait]
impl Deployment for ProcessDeployment {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Proxy first, so nothing is routed to servers that are going away
    async fn shutdown(self: Box<Self>) -> Result<()> {
        let ProcessDeployment { pool, proxy, .. } = *self;
        let proxy_result = match proxy {
            Some(proxy) => proxy.shutdown().await,
            None => Ok(()),
        };
        let pool_result = pool.shutdown().await;
        proxy_result.and(pool_result)
    }
}
