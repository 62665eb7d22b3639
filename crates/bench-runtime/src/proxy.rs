//! Round-robin reverse proxy in front of a server pool
//!
//! Generates a minimal nginx configuration in a private temporary
//! directory, runs nginx in the foreground against it and waits for the
//! listener to accept TCP connections. The process and the directory are
//! released together.

use crate::process::{ManagedProcess, ProcessSpec};
use crate::resolve::resolve_proxy_binary;
use bench_core::{Error, ProxyConfig, ReadinessPhase, Result, Upstream};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tracing::{debug, error, info};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const LISTEN_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Name of the generated configuration file
pub const CONFIG_FILE_NAME: &str = "nginx.conf";

/// Render an nginx configuration balancing `upstreams` round-robin.
///
/// Runtime files (pid, logs) live under `runtime_dir`. Upstream
/// connections drop the client's `Connection` header so every client
/// connection is rotated independently.
pub fn render_nginx_config(
    upstreams: &[Upstream],
    listen_host: &str,
    listen_port: u16,
    runtime_dir: &Path,
    worker_connections: u32,
) -> String {
    let dir = runtime_dir.display();
    let mut servers = String::new();
    for upstream in upstreams {
        let _ = writeln!(servers, "        server {};", upstream);
    }

    format!(
        "worker_processes 1;\n\
         pid {dir}/nginx.pid;\n\
         error_log {dir}/error.log;\n\
         events {{ worker_connections {worker_connections}; }}\n\
         http {{\n\
         \x20   access_log {dir}/access.log;\n\
         \x20   upstream llama_backend {{\n\
         {servers}\
         \x20   }}\n\
         \x20   server {{\n\
         \x20       listen {listen_host}:{listen_port};\n\
         \x20       location / {{\n\
         \x20           proxy_pass http://llama_backend;\n\
         \x20           proxy_http_version 1.1;\n\
         \x20           proxy_set_header Connection \"\";\n\
         \x20       }}\n\
         \x20   }}\n\
         }}\n"
    )
}

/// A running proxy and its generated configuration
#[derive(Debug)]
pub struct ProxyHandle {
    pub listen_host: String,
    pub listen_port: u16,
    pub base_url: String,
    // Declared before `config_dir` so that on drop the process dies
    // before its configuration directory is removed
    process: ManagedProcess,
    config_path: PathBuf,
    config_dir: TempDir,
}

impl ProxyHandle {
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn config_dir(&self) -> &Path {
        self.config_dir.path()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Stop the proxy, then delete its configuration directory
    pub async fn shutdown(mut self) -> Result<()> {
        info!(port = self.listen_port, "Stopping proxy");
        let stopped = self.process.stop().await;

        let dir = self.config_dir.path().to_path_buf();
        if let Err(e) = self.config_dir.close() {
            error!(dir = %dir.display(), "Failed to remove proxy config dir: {}", e);
            stopped?;
            return Err(e.into());
        }
        stopped
    }
}

/// Starts proxies with one resolved binary and fixed timeouts
#[derive(Debug, Clone)]
pub struct ProxyLauncher {
    binary: PathBuf,
    ready_timeout: Duration,
    shutdown_grace: Duration,
    worker_connections: u32,
}

impl ProxyLauncher {
    /// Resolve the proxy binary; fails with [`Error::BinaryNotFound`]
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        Ok(Self {
            binary: resolve_proxy_binary(config.binary.as_deref())?,
            ready_timeout: config.ready_timeout(),
            shutdown_grace: config.shutdown_grace(),
            worker_connections: config.worker_connections,
        })
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Write the configuration, spawn the proxy and wait for its listener
    pub async fn start(
        &self,
        upstreams: &[Upstream],
        listen_host: &str,
        listen_port: u16,
    ) -> Result<ProxyHandle> {
        if upstreams.is_empty() {
            return Err(Error::config("proxy needs at least one upstream"));
        }

        let config_dir = tempfile::Builder::new().prefix("llama-proxy-").tempdir()?;
        let config_path = config_dir.path().join(CONFIG_FILE_NAME);
        let rendered = render_nginx_config(
            upstreams,
            listen_host,
            listen_port,
            config_dir.path(),
            self.worker_connections,
        );
        std::fs::write(&config_path, rendered)?;
        debug!(path = %config_path.display(), "Wrote proxy configuration");

        let spec = ProcessSpec::new(&self.binary)
            .args([
                "-c".to_string(),
                config_path.display().to_string(),
                "-p".to_string(),
                config_dir.path().display().to_string(),
                "-g".to_string(),
                "daemon off;".to_string(),
            ])
            .shutdown_grace(self.shutdown_grace)
            .label(format!("proxy {}:{}", listen_host, listen_port));
        let mut process = ManagedProcess::spawn(spec)?;

        if let Err(e) =
            wait_for_listen(listen_host, listen_port, self.ready_timeout, Some(&mut process)).await
        {
            if let Err(stop_err) = process.stop().await {
                error!("Failed to stop proxy: {}", stop_err);
            }
            return Err(e);
        }
        process.mark_ready()?;

        info!(
            listen = %format!("{}:{}", listen_host, listen_port),
            upstreams = upstreams.len(),
            "Proxy ready"
        );

        Ok(ProxyHandle {
            listen_host: listen_host.to_string(),
            listen_port,
            base_url: format!("http://{}:{}", listen_host, listen_port),
            process,
            config_path,
            config_dir,
        })
    }
}

/// Start a round-robin proxy over `upstreams`; see [`ProxyLauncher::start`]
pub async fn start_proxy(
    upstreams: &[Upstream],
    listen_host: &str,
    listen_port: u16,
    config: &ProxyConfig,
) -> Result<ProxyHandle> {
    ProxyLauncher::new(config)?
        .start(upstreams, listen_host, listen_port)
        .await
}

/// Poll TCP connect until `host:port` accepts or `timeout` elapses
pub async fn wait_for_listen(
    host: &str,
    port: u16,
    timeout: Duration,
    mut process: Option<&mut ManagedProcess>,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut last_error = String::from("no connection attempt");

    loop {
        if let Some(process) = process.as_deref_mut() {
            process.ensure_running()?;
        }

        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => return Ok(()),
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => last_error = "connect timed out".to_string(),
        }

        if Instant::now() >= deadline {
            return Err(Error::ReadinessTimeout {
                target: format!("{}:{}", host, port),
                phase: ReadinessPhase::Listen,
                timeout,
                last_error,
            });
        }
        tokio::time::sleep(LISTEN_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::pick_free_port;
    use crate::resolve::find_executable;
    use bench_dev::{pid_alive, setup_test_logging, write_script, MockBehavior, MockServer};
    use std::net::TcpListener;

    fn fake_proxy_config(dir: &Path) -> ProxyConfig {
        let script = write_script(dir, "fake-nginx", "exec sleep 30").unwrap();
        ProxyConfig {
            binary: Some(script),
            ready_timeout_seconds: 2.0,
            shutdown_grace_seconds: 1.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_render_nginx_config() {
        let upstreams = vec![
            Upstream::new("127.0.0.1", 9000),
            Upstream::new("127.0.0.1", 9001),
        ];
        let conf = render_nginx_config(&upstreams, "127.0.0.1", 8088, Path::new("/tmp/x"), 1024);

        assert!(conf.starts_with("worker_processes 1;\n"));
        assert!(conf.contains("pid /tmp/x/nginx.pid;"));
        assert!(conf.contains("events { worker_connections 1024; }"));
        assert!(conf.contains("    upstream llama_backend {\n        server 127.0.0.1:9000;\n        server 127.0.0.1:9001;\n    }"));
        assert!(conf.contains("        listen 127.0.0.1:8088;"));
        assert!(conf.contains("proxy_pass http://llama_backend;"));
        assert!(conf.contains("proxy_set_header Connection \"\";"));
        assert!(!conf.contains("ip_hash"), "no sticky sessions");
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let config = ProxyConfig {
            binary: Some(PathBuf::from("/nonexistent/nginx")),
            ..Default::default()
        };
        let err = start_proxy(&[Upstream::new("127.0.0.1", 9000)], "127.0.0.1", 8088, &config)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BinaryNotFound(_)));
    }

    #[tokio::test]
    async fn test_proxy_lifecycle_with_fake_binary() {
        setup_test_logging();
        let scripts = tempfile::TempDir::new().unwrap();
        let config = fake_proxy_config(scripts.path());

        // The fake proxy never listens; the test holds the port open instead
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let proxy = start_proxy(&[Upstream::new("127.0.0.1", 9000)], "127.0.0.1", port, &config)
            .await
            .unwrap();
        assert_eq!(proxy.base_url, format!("http://127.0.0.1:{}", port));

        let conf = std::fs::read_to_string(proxy.config_path()).unwrap();
        assert!(conf.contains("server 127.0.0.1:9000;"));

        let dir = proxy.config_dir().to_path_buf();
        let pid = proxy.pid().unwrap() as i32;
        proxy.shutdown().await.unwrap();

        assert!(!dir.exists(), "config dir must be removed");
        assert!(!pid_alive(pid));
    }

    #[tokio::test]
    async fn test_listen_timeout_cleans_up() {
        let scripts = tempfile::TempDir::new().unwrap();
        let mut config = fake_proxy_config(scripts.path());
        config.ready_timeout_seconds = 0.3;
        let port = pick_free_port("127.0.0.1").unwrap();

        let err = start_proxy(&[Upstream::new("127.0.0.1", 9000)], "127.0.0.1", port, &config)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ReadinessTimeout {
                phase: ReadinessPhase::Listen,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_round_robin_with_nginx() {
        setup_test_logging();
        if find_executable(Path::new("nginx")).is_none() {
            tracing::warn!("nginx not installed, skipping");
            return;
        }

        let first = MockServer::start(MockBehavior::default()).await.unwrap();
        let second = MockServer::start(MockBehavior::default()).await.unwrap();
        let upstreams = vec![
            Upstream::new("127.0.0.1", first.port()),
            Upstream::new("127.0.0.1", second.port()),
        ];
        let port = pick_free_port("127.0.0.1").unwrap();

        let proxy = start_proxy(&upstreams, "127.0.0.1", port, &ProxyConfig::default())
            .await
            .unwrap();

        let client = reqwest::Client::new();
        for _ in 0..4 {
            let response = client
                .post(format!("{}/completion", proxy.base_url))
                .header("Connection", "close")
                .json(&serde_json::json!({ "prompt": "x", "n_predict": 1 }))
                .send()
                .await
                .unwrap();
            assert!(response.status().is_success());
        }

        assert_eq!(first.completion_calls(), 2);
        assert_eq!(second.completion_calls(), 2);
        proxy.shutdown().await.unwrap();
    }
}
