//! Supervision of one external process
//!
//! A [`ManagedProcess`] owns its child for its whole life. `stop` sends
//! SIGTERM, waits out a grace period and then kills; dropping a handle that
//! was never stopped kills the child so no exit path leaks a process.

use crate::resolve::find_executable;
use bench_core::{Error, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What to launch and how to stop it
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,

    /// Time between SIGTERM and SIGKILL
    pub shutdown_grace: Duration,

    /// Name used in logs and errors
    pub label: String,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        let label = program
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.display().to_string());

        Self {
            program,
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            shutdown_grace: Duration::from_secs(10),
            label,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    pub fn envs(mut self, env: HashMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Shell-style rendering for logs
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Lifecycle of a supervised process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Spawned, readiness not yet confirmed
    Starting,
    /// Readiness confirmed
    Ready,
    /// Stopped; no further operations are valid
    Terminated,
}

/// Handle owning one running child process
#[derive(Debug)]
pub struct ManagedProcess {
    spec: ProcessSpec,
    child: Option<Child>,
    state: ProcessState,
    started_at: Instant,
}

impl ManagedProcess {
    /// Launch the process described by `spec`.
    ///
    /// Fails with [`Error::Launch`] when the program is missing or not
    /// executable.
    pub fn spawn(spec: ProcessSpec) -> Result<Self> {
        let program = find_executable(&spec.program).ok_or_else(|| {
            Error::launch(format!(
                "{} is missing or not executable",
                spec.program.display()
            ))
        })?;

        info!(label = %spec.label, "Starting process: {}", spec.command_line());

        let mut command = Command::new(&program);
        command.args(&spec.args);

        for (key, value) in &spec.env {
            command.env(key, value);
        }

        if let Some(working_dir) = &spec.working_dir {
            command.current_dir(working_dir);
        }

        command
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .stdin(Stdio::null());

        let child = command.spawn().map_err(|e| {
            Error::launch(format!("failed to spawn {}: {}", spec.program.display(), e))
        })?;

        debug!(label = %spec.label, pid = child.id(), "Process spawned");

        Ok(Self {
            spec,
            child: Some(child),
            state: ProcessState::Starting,
            started_at: Instant::now(),
        })
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    pub fn label(&self) -> &str {
        &self.spec.label
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// OS process id while the child is held
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Record that readiness probing succeeded
    pub fn mark_ready(&mut self) -> Result<()> {
        match self.state {
            ProcessState::Terminated => Err(Error::ProcessTerminated(self.spec.label.clone())),
            _ => {
                self.state = ProcessState::Ready;
                Ok(())
            }
        }
    }

    /// Exit status if the child has already exited on its own
    pub fn try_exit_status(&mut self) -> Result<Option<ExitStatus>> {
        if self.state == ProcessState::Terminated {
            return Err(Error::ProcessTerminated(self.spec.label.clone()));
        }
        match self.child.as_mut() {
            Some(child) => Ok(child.try_wait()?),
            None => Err(Error::ProcessTerminated(self.spec.label.clone())),
        }
    }

    /// Fail with [`Error::ProcessExited`] if the child is gone
    pub fn ensure_running(&mut self) -> Result<()> {
        match self.try_exit_status()? {
            Some(status) => Err(Error::ProcessExited {
                target: self.spec.label.clone(),
                status: status.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Stop the process: SIGTERM, wait up to the grace period, then kill.
    ///
    /// Idempotent; the handle is terminated afterwards.
    pub async fn stop(&mut self) -> Result<()> {
        self.state = ProcessState::Terminated;
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!(label = %self.spec.label, %status, "Process already exited");
            return Ok(());
        }

        info!(label = %self.spec.label, pid = child.id(), "Stopping process");

        let pid = Pid::from_raw(child.id() as i32);
        if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
            warn!(label = %self.spec.label, "Failed to send SIGTERM: {}", e);
        }

        let shutdown_result = timeout(self.spec.shutdown_grace, async {
            loop {
                match child.try_wait() {
                    Ok(Some(status)) => return Ok(status),
                    Ok(None) => tokio::time::sleep(EXIT_POLL_INTERVAL).await,
                    Err(e) => return Err(e),
                }
            }
        })
        .await;

        match shutdown_result {
            Ok(Ok(status)) => {
                debug!(label = %self.spec.label, %status, "Process stopped gracefully");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(label = %self.spec.label, "Error during graceful shutdown: {}", e);
                force_kill(&mut child, &self.spec.label)
            }
            Err(_) => {
                warn!(
                    label = %self.spec.label,
                    grace = ?self.spec.shutdown_grace,
                    "Graceful shutdown timed out, forcing kill"
                );
                force_kill(&mut child, &self.spec.label)
            }
        }
    }
}

fn force_kill(child: &mut Child, label: &str) -> Result<()> {
    if let Err(e) = child.kill() {
        error!(label, "Failed to kill process: {}", e);
    }
    child.wait()?;
    Ok(())
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if matches!(child.try_wait(), Ok(Some(_))) {
                return;
            }
            warn!(
                label = %self.spec.label,
                "Process handle dropped while running, killing"
            );
            if let Err(e) = child.kill() {
                error!(label = %self.spec.label, "Failed to kill process during cleanup: {}", e);
            }
            let _ = child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bench_dev::{pid_alive, setup_test_logging, wait_for_exit, write_script};
    use tempfile::TempDir;

    fn sleeper() -> ProcessSpec {
        ProcessSpec::new("sleep")
            .args(["30"])
            .shutdown_grace(Duration::from_secs(2))
    }

    #[test]
    fn test_missing_binary_is_launch_error() {
        let err = ManagedProcess::spawn(ProcessSpec::new("/nonexistent/llama-server")).unwrap_err();
        assert!(matches!(err, Error::Launch(_)));
    }

    #[test]
    fn test_non_executable_is_launch_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("server");
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();

        let err = ManagedProcess::spawn(ProcessSpec::new(&path)).unwrap_err();
        assert!(matches!(err, Error::Launch(_)));
    }

    #[tokio::test]
    async fn test_stop_terminates_process() {
        setup_test_logging();
        let mut process = ManagedProcess::spawn(sleeper()).unwrap();
        let pid = process.pid().unwrap() as i32;
        assert_eq!(process.state(), ProcessState::Starting);
        assert!(pid_alive(pid));

        process.mark_ready().unwrap();
        assert_eq!(process.state(), ProcessState::Ready);

        process.stop().await.unwrap();
        assert_eq!(process.state(), ProcessState::Terminated);
        assert!(wait_for_exit(&[pid], Duration::from_secs(2)).await.is_empty());

        // Second stop is a no-op, other operations are rejected
        process.stop().await.unwrap();
        assert!(matches!(process.mark_ready(), Err(Error::ProcessTerminated(_))));
        assert!(process.try_exit_status().is_err());
    }

    #[tokio::test]
    async fn test_sigterm_ignored_falls_back_to_kill() {
        setup_test_logging();
        let dir = TempDir::new().unwrap();
        let script = write_script(
            dir.path(),
            "stubborn.sh",
            "trap '' TERM\nwhile true; do sleep 1; done",
        )
        .unwrap();

        let mut process = ManagedProcess::spawn(
            ProcessSpec::new(&script).shutdown_grace(Duration::from_millis(300)),
        )
        .unwrap();
        let pid = process.pid().unwrap() as i32;
        // Give the shell time to install the trap
        tokio::time::sleep(Duration::from_millis(200)).await;

        let started = Instant::now();
        process.stop().await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(!pid_alive(pid));
    }

    #[tokio::test]
    async fn test_drop_kills_process() {
        let process = ManagedProcess::spawn(sleeper()).unwrap();
        let pid = process.pid().unwrap() as i32;

        drop(process);
        assert!(wait_for_exit(&[pid], Duration::from_secs(2)).await.is_empty());
    }

    #[tokio::test]
    async fn test_ensure_running_detects_exit() {
        let mut process = ManagedProcess::spawn(ProcessSpec::new("true")).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let err = process.ensure_running().unwrap_err();
        assert!(matches!(err, Error::ProcessExited { .. }));
        process.stop().await.unwrap();
    }

    #[test]
    fn test_command_line() {
        let spec = ProcessSpec::new("/opt/llama/llama-server").args(["--port", "9000"]);
        assert_eq!(spec.label, "llama-server");
        assert_eq!(spec.command_line(), "/opt/llama/llama-server --port 9000");
    }
}
