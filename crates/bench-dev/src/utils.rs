//! Utility functions for process-level tests

use bench_core::Result;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Setup test logging with appropriate levels
pub fn setup_test_logging() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "bench_dev=debug,bench_core=debug,bench_runtime=debug,bench_load=debug,bench_sweep=debug"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// Write an executable `sh` script into `dir`
pub fn write_script(dir: &Path, name: &str, body: &str) -> Result<PathBuf> {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body))?;

    let mut permissions = std::fs::metadata(&path)?.permissions();
    permissions.set_mode(0o755);
    std::fs::set_permissions(&path, permissions)?;
    Ok(path)
}

/// Script that records its PID in `pid_file` and then sleeps, standing in
/// for a server that never becomes ready
pub fn write_sleeper_script(dir: &Path, pid_file: &Path) -> Result<PathBuf> {
    write_script(
        dir,
        "sleeper.sh",
        &format!("echo $$ >> '{}'\nexec sleep 30", pid_file.display()),
    )
}

/// PIDs recorded one per line in `path`; a missing file yields none
pub fn read_pids(path: &Path) -> Vec<i32> {
    std::fs::read_to_string(path)
        .map(|contents| {
            contents
                .lines()
                .filter_map(|line| line.trim().parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Whether a process with this PID still exists
pub fn pid_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Wait until none of `pids` is alive, returning the survivors on timeout
pub async fn wait_for_exit(pids: &[i32], timeout: Duration) -> Vec<i32> {
    let deadline = Instant::now() + timeout;
    loop {
        let alive: Vec<i32> = pids.iter().copied().filter(|&pid| pid_alive(pid)).collect();
        if alive.is_empty() || Instant::now() >= deadline {
            return alive;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_script_is_executable() {
        let dir = TempDir::new().unwrap();
        let path = write_script(dir.path(), "hello.sh", "echo hello").unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
        assert!(std::fs::read_to_string(&path).unwrap().starts_with("#!/bin/sh"));
    }

    #[test]
    fn test_read_pids() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pids");
        assert!(read_pids(&path).is_empty());

        std::fs::write(&path, "12\n\n34\nnot-a-pid\n").unwrap();
        assert_eq!(read_pids(&path), vec![12, 34]);
    }

    #[test]
    fn test_own_pid_is_alive() {
        assert!(pid_alive(std::process::id() as i32));
    }
}
