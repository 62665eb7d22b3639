//! Progress reporting after every recorded row

use bench_core::SweepCell;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// Snapshot taken right after a row was recorded
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
    pub elapsed: Duration,
    pub last: SweepCell,

    /// Failed requests of the last cell
    pub errors: usize,

    /// Most recent failure of the last cell
    pub last_error: Option<String>,
}

impl Progress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            self.completed as f64 * 100.0 / self.total as f64
        }
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "progress {}/{} ({:.1}%) elapsed={:.1}s last={}",
            self.completed,
            self.total,
            self.percent(),
            self.elapsed.as_secs_f64(),
            self.last
        )
    }
}

/// Receives progress from the sweep driver
pub trait ProgressReporter: Send + Sync {
    fn report(&self, progress: &Progress);
}

/// Logs every progress line at info level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ProgressReporter for LogReporter {
    fn report(&self, progress: &Progress) {
        info!("{}", progress);
    }
}

/// Forwards progress over a channel
#[derive(Debug, Clone)]
pub struct ChannelReporter {
    tx: mpsc::UnboundedSender<Progress>,
}

impl ChannelReporter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Progress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressReporter for ChannelReporter {
    fn report(&self, progress: &Progress) {
        // A dropped receiver only means nobody is watching
        let _ = self.tx.send(progress.clone());
    }
}
