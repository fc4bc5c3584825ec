//! Per-feed results and the run summary built from them.

use crate::remote::RemoteError;
use crate::runtime::protocol::ScanError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug)]
pub enum RunResult {
    /// The frontier reached the target.
    Completed,
    /// The remote retains nothing older worth fetching; the feed was disabled.
    Exhausted,
    Aborted(AbortReason),
    NoOp(NoOpReason),
    /// The target was reached but an approximate date or search bound was used.
    Degraded,
}

impl RunResult {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Exhausted => "exhausted",
            Self::Aborted(_) => "aborted",
            Self::NoOp(_) => "no-op",
            Self::Degraded => "degraded",
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted(_))
    }

    /// Turns a clean completion into `Degraded` when `degraded` is set.
    pub fn degrade_if(self, degraded: bool) -> Self {
        match self {
            Self::Completed if degraded => Self::Degraded,
            other => other,
        }
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Aborted(reason) => write!(f, "aborted: {reason}"),
            Self::NoOp(reason) => write!(f, "no-op: {reason}"),
            other => f.write_str(other.label()),
        }
    }
}

#[derive(Debug, Error)]
pub enum AbortReason {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error("checkpoint at {sequence} was not written: {detail}")]
    Checkpoint { sequence: u64, detail: String },
    #[error("progress store failed: {0}")]
    Store(String),
    #[error("target of {days} day(s) is newer than the newest message; use at least {minimum_days} day(s)")]
    TargetUnreachable { days: u32, minimum_days: u32 },
    #[error("run cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoOpReason {
    AlreadyAtTarget,
    InvalidConfiguration(String),
}

impl fmt::Display for NoOpReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyAtTarget => f.write_str("frontier already at or past the target"),
            Self::InvalidConfiguration(detail) => write!(f, "invalid configuration: {detail}"),
        }
    }
}

#[derive(Debug)]
pub struct FeedReport {
    pub feed: String,
    pub result: RunResult,
    pub target: Option<u64>,
    pub windows: usize,
    pub messages: u64,
    pub last_checkpoint: Option<u64>,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub feeds: Vec<FeedReport>,
    pub elapsed: Duration,
    /// Set when the selection matched no feed.
    pub note: Option<String>,
}

impl RunSummary {
    pub fn get(&self, feed: &str) -> Option<&FeedReport> {
        self.feeds.iter().find(|report| report.feed == feed)
    }

    pub fn count(&self, predicate: impl Fn(&RunResult) -> bool) -> usize {
        self.feeds
            .iter()
            .filter(|report| predicate(&report.result))
            .count()
    }

    pub fn total_windows(&self) -> usize {
        self.feeds.iter().map(|report| report.windows).sum()
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(note) = &self.note {
            writeln!(f, "{note}")?;
        }
        for report in &self.feeds {
            write!(
                f,
                "{:<40} {:<10} windows={:<5} messages={:<10} elapsed={:.2}s",
                report.feed,
                report.result.label(),
                report.windows,
                report.messages,
                report.elapsed.as_secs_f64()
            )?;
            if let Some(sequence) = report.last_checkpoint {
                write!(f, " frontier={sequence}")?;
            }
            match &report.result {
                RunResult::Aborted(reason) => write!(f, " ({reason})")?,
                RunResult::NoOp(reason) => write!(f, " ({reason})")?,
                _ => {}
            }
            writeln!(f)?;
        }
        write!(
            f,
            "{} feed(s), {} window(s) in {:.2}s",
            self.feeds.len(),
            self.total_windows(),
            self.elapsed.as_secs_f64()
        )
    }
}
