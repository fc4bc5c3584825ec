//! Capability surface over a remote feed session. Implementations are thin:
//! they issue one command per call and report a tagged [`RemoteError`]. Retry
//! and reconnect policy lives in [`crate::remote::connection`].

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Low/high sequence bounds the remote reports for a feed at one point in time.
///
/// Ranges are volatile: a reconnect invalidates any cached copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceRange {
    pub low: u64,
    pub high: u64,
}

impl SequenceRange {
    pub fn new(low: u64, high: u64) -> Self {
        Self { low, high }
    }

    /// Distance between the newest and oldest retained sequence numbers.
    pub fn span(&self) -> u64 {
        self.high.saturating_sub(self.low)
    }

    pub fn contains(&self, sequence: u64) -> bool {
        sequence >= self.low && sequence <= self.high
    }
}

/// Header compression mode of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionMode {
    Compressed,
    Uncompressed,
}

impl CompressionMode {
    pub fn from_flag(compressed: bool) -> Self {
        if compressed {
            Self::Compressed
        } else {
            Self::Uncompressed
        }
    }

    pub fn is_compressed(self) -> bool {
        matches!(self, Self::Compressed)
    }
}

impl fmt::Display for CompressionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compressed => f.write_str("compressed"),
            Self::Uncompressed => f.write_str("uncompressed"),
        }
    }
}

/// Coarse classification used by retry policy and run summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    Transient,
    Protocol,
    DateUnavailable,
    Connect,
}

/// Tagged error returned by every remote operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("remote {operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("connection reset during {operation}: {detail}")]
    ConnectionReset {
        operation: &'static str,
        detail: String,
    },
    #[error("remote session failed during {operation}: {detail}")]
    Session {
        operation: &'static str,
        detail: String,
    },
    #[error("feed {feed} is unknown to the remote or cannot be selected")]
    UnknownFeed { feed: String },
    #[error("remote rejected {operation} (code {code}): {message}")]
    Protocol {
        operation: &'static str,
        code: u16,
        message: String,
    },
    #[error("no date available for sequence {sequence}")]
    DateUnavailable { sequence: u64 },
    #[error("failed to connect to remote: {detail}")]
    Connect { detail: String },
}

impl RemoteError {
    pub fn kind(&self) -> RemoteErrorKind {
        match self {
            Self::Timeout { .. } | Self::ConnectionReset { .. } | Self::Session { .. } => {
                RemoteErrorKind::Transient
            }
            Self::UnknownFeed { .. } | Self::Protocol { .. } => RemoteErrorKind::Protocol,
            Self::DateUnavailable { .. } => RemoteErrorKind::DateUnavailable,
            Self::Connect { .. } => RemoteErrorKind::Connect,
        }
    }

    /// Whether a reconnect-and-retry may succeed where this attempt failed.
    pub fn is_recoverable(&self) -> bool {
        self.kind() == RemoteErrorKind::Transient
    }
}

/// Remote feed session capability.
pub trait RemoteSequenceClient: Send {
    /// Selects a feed and returns its current bounds.
    fn select_feed<'a>(&'a mut self, name: &'a str)
        -> BoxFuture<'a, Result<SequenceRange, RemoteError>>;

    /// Fetches the self-reported timestamp of one message of the selected feed.
    fn fetch_date(&mut self, sequence: u64) -> BoxFuture<'_, Result<DateTime<Utc>, RemoteError>>;

    /// Drops the current session without waiting on it and opens a fresh one
    /// in `mode`.
    ///
    /// Any previously selected feed must be selected again by the caller.
    fn reconnect(&mut self, mode: CompressionMode) -> BoxFuture<'_, Result<(), RemoteError>>;

    fn close(&mut self) -> BoxFuture<'_, Result<(), RemoteError>>;
}

/// Opens new remote sessions.
pub trait RemoteConnector: Send + Sync {
    fn connect(
        &self,
        mode: CompressionMode,
    ) -> BoxFuture<'_, Result<Box<dyn RemoteSequenceClient>, RemoteError>>;
}
