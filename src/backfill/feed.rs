//! Persistent per-feed state and the checkpoints that move its frontier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeedId(pub u64);

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// How far back a feed should be backfilled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillTarget {
    /// Days back from the moment the run starts.
    Days(u32),
    /// Absolute number of messages older than the frontier.
    Count(u64),
}

impl BackfillTarget {
    pub fn is_zero(&self) -> bool {
        match self {
            Self::Days(days) => *days == 0,
            Self::Count(count) => *count == 0,
        }
    }
}

impl fmt::Display for BackfillTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Days(days) => write!(f, "{days} day(s)"),
            Self::Count(count) => write!(f, "{count} message(s)"),
        }
    }
}

fn enabled_by_default() -> bool {
    true
}

/// Everything the engine knows about one mirrored feed.
///
/// `first_record` is the frontier: the oldest sequence held locally. It only
/// moves older, and only through [`FeedState::apply_checkpoint`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedState {
    pub id: FeedId,
    pub name: String,
    pub first_record: u64,
    #[serde(default)]
    pub first_record_date: Option<DateTime<Utc>>,
    /// Newest sequence held locally, maintained by the forward updater.
    #[serde(default)]
    pub last_record: u64,
    pub target: BackfillTarget,
    /// Overrides the configured window width for this feed.
    #[serde(default)]
    pub chunk_size: Option<u64>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
}

impl FeedState {
    pub fn new(id: FeedId, name: impl Into<String>, first_record: u64, target: BackfillTarget) -> Self {
        Self {
            id,
            name: name.into(),
            first_record,
            first_record_date: None,
            last_record: first_record,
            target,
            chunk_size: None,
            enabled: true,
            last_updated: None,
        }
    }

    pub fn with_first_record_date(mut self, date: DateTime<Utc>) -> Self {
        self.first_record_date = Some(date);
        self
    }

    pub fn with_last_record(mut self, last_record: u64) -> Self {
        self.last_record = last_record;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Reason this feed cannot be backfilled as configured, if any.
    pub fn configuration_error(&self) -> Option<String> {
        if self.first_record == 0 {
            return Some(format!(
                "feed {} has no known frontier; run a forward update first",
                self.name
            ));
        }
        if self.target.is_zero() {
            return Some(format!("feed {} has a zero backfill target", self.name));
        }
        if self.chunk_size == Some(0) {
            return Some(format!("feed {} has a zero chunk size", self.name));
        }
        None
    }

    /// Messages currently held between the frontier and the newest record.
    pub fn messages_held(&self) -> u64 {
        self.last_record.saturating_sub(self.first_record)
    }

    /// Moves the frontier to the checkpoint. A checkpoint newer than the
    /// current frontier is rejected and leaves the state untouched.
    pub fn apply_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        if checkpoint.feed_id != self.id {
            return Err(CheckpointError::FeedMismatch {
                expected: self.id,
                found: checkpoint.feed_id,
            });
        }
        if checkpoint.sequence > self.first_record {
            return Err(CheckpointError::FrontierMovedNewer {
                feed: self.id,
                current: self.first_record,
                proposed: checkpoint.sequence,
            });
        }
        self.first_record = checkpoint.sequence;
        self.first_record_date = Some(checkpoint.date);
        self.last_updated = Some(checkpoint.written_at);
        Ok(())
    }
}

/// Durable record written after a window has been processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub feed_id: FeedId,
    pub sequence: u64,
    pub date: DateTime<Utc>,
    pub written_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(feed_id: FeedId, sequence: u64, date: DateTime<Utc>) -> Self {
        Self {
            feed_id,
            sequence,
            date,
            written_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckpointError {
    #[error("checkpoint for feed {found} applied to feed {expected}")]
    FeedMismatch { expected: FeedId, found: FeedId },
    #[error("feed {feed}: checkpoint {proposed} would move the frontier newer than {current}")]
    FrontierMovedNewer {
        feed: FeedId,
        current: u64,
        proposed: u64,
    },
    #[error("feed {0} is unknown to the progress store")]
    UnknownFeed(FeedId),
}
