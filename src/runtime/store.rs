//! JSON file implementation of [`ProgressStore`].
//!
//! The whole feed table is rewritten on every change through a temporary file
//! in the same directory that is then renamed over the original, so a crash
//! leaves either the old or the new table on disk.

use crate::backfill::feed::{Checkpoint, CheckpointError, FeedId, FeedState};
use crate::runtime::progress::ProgressStore;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct StoreFile {
    schema_version: u32,
    feeds: Vec<FeedState>,
}

impl Default for StoreFile {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            feeds: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct JsonFileProgressStore {
    path: PathBuf,
    state: StoreFile,
}

impl JsonFileProgressStore {
    /// Loads the store at `path`, starting empty when the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let parsed: StoreFile = serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            if parsed.schema_version != SCHEMA_VERSION {
                bail!(
                    "{} has schema version {}, expected {}",
                    path.display(),
                    parsed.schema_version,
                    SCHEMA_VERSION
                );
            }
            parsed
        } else {
            StoreFile::default()
        };
        Ok(Self { path, state })
    }

    /// Creates (or replaces) the store at `path` with `feeds`.
    pub fn create(path: impl Into<PathBuf>, feeds: Vec<FeedState>) -> Result<Self> {
        let store = Self {
            path: path.into(),
            state: StoreFile {
                schema_version: SCHEMA_VERSION,
                feeds,
            },
        };
        store.save()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Adds a feed or replaces the one with the same id.
    pub fn upsert_feed(&mut self, feed: FeedState) -> Result<()> {
        match self.state.feeds.iter_mut().find(|existing| existing.id == feed.id) {
            Some(existing) => *existing = feed,
            None => self.state.feeds.push(feed),
        }
        self.save()
    }

    fn feed_mut(&mut self, id: FeedId) -> Result<&mut FeedState> {
        self.state
            .feeds
            .iter_mut()
            .find(|feed| feed.id == id)
            .ok_or_else(|| CheckpointError::UnknownFeed(id).into())
    }

    fn save(&self) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

        let data = serde_json::to_string_pretty(&self.state)?;
        let mut file = NamedTempFile::new_in(&dir)
            .with_context(|| format!("failed to create a temporary file in {}", dir.display()))?;
        file.write_all(format!("{data}\n").as_bytes())
            .with_context(|| format!("failed to write {}", file.path().display()))?;
        file.as_file()
            .sync_all()
            .with_context(|| format!("failed to sync {}", file.path().display()))?;
        file.persist(&self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

impl ProgressStore for JsonFileProgressStore {
    fn list_feeds(&self) -> Result<Vec<FeedState>> {
        Ok(self.state.feeds.clone())
    }

    fn read_feed_state(&self, id: FeedId) -> Result<Option<FeedState>> {
        Ok(self.state.feeds.iter().find(|feed| feed.id == id).cloned())
    }

    fn write_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        let feed = self.feed_mut(checkpoint.feed_id)?;
        let previous = feed.clone();
        feed.apply_checkpoint(checkpoint)?;
        if let Err(err) = self.save() {
            // Keep memory in line with what is on disk.
            if let Ok(feed) = self.feed_mut(checkpoint.feed_id) {
                *feed = previous;
            }
            return Err(err);
        }
        Ok(())
    }

    fn disable_feed(&mut self, id: FeedId) -> Result<()> {
        self.feed_mut(id)?.enabled = false;
        self.save()
    }
}
