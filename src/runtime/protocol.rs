use crate::backfill::feed::FeedState;
use crate::backfill::window::ScanWindow;
use crate::remote::ConnectionSlot;
use anyhow::Error as AnyError;
use core::future::Future;
use core::pin::Pin;

pub type ScanFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ScanError>> + Send + 'a>>;

/// Why a window is being scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMode {
    /// Part of a checkpointed backward walk.
    Backfill,
    /// An explicit range requested by an operator; the frontier is untouched.
    Range,
}

/// Error surfaced by a scan processor. The feed is aborted for the run.
#[derive(Debug)]
pub struct ScanError {
    window: ScanWindow,
    source: AnyError,
}

impl ScanError {
    pub fn new(window: ScanWindow, source: AnyError) -> Self {
        Self { window, source }
    }

    pub fn window(&self) -> ScanWindow {
        self.window
    }

    pub fn into_source(self) -> AnyError {
        self.source
    }
}

impl core::fmt::Display for ScanError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "scan of {} failed: {}", self.window, self.source)
    }
}

impl std::error::Error for ScanError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Content-scan collaborator that turns a window of messages into indexed records.
///
/// Implementations must be idempotent per range: a crash between a successful
/// scan and its checkpoint replays the same window on the next run.
pub trait ScanProcessor: Send {
    /// Scans `window` of `feed` over the bulk connection.
    fn scan<'a>(
        &'a mut self,
        connection: &'a mut ConnectionSlot,
        feed: &'a FeedState,
        window: ScanWindow,
        mode: ScanMode,
    ) -> ScanFuture<'a>;
}
