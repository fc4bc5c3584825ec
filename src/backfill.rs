//! The backfill engine: date location, windowed scanning and per-run orchestration.

pub(crate) mod backoff;
pub mod feed;
pub mod locator;
pub mod orchestrator;
pub mod outcome;
pub mod report;
pub mod scanner;
pub mod window;

pub use feed::{BackfillTarget, Checkpoint, CheckpointError, FeedId, FeedState};
pub use locator::{DateLocator, DateProbe, LocateOutcome, Location, LocatorOptions};
pub use orchestrator::{FeedSelection, Orchestrator};
pub use outcome::{AbortReason, FeedReport, NoOpReason, RunResult, RunSummary};
pub use report::{BackfillReport, ReportOrder, ReportRow};
pub use scanner::{ScanReport, ScanRequest, WindowedScanner};
pub use window::{ScanWindow, WindowPlan};
