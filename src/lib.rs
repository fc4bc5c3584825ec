pub mod backfill;
pub mod remote;
pub mod runtime;

pub use backfill::{
    AbortReason, BackfillReport, BackfillTarget, Checkpoint, DateLocator, FeedId, FeedSelection,
    FeedState, NoOpReason, Orchestrator, ReportOrder, RunResult, RunSummary, ScanWindow,
    WindowedScanner,
};
pub use remote::{
    CompressionMode, ConnectionManager, ConnectionOptions, ConnectionSlot, NntpConnector,
    NntpSettings, RemoteConnector, RemoteError, RemoteErrorKind, RemoteSequenceClient,
    SequenceRange,
};
pub use runtime::config::{BackfillConfig, BackfillConfigBuilder, BackfillConfigParams};
pub use runtime::progress::{MemoryProgressStore, ProgressStore};
pub use runtime::protocol::{ScanError, ScanFuture, ScanMode, ScanProcessor};
pub use runtime::runner::Runner;
pub use runtime::store::JsonFileProgressStore;
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
