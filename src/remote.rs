//! Remote feed access: the capability trait, connection slots with bounded
//! reconnect-and-retry, per-slot metrics and the NNTP adapter.

pub mod client;
pub mod connection;
pub mod metrics;
pub mod nntp;
pub mod options;
pub(crate) mod retry;
#[cfg(test)]
pub(crate) mod testing;

pub use client::{
    CompressionMode, RemoteConnector, RemoteError, RemoteErrorKind, RemoteSequenceClient,
    SequenceRange,
};
pub use connection::{ConnectionManager, ConnectionSlot, RETRIES_PER_CALL};
pub use metrics::RemoteMetricsSnapshot;
pub use nntp::{NntpClient, NntpConnector, NntpSettings};
pub use options::ConnectionOptions;
