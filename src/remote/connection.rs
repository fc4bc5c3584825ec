//! Connection lifecycle around [`RemoteSequenceClient`]: per-call deadlines,
//! a single reconnect-and-retry on transient failures, and the two slots a
//! backfill run owns (bulk scanning and date probing).

use crate::remote::client::{
    CompressionMode, RemoteConnector, RemoteError, RemoteSequenceClient, SequenceRange,
};
use crate::remote::metrics::{RemoteMetrics, RemoteMetricsSnapshot};
use crate::remote::options::ConnectionOptions;
use crate::remote::retry::{RetryContext, FETCH_DATE_RETRY, SELECT_FEED_RETRY};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};

/// Reconnect-and-retry cycles allowed per call. A failure after the retry is terminal.
pub const RETRIES_PER_CALL: usize = 1;

const NO_FEED: &str = "<none>";

async fn with_deadline<T>(
    deadline: Duration,
    operation: &'static str,
    call: BoxFuture<'_, Result<T, RemoteError>>,
) -> Result<T, RemoteError> {
    timeout(deadline, call)
        .await
        .map_err(|_| RemoteError::Timeout {
            operation,
            timeout: deadline,
        })?
}

/// One remote session plus the feed it currently has selected.
pub struct ConnectionSlot {
    mode: CompressionMode,
    client: Box<dyn RemoteSequenceClient>,
    selected: Option<String>,
    range: Option<SequenceRange>,
    request_timeout: Duration,
    probe_delay: Duration,
    metrics: Arc<RemoteMetrics>,
    /// Set when a transient failure escaped the slot. The session may still
    /// deliver a late reply, so it is replaced before the next call.
    stale: bool,
}

impl ConnectionSlot {
    /// Opens a fresh session through `connector`.
    pub async fn open(
        connector: &dyn RemoteConnector,
        mode: CompressionMode,
        request_timeout: Duration,
        probe_delay: Duration,
    ) -> Result<Self, RemoteError> {
        let client = with_deadline(request_timeout, "connect", connector.connect(mode)).await?;
        tracing::debug!(mode = %mode, "remote connection established");
        Ok(Self::from_client(client, mode, request_timeout, probe_delay))
    }

    /// Wraps an already connected client.
    pub fn from_client(
        client: Box<dyn RemoteSequenceClient>,
        mode: CompressionMode,
        request_timeout: Duration,
        probe_delay: Duration,
    ) -> Self {
        Self {
            mode,
            client,
            selected: None,
            range: None,
            request_timeout,
            probe_delay,
            metrics: Arc::new(RemoteMetrics::default()),
            stale: false,
        }
    }

    pub fn mode(&self) -> CompressionMode {
        self.mode
    }

    pub fn selected_feed(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    /// Bounds observed by the latest successful selection on this session.
    ///
    /// Cleared on every reconnect.
    pub fn range(&self) -> Option<SequenceRange> {
        self.range
    }

    pub fn metrics(&self) -> RemoteMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Whether the session will be replaced before the next call.
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Raw access to the session for collaborators that issue their own commands.
    pub fn client_mut(&mut self) -> &mut dyn RemoteSequenceClient {
        self.client.as_mut()
    }

    /// Selects `name` and refreshes the cached range.
    pub async fn select_feed(&mut self, name: &str) -> Result<SequenceRange, RemoteError> {
        let context = RetryContext::new(&SELECT_FEED_RETRY, name, self.mode);
        if self.stale {
            self.selected = None;
            self.reconnect_logged(&context).await?;
        }
        let mut attempt = 0;

        loop {
            attempt += 1;
            let start = Instant::now();
            let result = with_deadline(
                self.request_timeout,
                "select_feed",
                self.client.select_feed(name),
            )
            .await;

            match result {
                Ok(range) => {
                    self.metrics.record_success(start.elapsed());
                    self.selected = Some(name.to_owned());
                    self.range = Some(range);
                    tracing::debug!(
                        feed = name,
                        mode = %self.mode,
                        low = range.low,
                        high = range.high,
                        attempt,
                        "feed selected"
                    );
                    return Ok(range);
                }
                Err(err) => {
                    self.record_error(&err, start.elapsed());
                    if !err.is_recoverable() {
                        context.log_terminal(attempt, &err);
                        return Err(err);
                    }
                    if attempt > RETRIES_PER_CALL {
                        context.log_exhausted(attempt, &err);
                        self.stale = true;
                        return Err(err);
                    }
                    context.log_retry(attempt, &err);
                    // The retried call is the selection itself, so nothing to reselect.
                    self.selected = None;
                    self.reconnect_logged(&context).await?;
                }
            }
        }
    }

    /// Selects `name` unless this session already has it selected.
    pub async fn ensure_selected(&mut self, name: &str) -> Result<SequenceRange, RemoteError> {
        match (self.selected.as_deref(), self.range) {
            (Some(current), Some(range)) if current == name && !self.stale => Ok(range),
            _ => self.select_feed(name).await,
        }
    }

    /// Fetches the date of `sequence` in the selected feed, pausing for the
    /// configured probe delay first.
    pub async fn fetch_date(&mut self, sequence: u64) -> Result<DateTime<Utc>, RemoteError> {
        if !self.probe_delay.is_zero() {
            sleep(self.probe_delay).await;
        }

        let feed = self.selected.clone().unwrap_or_else(|| NO_FEED.to_owned());
        let context = RetryContext::with_sequence(&FETCH_DATE_RETRY, &feed, self.mode, sequence);
        if self.stale {
            self.reconnect_logged(&context).await?;
            self.reselect().await?;
        }
        let mut attempt = 0;

        loop {
            attempt += 1;
            let start = Instant::now();
            let result = with_deadline(
                self.request_timeout,
                "fetch_date",
                self.client.fetch_date(sequence),
            )
            .await;

            match result {
                Ok(date) => {
                    self.metrics.record_success(start.elapsed());
                    return Ok(date);
                }
                Err(err) => {
                    self.record_error(&err, start.elapsed());
                    if !err.is_recoverable() {
                        context.log_terminal(attempt, &err);
                        return Err(err);
                    }
                    if attempt > RETRIES_PER_CALL {
                        context.log_exhausted(attempt, &err);
                        self.stale = true;
                        return Err(err);
                    }
                    context.log_retry(attempt, &err);
                    self.reconnect_logged(&context).await?;
                    self.reselect().await?;
                }
            }
        }
    }

    /// Drops the session and opens a fresh one in the same mode. The previously
    /// selected feed is selected again so the slot is usable immediately.
    pub async fn reconnect(&mut self) -> Result<(), RemoteError> {
        let feed = self.selected.clone().unwrap_or_else(|| NO_FEED.to_owned());
        let context = RetryContext::new(&SELECT_FEED_RETRY, &feed, self.mode);
        self.reconnect_logged(&context).await?;
        self.reselect().await
    }

    pub async fn close(&mut self) -> Result<(), RemoteError> {
        self.selected = None;
        self.range = None;
        with_deadline(self.request_timeout, "close", self.client.close()).await
    }

    async fn reconnect_logged(&mut self, context: &RetryContext<'_>) -> Result<(), RemoteError> {
        self.range = None;
        self.stale = true;
        self.metrics.record_reconnect();
        let result = with_deadline(
            self.request_timeout,
            "reconnect",
            self.client.reconnect(self.mode),
        )
        .await;
        match &result {
            Ok(()) => self.stale = false,
            Err(err) => context.log_reconnect_failed(err),
        }
        result
    }

    async fn reselect(&mut self) -> Result<(), RemoteError> {
        let Some(feed) = self.selected.clone() else {
            return Ok(());
        };
        let result = with_deadline(
            self.request_timeout,
            "select_feed",
            self.client.select_feed(&feed),
        )
        .await;
        match result {
            Ok(range) => {
                self.range = Some(range);
                Ok(())
            }
            Err(err) => {
                self.stale |= err.is_recoverable();
                Err(err)
            }
        }
    }

    fn record_error(&self, err: &RemoteError, elapsed: Duration) {
        if matches!(err, RemoteError::Timeout { .. }) {
            self.metrics.record_timeout(elapsed);
        } else {
            self.metrics.record_failure(elapsed);
        }
    }
}

/// The pair of sessions a run owns: `bulk` feeds the scan processor and
/// `control` answers range and date queries. The remote does not guarantee the
/// two compression modes are interchangeable, so they never share a session.
pub struct ConnectionManager {
    bulk: ConnectionSlot,
    control: ConnectionSlot,
}

impl ConnectionManager {
    /// Opens both slots. Failing to open either one fails the whole call.
    pub async fn open(
        connector: &dyn RemoteConnector,
        options: &ConnectionOptions,
        bulk_mode: CompressionMode,
    ) -> Result<Self, RemoteError> {
        let mut bulk =
            ConnectionSlot::open(connector, bulk_mode, options.request_timeout, Duration::ZERO)
                .await?;
        let control = match ConnectionSlot::open(
            connector,
            CompressionMode::Uncompressed,
            options.request_timeout,
            options.probe_delay,
        )
        .await
        {
            Ok(slot) => slot,
            Err(err) => {
                if let Err(close_err) = bulk.close().await {
                    tracing::debug!(error = %close_err, "failed to close bulk connection after control connect failure");
                }
                return Err(err);
            }
        };

        Ok(Self { bulk, control })
    }

    pub fn from_slots(bulk: ConnectionSlot, control: ConnectionSlot) -> Self {
        Self { bulk, control }
    }

    pub fn bulk(&mut self) -> &mut ConnectionSlot {
        &mut self.bulk
    }

    pub fn control(&mut self) -> &mut ConnectionSlot {
        &mut self.control
    }

    /// Both slots at once, `(bulk, control)`.
    pub fn slots(&mut self) -> (&mut ConnectionSlot, &mut ConnectionSlot) {
        (&mut self.bulk, &mut self.control)
    }

    pub async fn close(mut self) {
        for slot in [&mut self.bulk, &mut self.control] {
            let mode = slot.mode();
            if let Err(err) = slot.close().await {
                tracing::warn!(mode = %mode, error = %err, "failed to close remote connection cleanly");
            }
        }
    }
}
