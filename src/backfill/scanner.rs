//! Checkpointed backward walk from a feed's frontier to a target sequence.

use crate::backfill::feed::{Checkpoint, FeedState};
use crate::backfill::locator::DateLocator;
use crate::backfill::outcome::{AbortReason, NoOpReason, RunResult};
use crate::backfill::window::{ScanWindow, WindowPlan};
use crate::remote::{ConnectionManager, ConnectionSlot};
use crate::runtime::progress::ProgressStore;
use crate::runtime::protocol::{ScanMode, ScanProcessor};
use crate::runtime::telemetry::Telemetry;
use chrono::Utc;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// One feed's backfill pass.
#[derive(Debug, Clone, Copy)]
pub struct ScanRequest<'a> {
    pub feed: &'a FeedState,
    pub target: u64,
    /// Messages above the remote's oldest that are left alone.
    pub safety_margin: u64,
    pub chunk_size: u64,
    /// Feeds still waiting after this one, for progress reporting.
    pub feeds_left: usize,
}

#[derive(Debug)]
pub struct ScanReport {
    pub result: RunResult,
    pub windows: Vec<ScanWindow>,
    pub messages: u64,
    pub last_checkpoint: Option<Checkpoint>,
    pub fallback_dates: u32,
}

impl ScanReport {
    fn new(result: RunResult) -> Self {
        Self {
            result,
            windows: Vec::new(),
            messages: 0,
            last_checkpoint: None,
            fallback_dates: 0,
        }
    }
}

#[derive(Clone)]
pub struct WindowedScanner {
    locator: DateLocator,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
}

impl WindowedScanner {
    /// `locator` supplies the date probe used for checkpoint dates.
    pub fn new(locator: DateLocator, telemetry: Arc<Telemetry>, shutdown: CancellationToken) -> Self {
        Self {
            locator,
            telemetry,
            shutdown,
        }
    }

    /// Walks `request.feed` back to `request.target`, one checkpointed window
    /// at a time.
    ///
    /// The processor scans over the bulk slot; checkpoint dates are read on the
    /// control slot. Cancellation is honoured only between windows.
    pub async fn backfill<S, P>(
        &self,
        request: ScanRequest<'_>,
        connections: &mut ConnectionManager,
        store: &mut S,
        processor: &mut P,
    ) -> ScanReport
    where
        S: ProgressStore + ?Sized,
        P: ScanProcessor + ?Sized,
    {
        let feed = request.feed;
        let range = match connections.bulk().select_feed(&feed.name).await {
            Ok(range) => range,
            Err(err) => return ScanReport::new(RunResult::Aborted(err.into())),
        };

        if feed.first_record.saturating_sub(1) <= range.low.saturating_add(request.safety_margin) {
            tracing::info!(
                feed = %feed.name,
                first_record = feed.first_record,
                remote_low = range.low,
                safety_margin = request.safety_margin,
                "reached the oldest message worth backfilling"
            );
            return ScanReport::new(RunResult::Exhausted);
        }

        if request.target >= feed.first_record {
            tracing::info!(
                feed = %feed.name,
                target = request.target,
                first_record = feed.first_record,
                "frontier already at target; nothing to do"
            );
            return ScanReport::new(RunResult::NoOp(NoOpReason::AlreadyAtTarget));
        }

        let plan = WindowPlan::new(feed.first_record, request.target, request.chunk_size);
        tracing::info!(
            feed = %feed.name,
            remote_low = range.low,
            remote_high = range.high,
            first_record = feed.first_record,
            target = request.target,
            windows = WindowPlan::window_count(feed.first_record, request.target, request.chunk_size),
            "starting backfill"
        );

        let mut report = ScanReport::new(RunResult::Completed);
        for window in plan.clone() {
            if self.shutdown.is_cancelled() {
                tracing::info!(feed = %feed.name, next = %window, "backfill cancelled between windows");
                report.result = RunResult::Aborted(AbortReason::Cancelled);
                return report;
            }

            let started = Instant::now();
            tracing::info!(
                feed = %feed.name,
                first = window.first,
                last = window.last,
                width = window.width(),
                queued = plan.remaining_after(&window),
                feeds_left = request.feeds_left,
                "scanning window"
            );

            let (bulk, control) = connections.slots();
            if let Err(err) = processor.scan(bulk, feed, window, ScanMode::Backfill).await {
                tracing::error!(feed = %feed.name, window = %window, error = %err, "scan failed; aborting feed");
                report.result = RunResult::Aborted(err.into());
                return report;
            }
            report.windows.push(window);
            report.messages += window.width();
            self.telemetry.record_window(window.width());

            match self.commit(control, store, feed, window.first).await {
                Ok((checkpoint, fallback)) => {
                    report.fallback_dates += u32::from(fallback);
                    report.last_checkpoint = Some(checkpoint);
                }
                Err(reason) => {
                    tracing::error!(feed = %feed.name, window = %window, error = %reason, "checkpoint failed; aborting feed");
                    report.result = RunResult::Aborted(reason);
                    return report;
                }
            }

            tracing::info!(
                feed = %feed.name,
                first = window.first,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "window committed"
            );
        }

        report.result = report.result.degrade_if(report.fallback_dates > 0);
        report
    }

    /// Dates and persists a checkpoint at `sequence`. Returns whether the
    /// date is a fallback.
    pub async fn commit<S>(
        &self,
        control: &mut ConnectionSlot,
        store: &mut S,
        feed: &FeedState,
        sequence: u64,
    ) -> Result<(Checkpoint, bool), AbortReason>
    where
        S: ProgressStore + ?Sized,
    {
        control.ensure_selected(&feed.name).await?;
        let probe = self
            .locator
            .probe_checkpoint_date(control, sequence, Utc::now())
            .await?;
        let checkpoint = Checkpoint::new(feed.id, sequence, probe.date);

        store
            .write_checkpoint(&checkpoint)
            .map_err(|err| AbortReason::Checkpoint {
                sequence,
                detail: format!("{err:#}"),
            })?;
        self.telemetry.record_checkpoint();
        tracing::debug!(
            feed = %feed.name,
            sequence,
            date = %probe.date,
            fallback = probe.fallback,
            "checkpoint written"
        );
        Ok((checkpoint, probe.fallback))
    }
}
