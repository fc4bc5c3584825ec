//! Run-level driver: picks feeds, opens the connection pair once, computes
//! each feed's target and hands it to the scanner.

use crate::backfill::feed::{BackfillTarget, Checkpoint, FeedState};
use crate::backfill::locator::{DateLocator, LocateOutcome};
use crate::backfill::outcome::{AbortReason, FeedReport, NoOpReason, RunResult, RunSummary};
use crate::backfill::scanner::{ScanRequest, WindowedScanner};
use crate::backfill::window::ScanWindow;
use crate::remote::{ConnectionManager, RemoteConnector};
use crate::runtime::config::BackfillConfig;
use crate::runtime::progress::ProgressStore;
use crate::runtime::protocol::{ScanMode, ScanProcessor};
use crate::runtime::telemetry::Telemetry;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Which feeds a run covers and how their targets are expressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedSelection {
    /// Every backfill-enabled feed with its stored target, optionally only
    /// those whose frontier date lies in the safe window.
    Active { within_safe_window: bool },
    /// One feed with its stored target.
    Named(String),
    /// One feed, `count` messages older than its frontier.
    NamedCount { name: String, count: u64 },
    /// Every backfill-enabled feed in count mode.
    ActiveCount { count: u64, within_safe_window: bool },
    /// The first enabled feed by name whose frontier date lies in the safe window.
    SafeCount { count: u64 },
}

struct PlannedFeed {
    feed: FeedState,
    target: BackfillTarget,
}

struct TargetPlan {
    target: u64,
    safety_margin: u64,
    degraded: bool,
}

pub struct Orchestrator<S, P> {
    config: BackfillConfig,
    connector: Arc<dyn RemoteConnector>,
    store: S,
    processor: P,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
}

impl<S, P> Orchestrator<S, P>
where
    S: ProgressStore,
    P: ScanProcessor,
{
    pub fn new(
        config: BackfillConfig,
        connector: Arc<dyn RemoteConnector>,
        store: S,
        processor: P,
    ) -> Self {
        Self::with_cancellation_token(config, connector, store, processor, CancellationToken::new())
    }

    pub fn with_cancellation_token(
        config: BackfillConfig,
        connector: Arc<dyn RemoteConnector>,
        store: S,
        processor: P,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            connector,
            store,
            processor,
            telemetry: Arc::new(Telemetry::default()),
            shutdown,
        }
    }

    pub fn config(&self) -> &BackfillConfig {
        &self.config
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Swaps the root token, e.g. after a cancelled run.
    pub fn replace_shutdown_root(&mut self, shutdown: CancellationToken) {
        self.shutdown = shutdown;
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    pub fn into_parts(self) -> (S, P) {
        (self.store, self.processor)
    }

    pub async fn run_active(&mut self) -> Result<RunSummary> {
        self.run(FeedSelection::Active {
            within_safe_window: false,
        })
        .await
    }

    pub async fn run_feed(&mut self, name: &str) -> Result<RunSummary> {
        self.run(FeedSelection::Named(name.to_owned())).await
    }

    pub async fn run_feed_with_count(&mut self, name: &str, count: u64) -> Result<RunSummary> {
        self.run(FeedSelection::NamedCount {
            name: name.to_owned(),
            count,
        })
        .await
    }

    pub async fn safe_backfill(&mut self, count: u64) -> Result<RunSummary> {
        self.run(FeedSelection::SafeCount { count }).await
    }

    /// Runs every selected feed in turn.
    ///
    /// Feed-level failures are recorded in the summary. Only a failing store
    /// lookup or failing to open the connection pair returns an error.
    pub async fn run(&mut self, selection: FeedSelection) -> Result<RunSummary> {
        let started = Instant::now();
        let planned = self.select(&selection)?;

        if planned.is_empty() {
            let note = match selection {
                FeedSelection::SafeCount { .. } => format!(
                    "no feeds to backfill; all are at the safe date {}",
                    self.config.safe_backfill_date()
                ),
                _ => "no feeds selected for backfill".to_owned(),
            };
            tracing::info!("{note}");
            return Ok(RunSummary {
                feeds: Vec::new(),
                elapsed: started.elapsed(),
                note: Some(note),
            });
        }

        let mut connections = self.open().await?;

        let total = planned.len();
        let mut summary = RunSummary::default();
        for (index, PlannedFeed { feed, target }) in planned.into_iter().enumerate() {
            tracing::info!(feed = %feed.name, "starting feed {} of {}", index + 1, total);
            let report = self
                .run_planned(&mut connections, &feed, target, total - index - 1)
                .await;
            tracing::info!(
                feed = %report.feed,
                result = %report.result,
                windows = report.windows,
                elapsed_ms = report.elapsed.as_millis() as u64,
                "feed finished"
            );
            summary.feeds.push(report);
        }

        self.close(connections).await;
        summary.elapsed = started.elapsed();
        Ok(summary)
    }

    /// Scans one explicit range of `name` without moving its frontier.
    pub async fn scan_range(&mut self, name: &str, first: u64, last: u64) -> Result<ScanWindow> {
        if first > last {
            bail!("range start {first} is after its end {last}");
        }
        let feed = self.feed_named(name)?;
        let window = ScanWindow::new(first, last);
        let mut connections = self.open().await?;

        let result = self.scan_range_on(&mut connections, &feed, window).await;
        self.close(connections).await;
        result?;
        tracing::info!(feed = %feed.name, first, last, "range scanned");
        Ok(window)
    }

    /// Records a checkpoint at `first` after externally partitioned range scans.
    pub async fn finalize(&mut self, name: &str, first: u64) -> Result<Checkpoint> {
        let feed = self.feed_named(name)?;
        let mut connections = self.open().await?;
        let scanner = self.scanner();

        let result = scanner
            .commit(connections.control(), &mut self.store, &feed, first)
            .await
            .with_context(|| format!("failed to finalize {} at {first}", feed.name));

        self.close(connections).await;
        let (checkpoint, fallback) = result?;
        tracing::info!(feed = %feed.name, sequence = first, fallback, "backfill finalized");
        Ok(checkpoint)
    }

    async fn scan_range_on(
        &mut self,
        connections: &mut ConnectionManager,
        feed: &FeedState,
        window: ScanWindow,
    ) -> Result<()> {
        let bulk = connections.bulk();
        bulk.select_feed(&feed.name)
            .await
            .with_context(|| format!("failed to select {}", feed.name))?;
        self.processor
            .scan(bulk, feed, window, ScanMode::Range)
            .await
            .with_context(|| format!("range scan of {} failed", feed.name))?;
        self.telemetry.record_window(window.width());
        Ok(())
    }

    async fn run_planned(
        &mut self,
        connections: &mut ConnectionManager,
        feed: &FeedState,
        target: BackfillTarget,
        feeds_left: usize,
    ) -> FeedReport {
        let started = Instant::now();
        let mut report = FeedReport {
            feed: feed.name.clone(),
            result: RunResult::Completed,
            target: None,
            windows: 0,
            messages: 0,
            last_checkpoint: None,
            elapsed: Default::default(),
        };

        report.result = 'result: {
            if self.shutdown.is_cancelled() {
                break 'result RunResult::Aborted(AbortReason::Cancelled);
            }
            if let Some(detail) = feed.configuration_error() {
                tracing::warn!(feed = %feed.name, "{detail}");
                break 'result RunResult::NoOp(NoOpReason::InvalidConfiguration(detail));
            }

            let plan = match self.plan_target(connections, feed, target).await {
                Ok(plan) => plan,
                Err(result) => break 'result result,
            };
            report.target = Some(plan.target);

            let request = ScanRequest {
                feed,
                target: plan.target,
                safety_margin: plan.safety_margin,
                chunk_size: feed.chunk_size.unwrap_or(self.config.chunk_size()),
                feeds_left,
            };
            let scanned = self
                .scanner()
                .backfill(request, connections, &mut self.store, &mut self.processor)
                .await;
            report.windows = scanned.windows.len();
            report.messages = scanned.messages;
            report.last_checkpoint = scanned.last_checkpoint.map(|checkpoint| checkpoint.sequence);

            match scanned.result {
                RunResult::Exhausted => match self.store.disable_feed(feed.id) {
                    Ok(()) => {
                        tracing::info!(feed = %feed.name, "backfill disabled for exhausted feed");
                        RunResult::Exhausted
                    }
                    Err(err) => RunResult::Aborted(AbortReason::Store(format!("{err:#}"))),
                },
                other => other.degrade_if(plan.degraded),
            }
        };

        report.elapsed = started.elapsed();
        report
    }

    async fn plan_target(
        &self,
        connections: &mut ConnectionManager,
        feed: &FeedState,
        target: BackfillTarget,
    ) -> Result<TargetPlan, RunResult> {
        match target {
            BackfillTarget::Count(0) => Err(RunResult::NoOp(NoOpReason::InvalidConfiguration(
                "count target must be greater than 0".to_owned(),
            ))),
            BackfillTarget::Count(count) => {
                let range = connections
                    .bulk()
                    .select_feed(&feed.name)
                    .await
                    .map_err(|err| RunResult::Aborted(err.into()))?;
                let target = feed.first_record.saturating_sub(count).max(range.low);
                tracing::info!(feed = %feed.name, count, target, "count target computed");
                Ok(TargetPlan {
                    target,
                    safety_margin: count,
                    degraded: false,
                })
            }
            BackfillTarget::Days(days) => {
                let now = Utc::now();
                let location = self
                    .locator()
                    .locate(connections.control(), &feed.name, now, days)
                    .await
                    .map_err(|err| RunResult::Aborted(err.into()))?;

                let target = match location.outcome {
                    LocateOutcome::Found(sequence) | LocateOutcome::ClampedToOldest(sequence) => {
                        sequence
                    }
                    LocateOutcome::FallbackToCount => location.range.low,
                    LocateOutcome::Unreachable => {
                        return Err(RunResult::Aborted(AbortReason::TargetUnreachable {
                            days,
                            minimum_days: location.minimum_reachable_days(now),
                        }));
                    }
                };
                Ok(TargetPlan {
                    target,
                    safety_margin: self.config.safety_margin(),
                    degraded: location.degraded,
                })
            }
        }
    }

    fn select(&self, selection: &FeedSelection) -> Result<Vec<PlannedFeed>> {
        let planned = match selection {
            FeedSelection::Active { within_safe_window } => self
                .active_feeds(*within_safe_window)?
                .into_iter()
                .map(|feed| PlannedFeed {
                    target: feed.target,
                    feed,
                })
                .collect(),
            FeedSelection::Named(name) => {
                let feed = self.feed_named(name)?;
                vec![PlannedFeed {
                    target: feed.target,
                    feed,
                }]
            }
            FeedSelection::NamedCount { name, count } => vec![PlannedFeed {
                feed: self.feed_named(name)?,
                target: BackfillTarget::Count(*count),
            }],
            FeedSelection::ActiveCount {
                count,
                within_safe_window,
            } => self
                .active_feeds(*within_safe_window)?
                .into_iter()
                .map(|feed| PlannedFeed {
                    feed,
                    target: BackfillTarget::Count(*count),
                })
                .collect(),
            FeedSelection::SafeCount { count } => self
                .active_feeds(true)?
                .into_iter()
                .take(1)
                .map(|feed| PlannedFeed {
                    feed,
                    target: BackfillTarget::Count(*count),
                })
                .collect(),
        };
        Ok(planned)
    }

    /// Enabled feeds sorted by name.
    fn active_feeds(&self, within_safe_window: bool) -> Result<Vec<FeedState>> {
        let window_start = self.safe_window_start();
        let now = Utc::now();
        let mut feeds: Vec<FeedState> = self
            .store
            .list_feeds()
            .context("failed to list feeds")?
            .into_iter()
            .filter(|feed| feed.enabled)
            .filter(|feed| {
                !within_safe_window
                    || feed
                        .first_record_date
                        .is_some_and(|date| date >= window_start && date <= now)
            })
            .collect();
        feeds.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(feeds)
    }

    fn feed_named(&self, name: &str) -> Result<FeedState> {
        self.store
            .feed_by_name(name)
            .with_context(|| format!("failed to look up feed {name}"))?
            .with_context(|| format!("feed {name} is not in the progress store"))
    }

    fn safe_window_start(&self) -> DateTime<Utc> {
        let midnight = self
            .config
            .safe_backfill_date()
            .and_time(NaiveTime::default());
        Utc.from_utc_datetime(&midnight)
    }

    fn locator(&self) -> DateLocator {
        DateLocator::new(self.config.locator_options())
            .with_telemetry(self.telemetry.clone())
            .with_cancellation(self.shutdown.clone())
    }

    fn scanner(&self) -> WindowedScanner {
        WindowedScanner::new(self.locator(), self.telemetry.clone(), self.shutdown.clone())
    }

    async fn open(&self) -> Result<ConnectionManager> {
        ConnectionManager::open(
            self.connector.as_ref(),
            &self.config.connection_options(),
            self.config.bulk_mode(),
        )
        .await
        .context("failed to open remote connections")
    }

    async fn close(&self, mut connections: ConnectionManager) {
        let bulk = connections.bulk().metrics();
        let control = connections.control().metrics();
        self.telemetry.record_remote(
            bulk.total_errors + control.total_errors,
            bulk.total_timeouts + control.total_timeouts,
            bulk.reconnects + control.reconnects,
        );
        connections.close().await;
    }
}
