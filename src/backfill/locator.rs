//! Date-to-sequence search over a feed whose message dates are only mostly
//! monotone.
//!
//! The search steps an upper bound down by a shrinking interval until the
//! message just below it is old enough, then reports that message. Dates that
//! cannot be read are retried a bounded number of times and then replaced by
//! an approximate fallback so the search always terminates.

use crate::backfill::backoff::{BackoffStep, RetryBackoff};
use crate::remote::{ConnectionSlot, RemoteError, SequenceRange};
use crate::runtime::telemetry::Telemetry;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_ITERATIONS: u32 = 64;
pub const DEFAULT_DATE_RETRIES: usize = 5;
pub const DEFAULT_DATE_RETRY_DELAY: Duration = Duration::from_millis(100);

const SECONDS_PER_DAY: f64 = 86_400.0;
const FALLBACK_AGE_DAYS: i64 = 365;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocatorOptions {
    /// Outer iterations before the search gives up and reports its best bound.
    pub max_iterations: u32,
    /// Extra attempts at an unreadable date before the fallback is used.
    pub date_retries: usize,
    pub date_retry_delay: Duration,
    /// Report [`LocateOutcome::FallbackToCount`] instead of `Unreachable`.
    pub allow_count_fallback: bool,
}

impl Default for LocatorOptions {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            date_retries: DEFAULT_DATE_RETRIES,
            date_retry_delay: DEFAULT_DATE_RETRY_DELAY,
            allow_count_fallback: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocateOutcome {
    /// Newest sequence whose date is at or before the target.
    Found(u64),
    /// The target predates the oldest retained message.
    ClampedToOldest(u64),
    /// The target is newer than the newest message.
    Unreachable,
    /// As `Unreachable`, but the caller may switch to a count target.
    FallbackToCount,
}

impl LocateOutcome {
    pub fn sequence(&self) -> Option<u64> {
        match self {
            Self::Found(sequence) | Self::ClampedToOldest(sequence) => Some(*sequence),
            Self::Unreachable | Self::FallbackToCount => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub outcome: LocateOutcome,
    /// A fallback date was used or the iteration cap was hit.
    pub degraded: bool,
    pub probes: u32,
    pub iterations: u32,
    pub range: SequenceRange,
    pub target_date: DateTime<Utc>,
    pub oldest_date: DateTime<Utc>,
    pub newest_date: DateTime<Utc>,
}

impl Location {
    /// Smallest whole-day target that the newest message would satisfy.
    pub fn minimum_reachable_days(&self, now: DateTime<Utc>) -> u32 {
        (days_old(now, self.newest_date).floor() as u32).saturating_add(1)
    }
}

/// A date read for one sequence, or the substitute used when none could be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateProbe {
    pub date: DateTime<Utc>,
    pub fallback: bool,
}

/// Age of `date` at `now` in days, truncated to one decimal.
pub fn days_old(now: DateTime<Utc>, date: DateTime<Utc>) -> f64 {
    let seconds = (now - date).num_seconds() as f64;
    (seconds / SECONDS_PER_DAY * 10.0).trunc() / 10.0
}

pub fn fallback_date(now: DateTime<Utc>) -> DateTime<Utc> {
    now - ChronoDuration::days(FALLBACK_AGE_DAYS)
}

#[derive(Clone)]
pub struct DateLocator {
    options: LocatorOptions,
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
}

impl DateLocator {
    pub fn new(options: LocatorOptions) -> Self {
        Self {
            options,
            telemetry: Arc::new(Telemetry::default()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Cancelling the token cuts date retries short; the fallback is used instead.
    pub fn with_cancellation(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn options(&self) -> &LocatorOptions {
        &self.options
    }

    /// Finds the sequence of `feed` that is `days` old at `now`.
    pub async fn locate(
        &self,
        slot: &mut ConnectionSlot,
        feed: &str,
        now: DateTime<Utc>,
        days: u32,
    ) -> Result<Location, RemoteError> {
        let range = slot.select_feed(feed).await?;
        let target_date = now - ChronoDuration::days(i64::from(days));
        let days = f64::from(days);

        let mut search = Search {
            locator: self,
            slot,
            now,
            probes: 0,
            degraded: false,
        };

        let oldest_date = search.date(range.low).await?;
        let newest_date = search.date(range.high).await?;

        tracing::debug!(
            feed,
            low = range.low,
            high = range.high,
            target = %target_date,
            oldest = %oldest_date,
            newest = %newest_date,
            "locating target sequence"
        );

        let mut location = Location {
            outcome: LocateOutcome::Found(range.high),
            degraded: false,
            probes: 0,
            iterations: 0,
            range,
            target_date,
            oldest_date,
            newest_date,
        };

        if target_date < oldest_date {
            tracing::warn!(
                feed,
                oldest_days = days_old(now, oldest_date),
                "backfill target is older than the oldest retained message; starting from it"
            );
            location.outcome = LocateOutcome::ClampedToOldest(range.low);
            return Ok(search.finish(location));
        }

        if target_date > newest_date {
            location.outcome = if self.options.allow_count_fallback {
                tracing::warn!(feed, "backfill target is newer than the newest message; switching to a count target");
                LocateOutcome::FallbackToCount
            } else {
                tracing::warn!(
                    feed,
                    minimum_days = location.minimum_reachable_days(now),
                    "backfill target is newer than the newest message"
                );
                LocateOutcome::Unreachable
            };
            return Ok(search.finish(location));
        }

        let mut interval = (range.span() / 2).max(1);
        let mut upper = range.high;
        let mut below_upper = newest_date;

        while days_old(now, below_upper) < days {
            if location.iterations >= self.options.max_iterations {
                tracing::warn!(
                    feed,
                    iterations = location.iterations,
                    upper,
                    "date search hit its iteration cap; using the current bound"
                );
                search.degraded = true;
                break;
            }
            location.iterations += 1;

            while upper >= range.low.saturating_add(interval)
                && search.date(upper - interval).await? > target_date
            {
                upper -= interval;
            }

            interval = interval.div_ceil(2);
            below_upper = search.date(upper.saturating_sub(1).max(range.low)).await?;
        }

        // Without a single step the newest message already satisfies the target.
        let sequence = if location.iterations == 0 {
            range.high
        } else {
            upper.saturating_sub(1).max(range.low)
        };
        location.outcome = LocateOutcome::Found(sequence);

        tracing::info!(
            feed,
            sequence,
            days_old = days_old(now, below_upper),
            probes = search.probes,
            iterations = location.iterations,
            "located target sequence"
        );
        Ok(search.finish(location))
    }

    /// Reads the date of `sequence`, retrying unavailable dates and falling
    /// back to an approximate date once the retry budget is spent. Shutdown
    /// skips the remaining retries.
    pub async fn probe_date(
        &self,
        slot: &mut ConnectionSlot,
        sequence: u64,
        now: DateTime<Utc>,
    ) -> Result<DateProbe, RemoteError> {
        self.probe_date_with(slot, sequence, now, Some(&self.shutdown))
            .await
    }

    /// Like [`DateLocator::probe_date`] but always spends the full retry
    /// budget. Used for checkpoint dates, which outlive the run.
    pub async fn probe_checkpoint_date(
        &self,
        slot: &mut ConnectionSlot,
        sequence: u64,
        now: DateTime<Utc>,
    ) -> Result<DateProbe, RemoteError> {
        self.probe_date_with(slot, sequence, now, None).await
    }

    async fn probe_date_with(
        &self,
        slot: &mut ConnectionSlot,
        sequence: u64,
        now: DateTime<Utc>,
        cancellation: Option<&CancellationToken>,
    ) -> Result<DateProbe, RemoteError> {
        self.telemetry.record_date_probe();
        let mut backoff = RetryBackoff::fixed(self.options.date_retry_delay)
            .with_max_attempts(self.options.date_retries.saturating_add(1));
        if let Some(token) = cancellation {
            backoff = backoff.with_cancellation(token);
        }
        let mut backoff = backoff.start();

        loop {
            match slot.fetch_date(sequence).await {
                Ok(date) => {
                    if backoff.attempt() > 1 {
                        tracing::debug!(sequence, attempt = backoff.attempt(), "date read after retry");
                    }
                    return Ok(DateProbe {
                        date,
                        fallback: false,
                    });
                }
                Err(RemoteError::DateUnavailable { .. }) => match backoff.pause().await {
                    BackoffStep::Retry => continue,
                    BackoffStep::Exhausted | BackoffStep::Cancelled => {
                        let date = fallback_date(now);
                        self.telemetry.record_fallback_date();
                        tracing::warn!(
                            feed = slot.selected_feed().unwrap_or("<none>"),
                            sequence,
                            attempts = backoff.attempt(),
                            fallback = %date,
                            "no date available; using fallback date"
                        );
                        return Ok(DateProbe {
                            date,
                            fallback: true,
                        });
                    }
                },
                Err(err) => return Err(err),
            }
        }
    }
}

struct Search<'a> {
    locator: &'a DateLocator,
    slot: &'a mut ConnectionSlot,
    now: DateTime<Utc>,
    probes: u32,
    degraded: bool,
}

impl Search<'_> {
    async fn date(&mut self, sequence: u64) -> Result<DateTime<Utc>, RemoteError> {
        self.probes += 1;
        let probe = self.locator.probe_date(self.slot, sequence, self.now).await?;
        self.degraded |= probe.fallback;
        Ok(probe.date)
    }

    fn finish(self, mut location: Location) -> Location {
        location.probes = self.probes;
        location.degraded = self.degraded;
        location
    }
}
