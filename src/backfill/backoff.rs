use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Attempt budget and pacing for a bounded retry loop.
#[derive(Clone, Copy)]
pub(crate) struct RetryBackoff<'a> {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: usize,
    pub cancellation: Option<&'a CancellationToken>,
}

impl<'a> RetryBackoff<'a> {
    pub(crate) fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_attempts: 1,
            cancellation: None,
        }
    }

    /// Same pause between every attempt.
    pub(crate) fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay)
    }

    pub(crate) fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub(crate) fn with_cancellation(mut self, token: &'a CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub(crate) fn start(self) -> Backoff<'a> {
        Backoff {
            delay: self.initial_delay,
            attempt: 1,
            config: self,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BackoffStep {
    Retry,
    Exhausted,
    Cancelled,
}

/// Running state of one retry loop. The caller makes an attempt, and on a
/// retryable failure awaits [`Backoff::pause`] to learn whether to go again.
pub(crate) struct Backoff<'a> {
    config: RetryBackoff<'a>,
    delay: Duration,
    attempt: usize,
}

impl Backoff<'_> {
    /// 1-based number of the attempt in flight.
    pub(crate) fn attempt(&self) -> usize {
        self.attempt
    }

    pub(crate) async fn pause(&mut self) -> BackoffStep {
        if self.attempt >= self.config.max_attempts {
            return BackoffStep::Exhausted;
        }

        if !sleep_with_cancellation(self.delay, self.config.cancellation).await {
            return BackoffStep::Cancelled;
        }

        self.delay = next_backoff(self.delay, self.config.max_delay);
        self.attempt += 1;
        BackoffStep::Retry
    }
}

async fn sleep_with_cancellation(delay: Duration, cancellation: Option<&CancellationToken>) -> bool {
    if let Some(token) = cancellation {
        if token.is_cancelled() {
            return false;
        }
    }

    if delay.is_zero() {
        yield_now().await;
        return true;
    }

    match cancellation {
        Some(token) => tokio::select! {
            _ = token.cancelled() => false,
            _ = sleep(delay) => true,
        },
        None => {
            sleep(delay).await;
            true
        }
    }
}

fn next_backoff(current: Duration, max_backoff: Duration) -> Duration {
    if current.is_zero() {
        return max_backoff.min(Duration::from_millis(1));
    }

    current.saturating_mul(2).min(max_backoff)
}
