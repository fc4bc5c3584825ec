//! Retry context, logging helpers, and canned message templates used by the
//! connection slots so recovery is reported the same way for every operation.

use crate::remote::client::{CompressionMode, RemoteError};

macro_rules! log_with_retry_ctx {
    ($level:ident, $ctx:expr, $($rest:tt)*) => {{
        if let Some(sequence) = $ctx.sequence {
            tracing::$level!(
                feed = $ctx.feed,
                mode = %$ctx.mode,
                sequence,
                $($rest)*
            );
        } else {
            tracing::$level!(feed = $ctx.feed, mode = %$ctx.mode, $($rest)*);
        }
    }};
}

/// Logging labels describing how one remote operation reports its recovery.
#[derive(Clone, Copy)]
pub(crate) struct RetryMessages {
    pub(crate) retry: &'static str,
    pub(crate) exhausted: &'static str,
    pub(crate) terminal: &'static str,
    pub(crate) reconnect_failed: &'static str,
}

/// Feed and sequence metadata attached to every recovery log line.
#[derive(Clone, Copy)]
pub(crate) struct RetryContext<'a> {
    feed: &'a str,
    sequence: Option<u64>,
    mode: CompressionMode,
    messages: &'a RetryMessages,
}

impl<'a> RetryContext<'a> {
    pub(crate) fn new(messages: &'a RetryMessages, feed: &'a str, mode: CompressionMode) -> Self {
        Self {
            feed,
            sequence: None,
            mode,
            messages,
        }
    }

    pub(crate) fn with_sequence(
        messages: &'a RetryMessages,
        feed: &'a str,
        mode: CompressionMode,
        sequence: u64,
    ) -> Self {
        Self {
            feed,
            sequence: Some(sequence),
            mode,
            messages,
        }
    }

    pub(crate) fn log_retry(&self, attempt: usize, err: &RemoteError) {
        log_with_retry_ctx!(warn, self, attempt, error = %err, "{}", self.messages.retry);
    }

    pub(crate) fn log_exhausted(&self, attempt: usize, err: &RemoteError) {
        log_with_retry_ctx!(error, self, attempt, error = %err, "{}", self.messages.exhausted);
    }

    pub(crate) fn log_terminal(&self, attempt: usize, err: &RemoteError) {
        log_with_retry_ctx!(debug, self, attempt, error = %err, kind = ?err.kind(), "{}", self.messages.terminal);
    }

    pub(crate) fn log_reconnect_failed(&self, err: &RemoteError) {
        log_with_retry_ctx!(error, self, error = %err, "{}", self.messages.reconnect_failed);
    }
}

pub(crate) const SELECT_FEED_RETRY: RetryMessages = RetryMessages {
    retry: "feed selection failed; reconnecting and retrying once",
    exhausted: "feed selection failed after reconnect",
    terminal: "feed selection rejected; not retrying",
    reconnect_failed: "reconnect before feed selection retry failed",
};

pub(crate) const FETCH_DATE_RETRY: RetryMessages = RetryMessages {
    retry: "date probe failed; reconnecting and retrying once",
    exhausted: "date probe failed after reconnect",
    terminal: "date probe returned a non-retryable error",
    reconnect_failed: "reconnect before date probe retry failed",
};
