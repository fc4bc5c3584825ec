//! Scripted in-memory remote used by unit tests.

use crate::remote::client::{
    CompressionMode, RemoteConnector, RemoteError, RemoteSequenceClient, SequenceRange,
};
use chrono::{DateTime, TimeZone, Utc};
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) type DateFn = Arc<dyn Fn(u64) -> Option<DateTime<Utc>> + Send + Sync>;

const BASE_EPOCH_SECS: i64 = 1_600_000_000;

#[derive(Debug, Default)]
pub(crate) struct CallLog {
    pub selects: usize,
    pub date_calls: usize,
    pub reconnects: usize,
    pub closes: usize,
    pub probed: Vec<u64>,
}

pub(crate) struct ScriptedClient {
    range: SequenceRange,
    dates: DateFn,
    unknown_feeds: Vec<String>,
    date_failures: Mutex<VecDeque<RemoteError>>,
    reconnect_failures: Mutex<VecDeque<RemoteError>>,
    date_latency: Duration,
    log: Arc<Mutex<CallLog>>,
}

impl ScriptedClient {
    pub(crate) fn new(range: SequenceRange) -> Self {
        Self {
            range,
            dates: Arc::new(|sequence| Some(Self::date_for(sequence))),
            unknown_feeds: Vec::new(),
            date_failures: Mutex::new(VecDeque::new()),
            reconnect_failures: Mutex::new(VecDeque::new()),
            date_latency: Duration::ZERO,
            log: Arc::new(Mutex::new(CallLog::default())),
        }
    }

    /// One message per minute starting at a fixed epoch.
    pub(crate) fn date_for(sequence: u64) -> DateTime<Utc> {
        Utc.timestamp_opt(BASE_EPOCH_SECS + sequence as i64 * 60, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    pub(crate) fn with_dates(mut self, dates: DateFn) -> Self {
        self.dates = dates;
        self
    }

    pub(crate) fn with_unknown_feed(mut self, feed: &str) -> Self {
        self.unknown_feeds.push(feed.to_owned());
        self
    }

    pub(crate) fn with_date_latency(mut self, latency: Duration) -> Self {
        self.date_latency = latency;
        self
    }

    pub(crate) fn push_date_failure(&self, err: RemoteError) {
        self.date_failures.lock().unwrap().push_back(err);
    }

    pub(crate) fn fail_next_reconnect(&self, err: RemoteError) {
        self.reconnect_failures.lock().unwrap().push_back(err);
    }

    pub(crate) fn log(&self) -> Arc<Mutex<CallLog>> {
        self.log.clone()
    }
}

impl RemoteSequenceClient for ScriptedClient {
    fn select_feed<'a>(
        &'a mut self,
        name: &'a str,
    ) -> BoxFuture<'a, Result<SequenceRange, RemoteError>> {
        Box::pin(async move {
            self.log.lock().unwrap().selects += 1;
            if self.unknown_feeds.iter().any(|feed| feed == name) {
                return Err(RemoteError::UnknownFeed {
                    feed: name.to_owned(),
                });
            }
            Ok(self.range)
        })
    }

    fn fetch_date(&mut self, sequence: u64) -> BoxFuture<'_, Result<DateTime<Utc>, RemoteError>> {
        Box::pin(async move {
            {
                let mut log = self.log.lock().unwrap();
                log.date_calls += 1;
                log.probed.push(sequence);
            }
            if !self.date_latency.is_zero() {
                tokio::time::sleep(self.date_latency).await;
            }
            if let Some(err) = self.date_failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            (self.dates)(sequence).ok_or(RemoteError::DateUnavailable { sequence })
        })
    }

    fn reconnect(&mut self, _mode: CompressionMode) -> BoxFuture<'_, Result<(), RemoteError>> {
        Box::pin(async move {
            self.log.lock().unwrap().reconnects += 1;
            match self.reconnect_failures.lock().unwrap().pop_front() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), RemoteError>> {
        Box::pin(async move {
            self.log.lock().unwrap().closes += 1;
            Ok(())
        })
    }
}

pub(crate) struct ScriptedConnector {
    range: SequenceRange,
    dates: Option<DateFn>,
    fail_on: Option<usize>,
    attempts: AtomicUsize,
    modes: Arc<Mutex<Vec<CompressionMode>>>,
    log: Arc<Mutex<CallLog>>,
}

impl ScriptedConnector {
    pub(crate) fn new(range: SequenceRange) -> Self {
        Self {
            range,
            dates: None,
            fail_on: None,
            attempts: AtomicUsize::new(0),
            modes: Arc::new(Mutex::new(Vec::new())),
            log: Arc::new(Mutex::new(CallLog::default())),
        }
    }

    pub(crate) fn with_dates(mut self, dates: DateFn) -> Self {
        self.dates = Some(dates);
        self
    }

    /// Fails the `attempt`-th connect (1-based).
    pub(crate) fn failing_on(mut self, attempt: usize) -> Self {
        self.fail_on = Some(attempt);
        self
    }

    pub(crate) fn modes(&self) -> Arc<Mutex<Vec<CompressionMode>>> {
        self.modes.clone()
    }

    /// Call log shared by every client this connector hands out.
    pub(crate) fn log(&self) -> Arc<Mutex<CallLog>> {
        self.log.clone()
    }
}

impl RemoteConnector for ScriptedConnector {
    fn connect(
        &self,
        mode: CompressionMode,
    ) -> BoxFuture<'_, Result<Box<dyn RemoteSequenceClient>, RemoteError>> {
        Box::pin(async move {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on == Some(attempt) {
                return Err(RemoteError::Connect {
                    detail: format!("scripted failure on connect {attempt}"),
                });
            }
            self.modes.lock().unwrap().push(mode);
            let mut client = ScriptedClient::new(self.range);
            client.log = self.log.clone();
            if let Some(dates) = &self.dates {
                client = client.with_dates(dates.clone());
            }
            Ok(Box::new(client) as Box<dyn RemoteSequenceClient>)
        })
    }
}
