use crate::backfill::locator::{
    LocatorOptions, DEFAULT_DATE_RETRIES, DEFAULT_DATE_RETRY_DELAY, DEFAULT_MAX_ITERATIONS,
};
use crate::remote::{CompressionMode, ConnectionOptions, NntpSettings};
use crate::runtime::telemetry;
use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use std::env;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_PORT: u16 = 119;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_SAFETY_MARGIN: u64 = 50_000;
const DEFAULT_CHUNK_SIZE: u64 = 20_000;
const DEFAULT_CONCURRENCY: usize = 1;
const DEFAULT_SAFE_BACKFILL_DATE: (i32, u32, u32) = (2012, 6, 24);

const ENV_PREFIX: &str = "BACKFILL_";

/// Runtime configuration for a backfill run.
///
/// All instances must be constructed via [`BackfillConfig::builder`] or [`BackfillConfig::new`]
/// so invariants are validated before any consumer observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillConfig {
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    request_timeout: Duration,
    safety_margin: u64,
    chunk_size: u64,
    date_retries: usize,
    date_retry_delay: Duration,
    max_locate_iterations: u32,
    probe_delay: Duration,
    concurrency: usize,
    compressed_headers: bool,
    allow_count_fallback: bool,
    safe_backfill_date: NaiveDate,
    metrics_interval: Duration,
}

pub struct BackfillConfigParams {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub request_timeout: Duration,
    pub safety_margin: u64,
    pub chunk_size: u64,
    pub date_retries: usize,
    pub date_retry_delay: Duration,
    pub max_locate_iterations: u32,
    pub probe_delay: Duration,
    pub concurrency: usize,
    pub compressed_headers: bool,
    pub allow_count_fallback: bool,
    pub safe_backfill_date: NaiveDate,
    pub metrics_interval: Duration,
}

impl BackfillConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> BackfillConfigBuilder {
        BackfillConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    pub fn new(params: BackfillConfigParams) -> Result<Self> {
        let BackfillConfigParams {
            host,
            port,
            username,
            password,
            request_timeout,
            safety_margin,
            chunk_size,
            date_retries,
            date_retry_delay,
            max_locate_iterations,
            probe_delay,
            concurrency,
            compressed_headers,
            allow_count_fallback,
            safe_backfill_date,
            metrics_interval,
        } = params;

        let config = Self {
            host: host.trim().to_owned(),
            port,
            username: non_empty(username),
            password: non_empty(password),
            request_timeout,
            safety_margin,
            chunk_size,
            date_retries,
            date_retry_delay,
            max_locate_iterations,
            probe_delay,
            concurrency,
            compressed_headers,
            allow_count_fallback,
            safe_backfill_date,
            metrics_interval,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reads `BACKFILL_*` environment variables on top of the defaults.
    ///
    /// `BACKFILL_HOST` is required; every other variable is optional.
    pub fn from_env() -> Result<Self> {
        let mut builder = Self::builder().host(read_env("HOST")?.context("BACKFILL_HOST is required")?);

        if let Some(port) = parse_env::<u16>("PORT")? {
            builder = builder.port(port);
        }
        if let Some(user) = read_env("USER")? {
            builder = builder.username(user);
        }
        if let Some(password) = read_env("PASSWORD")? {
            builder = builder.password(password);
        }
        if let Some(secs) = parse_env::<u64>("TIMEOUT_SECS")? {
            builder = builder.request_timeout(Duration::from_secs(secs));
        }
        if let Some(margin) = parse_env::<u64>("SAFETY_MARGIN")? {
            builder = builder.safety_margin(margin);
        }
        if let Some(chunk) = parse_env::<u64>("CHUNK_SIZE")? {
            builder = builder.chunk_size(chunk);
        }
        if let Some(retries) = parse_env::<usize>("DATE_RETRIES")? {
            builder = builder.date_retries(retries);
        }
        if let Some(millis) = parse_env::<u64>("DATE_RETRY_DELAY_MS")? {
            builder = builder.date_retry_delay(Duration::from_millis(millis));
        }
        if let Some(iterations) = parse_env::<u32>("MAX_LOCATE_ITERATIONS")? {
            builder = builder.max_locate_iterations(iterations);
        }
        if let Some(millis) = parse_env::<u64>("PROBE_DELAY_MS")? {
            builder = builder.probe_delay(Duration::from_millis(millis));
        }
        if let Some(concurrency) = parse_env::<usize>("CONCURRENCY")? {
            builder = builder.concurrency(concurrency);
        }
        if let Some(compressed) = parse_env_flag("COMPRESSED_HEADERS")? {
            builder = builder.compressed_headers(compressed);
        }
        if let Some(fallback) = parse_env_flag("COUNT_FALLBACK")? {
            builder = builder.allow_count_fallback(fallback);
        }
        if let Some(date) = parse_env::<NaiveDate>("SAFE_DATE")? {
            builder = builder.safe_backfill_date(date);
        }
        if let Some(secs) = parse_env::<u64>("METRICS_INTERVAL_SECS")? {
            builder = builder.metrics_interval(Duration::from_secs(secs));
        }

        builder.build()
    }

    /// News server host name.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Deadline applied to every remote call.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Messages above the remote's oldest that are never backfilled in days mode.
    pub fn safety_margin(&self) -> u64 {
        self.safety_margin
    }

    /// Default window width; feeds may override it.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Extra reads of an unavailable date before the fallback date is used.
    /// Zero means a single read.
    pub fn date_retries(&self) -> usize {
        self.date_retries
    }

    pub fn date_retry_delay(&self) -> Duration {
        self.date_retry_delay
    }

    pub fn max_locate_iterations(&self) -> u32 {
        self.max_locate_iterations
    }

    /// Base delay before each date probe, before scaling by concurrency.
    pub fn probe_delay(&self) -> Duration {
        self.probe_delay
    }

    /// Number of backfill processes sharing the remote.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn compressed_headers(&self) -> bool {
        self.compressed_headers
    }

    pub fn allow_count_fallback(&self) -> bool {
        self.allow_count_fallback
    }

    /// Oldest frontier date the safe selections still consider.
    pub fn safe_backfill_date(&self) -> NaiveDate {
        self.safe_backfill_date
    }

    /// Interval used by the telemetry reporter.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    pub fn bulk_mode(&self) -> CompressionMode {
        CompressionMode::from_flag(self.compressed_headers)
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            request_timeout: self.request_timeout,
            probe_delay: ConnectionOptions::probe_delay_for(self.probe_delay, self.concurrency),
        }
    }

    pub fn locator_options(&self) -> LocatorOptions {
        LocatorOptions {
            max_iterations: self.max_locate_iterations,
            date_retries: self.date_retries,
            date_retry_delay: self.date_retry_delay,
            allow_count_fallback: self.allow_count_fallback,
        }
    }

    pub fn nntp_settings(&self) -> NntpSettings {
        NntpSettings {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            bail!("host cannot be empty");
        }

        if self.port == 0 {
            bail!("port must be greater than 0");
        }

        if self.password.is_some() && self.username.is_none() {
            bail!("password is set but username is missing");
        }

        if self.request_timeout.is_zero() {
            bail!("request_timeout must be greater than 0");
        }

        if self.chunk_size == 0 {
            bail!("chunk_size must be greater than 0");
        }

        if self.max_locate_iterations == 0 {
            bail!("max_locate_iterations must be greater than 0");
        }

        if self.concurrency == 0 {
            bail!("concurrency must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        self.connection_options().validate()
    }
}

#[derive(Debug, Default, Clone)]
pub struct BackfillConfigBuilder {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    request_timeout: Option<Duration>,
    safety_margin: Option<u64>,
    chunk_size: Option<u64>,
    date_retries: Option<usize>,
    date_retry_delay: Option<Duration>,
    max_locate_iterations: Option<u32>,
    probe_delay: Option<Duration>,
    concurrency: Option<usize>,
    compressed_headers: Option<bool>,
    allow_count_fallback: Option<bool>,
    safe_backfill_date: Option<NaiveDate>,
    metrics_interval: Option<Duration>,
}

impl BackfillConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn safety_margin(mut self, margin: u64) -> Self {
        self.safety_margin = Some(margin);
        self
    }

    pub fn chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    pub fn date_retries(mut self, retries: usize) -> Self {
        self.date_retries = Some(retries);
        self
    }

    pub fn date_retry_delay(mut self, delay: Duration) -> Self {
        self.date_retry_delay = Some(delay);
        self
    }

    pub fn max_locate_iterations(mut self, iterations: u32) -> Self {
        self.max_locate_iterations = Some(iterations);
        self
    }

    pub fn probe_delay(mut self, delay: Duration) -> Self {
        self.probe_delay = Some(delay);
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn compressed_headers(mut self, compressed: bool) -> Self {
        self.compressed_headers = Some(compressed);
        self
    }

    pub fn allow_count_fallback(mut self, allow: bool) -> Self {
        self.allow_count_fallback = Some(allow);
        self
    }

    pub fn safe_backfill_date(mut self, date: NaiveDate) -> Self {
        self.safe_backfill_date = Some(date);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<BackfillConfig> {
        let params = BackfillConfigParams {
            host: self.host.context("host is required")?,
            port: self.port.unwrap_or(DEFAULT_PORT),
            username: self.username,
            password: self.password,
            request_timeout: self
                .request_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)),
            safety_margin: self.safety_margin.unwrap_or(DEFAULT_SAFETY_MARGIN),
            chunk_size: self.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
            date_retries: self.date_retries.unwrap_or(DEFAULT_DATE_RETRIES),
            date_retry_delay: self.date_retry_delay.unwrap_or(DEFAULT_DATE_RETRY_DELAY),
            max_locate_iterations: self
                .max_locate_iterations
                .unwrap_or(DEFAULT_MAX_ITERATIONS),
            probe_delay: self.probe_delay.unwrap_or(Duration::ZERO),
            concurrency: self.concurrency.unwrap_or(DEFAULT_CONCURRENCY),
            compressed_headers: self.compressed_headers.unwrap_or(true),
            allow_count_fallback: self.allow_count_fallback.unwrap_or(false),
            safe_backfill_date: match self.safe_backfill_date {
                Some(date) => date,
                None => default_safe_backfill_date()?,
            },
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
        };

        BackfillConfig::new(params)
    }
}

fn default_safe_backfill_date() -> Result<NaiveDate> {
    let (year, month, day) = DEFAULT_SAFE_BACKFILL_DATE;
    NaiveDate::from_ymd_opt(year, month, day).context("default safe backfill date is invalid")
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn read_env(suffix: &str) -> Result<Option<String>> {
    let key = format!("{ENV_PREFIX}{suffix}");
    match env::var(&key) {
        Ok(value) if !value.trim().is_empty() => Ok(Some(value)),
        Ok(_) | Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to read {key}")),
    }
}

fn parse_env<T>(suffix: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match read_env(suffix)? {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("failed to parse {ENV_PREFIX}{suffix}='{value}'")),
        None => Ok(None),
    }
}

fn parse_env_flag(suffix: &str) -> Result<Option<bool>> {
    match read_env(suffix)? {
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => bail!("failed to parse {ENV_PREFIX}{suffix}='{value}' as a flag"),
        },
        None => Ok(None),
    }
}
