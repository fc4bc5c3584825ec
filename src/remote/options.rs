//! Knobs for connection slots: per-call deadline and the rate-limit delay
//! placed in front of date probes.

use anyhow::{bail, Result};
use std::time::Duration;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Deadline applied to every remote call, connect and reconnect included.
    pub request_timeout: Duration,
    /// Pause before each date probe on the control slot. Zero disables it.
    pub probe_delay: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            probe_delay: Duration::ZERO,
        }
    }
}

impl ConnectionOptions {
    /// Scales a base probe delay by the number of processes sharing the remote.
    pub fn probe_delay_for(base: Duration, concurrency: usize) -> Duration {
        let factor = u32::try_from(concurrency).unwrap_or(u32::MAX);
        base.saturating_mul(factor)
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_timeout.is_zero() {
            bail!("request_timeout must be greater than 0");
        }
        Ok(())
    }
}
