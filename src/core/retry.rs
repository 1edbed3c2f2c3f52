//! Retry and pacing primitives shared by the geocoding and routing clients
//!
//! Both upstream services are public fair-use endpoints: calls must be spaced
//! out ([`Pacer`]) and transient failures retried with backoff ([`RetryPolicy`]).

use std::time::Duration;

use log::warn;
use tokio::time::Instant;

use crate::core::error::{Error, Result};

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// base × attempt
    Linear,
    /// base × 2^(attempt - 1)
    Exponential,
}

/// Bounded retry policy for a single logical request
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay unit fed to the backoff function
    pub base_delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn linear(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff: Backoff::Linear,
        }
    }

    /// Delay to wait after the given failed attempt (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Linear => self.base_delay * attempt,
            Backoff::Exponential => self.base_delay * (1u32 << attempt.saturating_sub(1).min(16)),
        }
    }

    /// Run `operation` until it succeeds, fails with a non-transient error,
    /// or the attempt budget is spent. The last error is returned.
    pub async fn run<F, Fut, T>(&self, what: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.run_with(None, what, operation).await
    }

    /// Like [`RetryPolicy::run`], but every attempt, retries included,
    /// first waits for `pacer`.
    pub async fn run_paced<F, Fut, T>(&self, pacer: &mut Pacer, what: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.run_with(Some(pacer), what, operation).await
    }

    async fn run_with<F, Fut, T>(&self, mut pacer: Option<&mut Pacer>, what: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            if let Some(pacer) = pacer.as_deref_mut() {
                pacer.wait().await;
            }
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.delay_after(attempt);
                    warn!("⚠️  {what} failed (attempt {attempt}/{max_attempts}): {e}. Retrying in {delay:?}...");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Enforces a minimum spacing between the starts of consecutive calls
#[derive(Debug)]
pub struct Pacer {
    min_interval: Duration,
    last_call: Option<Instant>,
}

impl Pacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: None,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until the next call is allowed, then mark it as started
    pub async fn wait(&mut self) {
        if let Some(last) = self.last_call {
            let ready_at = last + self.min_interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        self.last_call = Some(Instant::now());
    }
}

/// Map a non-success HTTP status to the matching error class
pub(crate) fn status_error(service: &str, status: reqwest::StatusCode) -> Error {
    if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        Error::HttpError(format!("{service} returned {status}"))
    } else {
        Error::RequestRejected(format!("{service} returned {status}"))
    }
}
