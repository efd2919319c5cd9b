//! Fixed-schedule retry for transient failures.
//!
//! The default schedule retries after 1s, 3s and 5s, so an operation runs at
//! most four times before its last error is surfaced. The policy is a plain
//! value passed to whoever needs it; tests substitute a zero-delay schedule.

use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// Retry schedule: one extra attempt per delay.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(5),
            ],
        }
    }
}

impl RetryPolicy {
    /// A policy with explicit delays.
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// A single-attempt policy (no retries).
    pub fn none() -> Self {
        Self { delays: Vec::new() }
    }

    /// A policy retrying `retries` times without sleeping. For tests.
    pub fn immediate(retries: usize) -> Self {
        Self { delays: vec![Duration::ZERO; retries] }
    }

    /// Maximum number of attempts this policy allows.
    pub fn max_attempts(&self) -> usize {
        self.delays.len() + 1
    }

    /// Run `op`, retrying per the schedule. Returns the first success or the
    /// last error. Cancellation happens by dropping the returned future; the
    /// sleeps between attempts are ordinary await points.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        for delay in &self.delays {
            tokio::time::sleep(*delay).await;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => last = err,
            }
        }

        Err(last)
    }
}
