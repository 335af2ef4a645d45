//! Bounded polling.
//!
//! Every wait in the operator is a [`poll`]: check a predicate, sleep the
//! interval, and give up with [`Error::Timeout`] once the budget is spent.
//! Errors from the predicate abort the poll immediately.

use std::future::Future;

use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::config::PollSettings;
use crate::error::{Error, Result};

/// Poll `check` until it returns `Ok(true)`.
///
/// The first check runs immediately. A check is never started after the
/// timeout has elapsed.
pub async fn poll<F, Fut>(what: &str, settings: PollSettings, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + settings.timeout;
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        if check().await? {
            return Ok(());
        }

        debug!(what = %what, attempt = attempt, "Condition not met yet");

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::Timeout(what.to_string()));
        }
        sleep(settings.interval.min(deadline - now)).await;
    }
}

/// Run `op` up to `attempts` times, sleeping `interval` between failures.
/// The last error is returned when every attempt fails.
pub async fn retry<T, F, Fut>(attempts: u32, interval: std::time::Duration, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                debug!(attempt = attempt, error = %e, "Attempt failed, retrying");
                sleep(interval).await;
            }
            Err(e) => return Err(e),
        }
    }
}
