//! Polling with selective retry.
//!
//! Only errors the caller classifies as retryable are retried. Any other
//! error ends the loop at once, and so does cancellation. There is no
//! attempt limit: the cancellation token bounds the loop.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Error, Debug)]
pub enum PollError<E: std::error::Error + 'static> {
    #[error("cancelled while polling (last error: {})", describe_last(.last))]
    Cancelled { last: Option<E> },

    #[error(transparent)]
    Fatal(E),
}

fn describe_last<E: std::fmt::Display>(last: &Option<E>) -> String {
    match last {
        Some(e) => e.to_string(),
        None => "none".to_string(),
    }
}

/// Calls `probe` until it succeeds, sleeping `interval` between attempts
/// that failed with an error `retryable` accepts.
///
/// Cancellation is checked before every probe, raced against the probe
/// itself and raced against the sleep.
pub async fn poll_until<T, E, F, Fut, R>(
    cancel: &CancellationToken,
    interval: Duration,
    mut probe: F,
    retryable: R,
) -> Result<T, PollError<E>>
where
    E: std::error::Error + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let mut last = None;
    let mut attempt: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled { last });
        }

        attempt += 1;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PollError::Cancelled { last }),
            outcome = probe() => outcome,
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if retryable(&e) => {
                debug!("Attempt {} failed, retrying in {:?}: {}", attempt, interval, e);
                last = Some(e);
            }
            Err(e) => return Err(PollError::Fatal(e)),
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PollError::Cancelled { last }),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
