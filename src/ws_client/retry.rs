use std::future::Future;

use http::StatusCode;
use tokio::{
    select,
    sync::watch,
    time::{Duration, Instant, sleep},
};
use tracing::{debug, warn};

use crate::{
    config::RetryPolicy,
    error::{DrmError, Result, WsOperation},
};

/// Outcome of a single failed attempt.
#[derive(Debug)]
pub(crate) enum AttemptError {
    /// Transient failure; the cycle may try again.
    Retryable(String),
    /// Failure that ends the cycle immediately.
    Fatal(DrmError),
}

/// Status codes worth another attempt. 470 is the licensing server's
/// "no floating license available right now".
pub(crate) fn is_retryable(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 429 | 470) || status.is_server_error()
}

/// Stop request observed by retry sleeps of background request cycles.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Option<watch::Receiver<bool>>);

impl StopSignal {
    /// A signal that never fires, for foreground calls.
    pub fn never() -> Self {
        Self(None)
    }

    pub(crate) fn new(receiver: watch::Receiver<bool>) -> Self {
        Self(Some(receiver))
    }

    pub fn is_stopped(&self) -> bool {
        self.0.as_ref().is_some_and(|receiver| *receiver.borrow())
    }

    /// Sleeps for `duration` unless stop is requested first, in which case
    /// `DrmError::Exit` is returned. A dropped sender counts as a stop.
    pub async fn sleep(&mut self, duration: Duration) -> Result<()> {
        let Some(receiver) = &mut self.0 else {
            sleep(duration).await;
            return Ok(());
        };

        select! {
            () = sleep(duration) => Ok(()),
            _ = receiver.wait_for(|stopped| *stopped) => {
                debug!("Stop requested during retry wait");
                Err(DrmError::Exit)
            },
        }
    }
}

/// Runs `attempt` until it succeeds, fails fatally, or the cycle runs out of
/// attempts or time.
pub(crate) async fn with_retries<T, F, Fut>(
    operation: WsOperation,
    policy: &RetryPolicy,
    deadline: Instant,
    mut stop: StopSignal,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, AttemptError>>,
{
    let mut attempts = 0u32;

    loop {
        if stop.is_stopped() {
            return Err(DrmError::Exit);
        }

        attempts += 1;

        let failure = match attempt(attempts).await {
            Ok(value) => return Ok(value),
            Err(AttemptError::Fatal(err)) => return Err(err),
            Err(AttemptError::Retryable(failure)) => failure,
        };

        if policy.period_short.is_zero() {
            return Err(DrmError::Transport { message: failure });
        }

        let now = Instant::now();
        if attempts >= policy.max_attempts || now >= deadline {
            return Err(DrmError::TransportTimeout {
                operation,
                attempts,
                last_failure: failure,
            });
        }

        let wait = policy.backoff(attempts).min(deadline - now);
        warn!(
            attempt = attempts,
            "Attempt #{attempts} of {operation} request failed with message: {failure}. New attempt planned in {:.1} seconds",
            wait.as_secs_f64()
        );

        stop.sleep(wait).await?;
    }
}
