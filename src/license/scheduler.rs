use std::sync::Arc;

use tokio::{
    select,
    sync::watch,
    task::JoinHandle,
    time::{Duration, Instant, sleep_until, timeout},
};
use tracing::{debug, info, warn};

use super::{
    Shared,
    state::{LicenseState, Session},
};
use crate::{
    error::{DrmError, Result},
    ws_client::{LicenseToken, StopSignal},
};

/// Background task renewing the license of the current session.
#[derive(Debug)]
pub(super) struct Scheduler {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Scheduler {
    pub(super) fn spawn(shared: Arc<Shared>) -> Self {
        let (stop, receiver) = watch::channel(false);
        let task = tokio::spawn(run(shared, receiver));
        Self { stop, task }
    }

    pub(super) fn request_stop(&self) {
        self.stop.send_replace(true);
    }

    /// Stops the task. Retry waits end at once, but a renewal attempt already
    /// on the wire is let complete so that its outcome is applied. Past
    /// `grace` the wait is logged; it stays bounded by the attempt timeout.
    pub(super) async fn shutdown(self, grace: Duration) {
        let Self { stop, mut task } = self;
        stop.send_replace(true);

        let outcome = match timeout(grace, &mut task).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(
                    grace_secs = grace.as_secs_f64(),
                    "Renewal request still in flight, waiting for it to complete"
                );
                task.await
            }
        };

        match outcome {
            Ok(()) => debug!("Renewal scheduler stopped"),
            Err(err) => warn!("Renewal scheduler terminated abnormally: {err}"),
        }
    }
}

/// Progress carried from one tick to the next.
#[derive(Debug, Default)]
struct TickProgress {
    /// Earliest retry of a renewal that failed on transport.
    next_retry_at: Option<Instant>,
    sampling_failed: bool,
}

async fn run(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    let tick = shared.timing.tick;
    let mut progress = TickProgress::default();
    let mut deadline = Instant::now() + tick;

    debug!(tick_secs = tick.as_secs_f64(), "Renewal scheduler started");

    while tick_trigger(&mut stop, deadline).await {
        on_tick(&shared, StopSignal::new(stop.clone()), &mut progress).await;
        deadline = Instant::now() + tick;
    }
}

async fn tick_trigger(stop: &mut watch::Receiver<bool>, deadline: Instant) -> bool {
    let slept = select! {
        () = sleep_until(deadline) => true,
        _ = stop.wait_for(|stopped| *stopped) => false,
    };
    slept && !*stop.borrow()
}

async fn on_tick(shared: &Shared, stop: StopSignal, progress: &mut TickProgress) {
    match shared.metering.sample().await {
        Ok(_) => progress.sampling_failed = false,
        Err(err) => {
            if progress.sampling_failed {
                warn!("Metering sample failed again: {err}");
            } else {
                shared.reporter.report(&err);
            }
            progress.sampling_failed = true;
        }
    }

    let Some(session) = begin_renewal(shared, progress).await else {
        return;
    };

    let policy = shared.retry_policy().await;
    let cycle = Duration::from_secs(u64::from(session.token.license_duration()))
        .max(policy.request_timeout);
    let result = shared
        .renew(&session, &policy, Instant::now() + cycle, stop)
        .await;

    finish_renewal(shared, session, result, policy.period_long, progress).await;
}

/// Moves a session due for renewal to `Renewing`.
async fn begin_renewal(shared: &Shared, progress: &TickProgress) -> Option<Session> {
    let mut state = shared.state.lock().await;

    let session = match &*state {
        LicenseState::Active(session) => {
            let remaining = session.token.remaining_at(chrono::Utc::now())?;
            let threshold = chrono::Duration::from_std(shared.timing.renewal_threshold)
                .unwrap_or(chrono::Duration::MAX);
            if remaining > threshold {
                return None;
            }
            debug!(
                session_id = %session.id,
                remaining_ms = remaining.num_milliseconds(),
                "License close to expiry, renewing"
            );
            session.clone()
        }
        LicenseState::Error(Some(session)) => {
            if progress
                .next_retry_at
                .is_some_and(|retry_at| Instant::now() < retry_at)
            {
                return None;
            }
            debug!(session_id = %session.id, "Retrying renewal of failed session");
            session.clone()
        }
        _ => return None,
    };

    state.transition(LicenseState::Renewing(session.clone()));
    Some(session)
}

async fn finish_renewal(
    shared: &Shared,
    session: Session,
    result: Result<LicenseToken>,
    retry_period: Duration,
    progress: &mut TickProgress,
) {
    let mut state = shared.state.lock().await;

    if !matches!(&*state, LicenseState::Renewing(current) if current.id == session.id) {
        debug!(
            session_id = %session.id,
            "Session changed during renewal, discarding outcome"
        );
        return;
    }

    let failure = match result {
        Ok(token) => {
            let recovered = progress.next_retry_at.take().is_some();
            state.transition(LicenseState::Active(Session { token, ..session }));
            drop(state);

            if recovered {
                info!("License renewal recovered");
                shared.metering.try_set_enabled(true).await;
            }
            return;
        }
        Err(DrmError::Exit) => {
            debug!("Renewal interrupted by stop request");
            return;
        }
        Err(err) => err,
    };

    let repeated = progress.next_retry_at.is_some();
    if failure.is_denial() {
        progress.next_retry_at = None;
        state.transition(LicenseState::Locked(Some(session)));
    } else {
        progress.next_retry_at = Some(Instant::now() + retry_period);
        state.transition(LicenseState::Error(Some(session)));
    }
    drop(state);

    shared.metering.try_set_enabled(false).await;

    if repeated && !failure.is_denial() {
        warn!("License renewal failed again: {failure}");
    } else {
        shared.reporter.report(&failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tick_fires_until_stop_is_requested() {
        let (stop, mut receiver) = watch::channel(false);

        assert!(tick_trigger(&mut receiver, Instant::now() + Duration::from_millis(10)).await);

        let waiting = tokio::spawn(async move {
            let fired = tick_trigger(&mut receiver, Instant::now() + Duration::from_secs(30)).await;
            (fired, receiver)
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.send_replace(true);

        let (fired, mut receiver) = timeout(Duration::from_secs(1), waiting)
            .await
            .expect("stop must interrupt the tick wait")
            .unwrap();
        assert!(!fired);

        // An elapsed deadline does not fire once stopped.
        assert!(!tick_trigger(&mut receiver, Instant::now()).await);
    }
}
