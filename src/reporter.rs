use std::sync::Arc;

use tokio::{
    spawn,
    sync::mpsc::{Sender, channel, error::TrySendError},
    task::JoinHandle,
};
use tracing::{error, instrument, warn};

use crate::error::{DrmError, ErrorEvent};

/// Observer receiving the message of every failure raised off the caller's
/// call stack.
pub type ErrorObserver = Arc<dyn Fn(&str) + Send + Sync>;

const PENDING_REPORTS: usize = 32;

/// Delivers background failures to the registered observer from a dedicated
/// task, so the observer never runs while runtime locks are held.
#[derive(Debug)]
pub(crate) struct ErrorReporter {
    sender: Sender<String>,
    dispatcher: JoinHandle<()>,
}

impl ErrorReporter {
    #[instrument(skip(observer))]
    pub(crate) fn spawn(observer: ErrorObserver) -> Self {
        let (sender, mut receiver) = channel::<String>(PENDING_REPORTS);

        let dispatcher = spawn(async move {
            while let Some(message) = receiver.recv().await {
                observer(&message);
            }
        });

        Self { sender, dispatcher }
    }

    /// Queues one notification. Delivery is not retried.
    pub(crate) fn report(&self, err: &DrmError) {
        if matches!(err, DrmError::Exit) {
            return;
        }

        let event = ErrorEvent::from_error(err);
        error!(code = event.code, "{}", event.message);
        self.send(event.message);
    }

    pub(crate) fn send(&self, message: String) {
        match self.sender.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(message)) => {
                warn!("Asynchronous error queue is full, dropping report: {message}");
            }
            Err(TrySendError::Closed(message)) => {
                warn!("Asynchronous error dispatcher stopped, dropping report: {message}");
            }
        }
    }
}

impl Drop for ErrorReporter {
    fn drop(&mut self) {
        // Pending messages are still drained: the dispatcher only exits once
        // the channel closes, which happens when `sender` drops right after.
        if self.dispatcher.is_finished() {
            warn!("Asynchronous error dispatcher exited before the runtime");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    fn recording() -> (Arc<Mutex<Vec<String>>>, ErrorObserver) {
        let messages = Arc::new(Mutex::new(Vec::new()));
        let sink = messages.clone();
        let observer: ErrorObserver = Arc::new(move |message: &str| {
            sink.lock().unwrap().push(message.to_owned());
        });
        (messages, observer)
    }

    #[tokio::test]
    async fn delivers_each_failure_once() {
        let (messages, observer) = recording();
        let reporter = ErrorReporter::spawn(observer);

        reporter.report(&DrmError::RequestDenied {
            status: 400,
            details: "Entitlement Limit Reached".to_owned(),
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let messages = messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(crate::error::error_code(&messages[0]), Some(10002));
    }

    #[tokio::test]
    async fn exit_is_never_reported() {
        let (messages, observer) = recording();
        let reporter = ErrorReporter::spawn(observer);

        reporter.report(&DrmError::Exit);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(messages.lock().unwrap().is_empty());
    }
}
