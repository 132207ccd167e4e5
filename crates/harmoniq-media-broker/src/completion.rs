use std::fmt;

use crossbeam_channel::Receiver;
use tracing::debug;

use crate::error::{BrokerError, Result};

type Callback<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// One-shot continuation for an asynchronous request.
///
/// `resolve` consumes the completion, so it can only ever run once. A
/// completion that is dropped unresolved runs its callback with the
/// abandonment error instead, which means a request whose continuation is lost
/// (provider dropped the reply, worker stopped before the job ran) still
/// resolves.
pub struct Completion<T>
where
    T: Send + 'static,
{
    callback: Option<Callback<T>>,
    abandoned: BrokerError,
}

impl<T> Completion<T>
where
    T: Send + 'static,
{
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        Self {
            callback: Some(Box::new(callback)),
            abandoned: BrokerError::not_available("request abandoned before completion"),
        }
    }

    /// Creates a completion paired with a receiver that yields its result.
    pub fn channel() -> (Self, Receiver<Result<T>>) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let completion = Self::new(move |result| {
            let _ = tx.send(result);
        });
        (completion, rx)
    }

    /// Overrides the error reported when the completion is dropped unresolved.
    pub fn on_abandon(mut self, error: BrokerError) -> Self {
        self.abandoned = error;
        self
    }

    pub fn resolve(mut self, result: Result<T>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }

    pub fn succeed(self, value: T) {
        self.resolve(Ok(value));
    }

    pub fn fail(self, error: BrokerError) {
        self.resolve(Err(error));
    }
}

impl<T> Drop for Completion<T>
where
    T: Send + 'static,
{
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            debug!(error = %self.abandoned, "completion dropped unresolved");
            callback(Err(self.abandoned.clone()));
        }
    }
}

impl<T> fmt::Debug for Completion<T>
where
    T: Send + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("pending", &self.callback.is_some())
            .field("abandoned", &self.abandoned)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn resolve_runs_callback_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let completion = Completion::new(move |result: Result<u32>| {
            assert_eq!(result, Ok(7));
            counter.fetch_add(1, Ordering::SeqCst);
        });
        completion.succeed(7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_completion_reports_abandonment() {
        let (completion, rx) = Completion::<u32>::channel();
        drop(completion.on_abandon(BrokerError::provider_failure("lost")));
        assert_eq!(
            rx.try_recv().unwrap(),
            Err(BrokerError::provider_failure("lost"))
        );
        assert!(rx.try_recv().is_err());
    }
}
