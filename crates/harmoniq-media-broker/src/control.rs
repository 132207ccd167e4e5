use std::sync::Arc;

use crossbeam_channel::bounded;
use parking_lot::Mutex;

use crate::error::{BrokerError, Result};
use crate::worker::{WorkerDispatcher, WorkerThread};

/// Designated thread that owns construction of process-wide state.
///
/// Callers on other threads hand work over with [`ControlThread::run_sync`]
/// and block until it has run; calls made on the control thread run inline so
/// the thread never waits on itself.
#[derive(Debug, Clone)]
pub struct ControlThread {
    inner: Arc<ControlInner>,
}

#[derive(Debug)]
struct ControlInner {
    dispatcher: WorkerDispatcher,
    thread: Mutex<Option<WorkerThread>>,
}

impl ControlThread {
    pub fn spawn(name: &str) -> Result<Self> {
        let thread = WorkerThread::spawn(name)?;
        Ok(Self {
            inner: Arc::new(ControlInner {
                dispatcher: thread.dispatcher().clone(),
                thread: Mutex::new(Some(thread)),
            }),
        })
    }

    pub fn is_current(&self) -> bool {
        self.inner.dispatcher.is_current()
    }

    /// Runs `task` on the control thread and waits for its result.
    pub fn run_sync<F, R>(&self, task: F) -> Result<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.is_current() {
            return Ok(task());
        }
        let (tx, rx) = bounded(1);
        self.inner.dispatcher.dispatch(move || {
            let _ = tx.send(task());
        })?;
        rx.recv().map_err(|_| {
            BrokerError::not_available("control thread stopped before finishing the request")
        })
    }

    /// Stops the control thread once its queue drains. Later `run_sync` calls
    /// fail with [`BrokerError::NotAvailable`].
    pub fn stop(&self) {
        let thread = self.inner.thread.lock().take();
        if let Some(thread) = thread {
            thread.shutdown();
        }
    }
}

impl Drop for ControlInner {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.get_mut().take() {
            thread.shutdown();
        }
    }
}
