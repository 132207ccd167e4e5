use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::error::{BrokerError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum WorkerMessage {
    Run(Job),
    Shutdown,
}

/// Cloneable handle used to queue work onto a [`WorkerThread`].
///
/// Dispatching fails with [`BrokerError::NotAvailable`] once the thread has
/// stopped. A rejected job is dropped on the calling thread.
#[derive(Clone)]
pub struct WorkerDispatcher {
    sender: Sender<WorkerMessage>,
    thread_id: ThreadId,
    name: Arc<str>,
}

impl WorkerDispatcher {
    pub fn dispatch<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender
            .send(WorkerMessage::Run(Box::new(job)))
            .map_err(|_| BrokerError::not_available(format!("{} has shut down", self.name)))
    }

    /// Returns `true` when called from the worker thread itself.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for WorkerDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerDispatcher")
            .field("name", &self.name)
            .field("thread_id", &self.thread_id)
            .finish()
    }
}

/// Named thread draining a FIFO job queue.
#[derive(Debug)]
pub struct WorkerThread {
    dispatcher: WorkerDispatcher,
    handle: JoinHandle<()>,
}

impl WorkerThread {
    pub fn spawn(name: &str) -> Result<Self> {
        let (tx, rx) = unbounded();
        let thread_name: Arc<str> = Arc::from(name);
        let loop_name = Arc::clone(&thread_name);
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || worker_loop(&loop_name, rx))
            .map_err(|err| BrokerError::WorkerSpawn {
                name: name.to_owned(),
                reason: err.to_string(),
            })?;
        let dispatcher = WorkerDispatcher {
            sender: tx,
            thread_id: handle.thread().id(),
            name: thread_name,
        };
        debug!(thread = name, "worker thread started");
        Ok(Self { dispatcher, handle })
    }

    pub fn dispatcher(&self) -> &WorkerDispatcher {
        &self.dispatcher
    }

    /// Stops the thread after every job queued so far has run.
    ///
    /// Blocks until the thread exits, unless called from the worker itself, in
    /// which case the thread finishes on its own once the current job returns.
    pub fn shutdown(self) {
        let name = self.dispatcher.name.clone();
        let _ = self.dispatcher.sender.send(WorkerMessage::Shutdown);
        if self.dispatcher.is_current() {
            warn!(thread = %name, "worker shutdown requested from its own thread; not joining");
            return;
        }
        if self.handle.join().is_err() {
            warn!(thread = %name, "worker thread panicked");
        }
        debug!(thread = %name, "worker thread stopped");
    }
}

fn worker_loop(name: &str, receiver: Receiver<WorkerMessage>) {
    while let Ok(message) = receiver.recv() {
        match message {
            WorkerMessage::Run(job) => run_job(name, job),
            WorkerMessage::Shutdown => break,
        }
    }
    // Jobs queued behind the shutdown marker still run.
    while let Ok(message) = receiver.try_recv() {
        if let WorkerMessage::Run(job) = message {
            run_job(name, job);
        }
    }
}

/// Runs one job. A panicking job is logged and the thread keeps serving the
/// queue.
fn run_job(name: &str, job: Job) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        warn!(thread = name, "worker job panicked");
    }
}
