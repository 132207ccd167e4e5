use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::capability::{
    CapabilityInstance, CapabilityKind, CapabilityTags, Decryptor, NodeId, PluginId, VideoDecoder,
    VideoEncoder,
};
use crate::completion::Completion;
use crate::config::BrokerConfig;
use crate::crash::{self, CrashEventSink, CrashHelper, CrashRegistry, CrashReport};
use crate::error::{BrokerError, Result};
use crate::provider::{
    ConnectionProvider, ConnectionRequest, PluginConnection, ProcessRole, SandboxSupport,
};
use crate::worker::{WorkerDispatcher, WorkerThread};

/// State shared between every thread that talks to the service.
#[derive(Debug, Default)]
struct SharedState {
    worker: Option<WorkerThread>,
    /// Thread the worker runs on. Survives `shutdown_worker` so jobs drained
    /// after the handle is detached still count as running on the worker.
    worker_thread: Option<ThreadId>,
    /// Flips once, from `false` to `true`, when the worker is torn down.
    worker_shutdown: bool,
    crash_helpers: CrashRegistry,
}

/// Broker handing out plugin hosted media capabilities.
///
/// Provider interaction and every acquisition continuation run on one
/// dedicated worker thread, created on first use. The shared lock is never
/// held while calling into the connection provider or the crash event sink.
pub struct MediaPluginService {
    config: BrokerConfig,
    role: ProcessRole,
    provider: Arc<dyn ConnectionProvider>,
    sandbox: Arc<dyn SandboxSupport>,
    events: Arc<dyn CrashEventSink>,
    shared: Arc<Mutex<SharedState>>,
    shutting_down_on_worker: AtomicBool,
}

impl MediaPluginService {
    pub fn new(
        config: BrokerConfig,
        role: ProcessRole,
        provider: Arc<dyn ConnectionProvider>,
        sandbox: Arc<dyn SandboxSupport>,
        events: Arc<dyn CrashEventSink>,
    ) -> Arc<Self> {
        info!(
            ?role,
            app_version = config.app_version.as_deref().unwrap_or("unknown"),
            build_id = config.build_id.as_deref().unwrap_or("unknown"),
            "media plugin service created"
        );
        Arc::new(Self {
            config,
            role,
            provider,
            sandbox,
            events,
            shared: Arc::new(Mutex::new(SharedState::default())),
            shutting_down_on_worker: AtomicBool::new(false),
        })
    }

    /// Starts the worker so providers begin bootstrapping straight away.
    pub fn init(&self) -> Result<()> {
        self.worker().map(|_| ())
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Returns the worker dispatcher, starting the worker thread on first use.
    ///
    /// Safe to call from any thread. The first successful call queues the
    /// provider bootstrap ahead of any other work. Fails with
    /// [`BrokerError::NotAvailable`] once [`shutdown_worker`] has run.
    ///
    /// [`shutdown_worker`]: MediaPluginService::shutdown_worker
    pub fn worker(&self) -> Result<WorkerDispatcher> {
        let mut shared = self.shared.lock();
        if let Some(worker) = &shared.worker {
            return Ok(worker.dispatcher().clone());
        }
        if shared.worker_shutdown {
            return Err(BrokerError::not_available(
                "worker thread creation refused after shutdown",
            ));
        }

        let worker = WorkerThread::spawn(&self.config.worker_thread_name)?;
        let dispatcher = worker.dispatcher().clone();
        let provider = Arc::clone(&self.provider);
        dispatcher.dispatch(move || provider.initialize())?;
        shared.worker_thread = Some(dispatcher.thread_id());
        shared.worker = Some(worker);
        info!(thread = dispatcher.name(), "media plugin worker started");
        Ok(dispatcher)
    }

    /// Queues `job` on the worker thread.
    pub fn dispatch<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.worker()?.dispatch(job)
    }

    /// Returns `true` on the worker thread, including while it drains its
    /// queue after [`shutdown_worker`](MediaPluginService::shutdown_worker).
    pub fn is_on_worker(&self) -> bool {
        self.shared.lock().worker_thread == Some(thread::current().id())
    }

    pub fn is_worker_shut_down(&self) -> bool {
        self.shared.lock().worker_shutdown
    }

    /// Rejects all further acquisitions. Requests already handed to the
    /// provider still resolve through their continuations.
    pub fn begin_worker_shutdown(&self) {
        if !self.shutting_down_on_worker.swap(true, Ordering::SeqCst) {
            debug!("media plugin service shutting down on worker");
        }
    }

    /// Stops the worker thread and blocks until its queue has drained.
    ///
    /// The handle is detached under the lock and torn down outside of it, so
    /// queued jobs that need the lock can still finish.
    pub fn shutdown_worker(&self) {
        let worker = {
            let mut shared = self.shared.lock();
            shared.worker_shutdown = true;
            shared.worker.take()
        };
        if let Some(worker) = worker {
            debug!(thread = worker.dispatcher().name(), "shutting down media plugin worker");
            worker.shutdown();
        }
    }

    pub fn shutdown(&self) {
        self.begin_worker_shutdown();
        self.shutdown_worker();
        info!("media plugin service shut down");
    }

    /// Requests a video decoder. Must be called on the worker thread.
    ///
    /// `callback` is resolved exactly once, on the worker, with either the
    /// decoder or the reason it could not be provided. When the request is
    /// rejected up front the same error is also returned.
    pub fn acquire_decoder(
        &self,
        tags: CapabilityTags,
        node_id: NodeId,
        decryptor_id: u32,
        helper: Option<Arc<dyn CrashHelper>>,
        callback: Completion<Arc<dyn VideoDecoder>>,
    ) -> Result<()> {
        self.acquire(
            CapabilityKind::VideoDecoder,
            tags,
            node_id,
            helper,
            callback,
            move |connection| connection.video_decoder(decryptor_id),
        )
    }

    /// Requests a video encoder. Must be called on the worker thread.
    pub fn acquire_encoder(
        &self,
        tags: CapabilityTags,
        node_id: NodeId,
        helper: Option<Arc<dyn CrashHelper>>,
        callback: Completion<Arc<dyn VideoEncoder>>,
    ) -> Result<()> {
        self.acquire(
            CapabilityKind::VideoEncoder,
            tags,
            node_id,
            helper,
            callback,
            |connection| connection.video_encoder(),
        )
    }

    /// Requests a content decryptor. Must be called on the worker thread.
    ///
    /// Refused with [`BrokerError::NotAvailable`] when media sandboxing is
    /// required but unsupported on this platform.
    pub fn acquire_decryptor(
        &self,
        tags: CapabilityTags,
        node_id: NodeId,
        helper: Option<Arc<dyn CrashHelper>>,
        callback: Completion<Arc<dyn Decryptor>>,
    ) -> Result<()> {
        if self.config.require_media_sandbox && !self.sandbox.can_sandbox_media() {
            warn!("decryption not available without media sandboxing support");
            return reject(
                callback,
                BrokerError::not_available("decryption requires media sandboxing support"),
            );
        }
        self.acquire(
            CapabilityKind::Decryptor,
            tags,
            node_id,
            helper,
            callback,
            |connection| connection.decryptor(),
        )
    }

    fn acquire<T, F>(
        &self,
        kind: CapabilityKind,
        tags: CapabilityTags,
        node_id: NodeId,
        helper: Option<Arc<dyn CrashHelper>>,
        callback: Completion<Arc<T>>,
        extract: F,
    ) -> Result<()>
    where
        T: CapabilityInstance + ?Sized + 'static,
        Arc<T>: Send,
        F: FnOnce(&dyn PluginConnection) -> Result<Arc<T>> + Send + 'static,
    {
        debug_assert!(
            self.is_on_worker(),
            "{kind} acquisition must run on the media plugin worker"
        );
        if tags.is_empty() {
            return reject(
                callback,
                BrokerError::invalid_argument(format!("{kind} request without capability tags")),
            );
        }
        if self.shutting_down_on_worker.load(Ordering::SeqCst) {
            debug!(%kind, %node_id, "rejecting acquisition during shutdown");
            return reject(
                callback,
                BrokerError::not_available("media plugin service is shutting down"),
            );
        }
        let worker = match self.worker() {
            Ok(worker) => worker,
            Err(err) => return reject(callback, err),
        };

        debug!(%kind, %node_id, %tags, "requesting plugin host connection");
        let shared = Arc::clone(&self.shared);
        let reply = Completion::new(move |outcome: Result<Arc<dyn PluginConnection>>| {
            let continuation = move || {
                complete_acquisition(kind, outcome, extract, helper, &shared, callback);
            };
            // A rejected continuation is dropped here, which resolves the
            // caller's completion through its abandonment path.
            if let Err(err) = worker.dispatch(continuation) {
                warn!(%kind, "could not return to the media plugin worker: {err}");
            }
        })
        .on_abandon(BrokerError::provider_failure(
            "connection provider dropped the request",
        ));

        let request = ConnectionRequest {
            node_id,
            kind,
            tags,
        };
        self.provider.request_connection(request, reply);
        Ok(())
    }

    /// Registers `helper` for crashes of `plugin_id`. `None` is ignored.
    pub fn connect_crash_helper(&self, plugin_id: PluginId, helper: Option<Arc<dyn CrashHelper>>) {
        let Some(helper) = helper else {
            return;
        };
        if self.shared.lock().crash_helpers.connect(plugin_id, helper) {
            debug!(%plugin_id, "crash helper connected");
        }
    }

    /// Drops `helper` from every plugin it was registered for.
    pub fn disconnect_crash_helper(&self, helper: Option<&Arc<dyn CrashHelper>>) {
        let Some(helper) = helper else {
            return;
        };
        let removed = self.shared.lock().crash_helpers.disconnect(helper);
        if removed > 0 {
            debug!(removed, "crash helper disconnected");
        }
    }

    pub fn crash_helper_count(&self, plugin_id: PluginId) -> usize {
        self.shared.lock().crash_helpers.helper_count(plugin_id)
    }

    /// Notifies every helper registered for `plugin_id` that it crashed.
    ///
    /// The helpers are removed from the registry first; a second call for the
    /// same plugin is a no-op.
    pub fn run_plugin_crash_callbacks(
        &self,
        plugin_id: PluginId,
        plugin_name: &str,
    ) -> CrashReport {
        debug!(%plugin_id, plugin_name, "handling plugin crash");
        let helpers = self.shared.lock().crash_helpers.take(plugin_id);
        let Some(helpers) = helpers else {
            debug!(%plugin_id, "no crash helpers, not handling crash");
            return CrashReport::default();
        };
        crash::notify_crash(&helpers, plugin_id, plugin_name, self.events.as_ref())
    }
}

impl std::fmt::Debug for MediaPluginService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaPluginService")
            .field("role", &self.role)
            .field("config", &self.config)
            .field(
                "shutting_down_on_worker",
                &self.shutting_down_on_worker.load(Ordering::SeqCst),
            )
            .finish_non_exhaustive()
    }
}

fn reject<T: Send + 'static>(callback: Completion<T>, error: BrokerError) -> Result<()> {
    callback.fail(error.clone());
    Err(error)
}

fn complete_acquisition<T, F>(
    kind: CapabilityKind,
    outcome: Result<Arc<dyn PluginConnection>>,
    extract: F,
    helper: Option<Arc<dyn CrashHelper>>,
    shared: &Mutex<SharedState>,
    callback: Completion<Arc<T>>,
) where
    T: CapabilityInstance + ?Sized + 'static,
    Arc<T>: Send,
    F: FnOnce(&dyn PluginConnection) -> Result<Arc<T>>,
{
    let connection = match outcome {
        Ok(connection) => connection,
        Err(err) => {
            warn!(%kind, "no plugin host connection: {err}");
            callback.fail(err);
            return;
        }
    };

    let plugin_id = connection.plugin_id();
    match extract(connection.as_ref()) {
        Ok(instance) => {
            if let Some(helper) = helper {
                instance.set_crash_helper(Arc::clone(&helper));
                shared.lock().crash_helpers.connect(plugin_id, helper);
            }
            debug!(%kind, %plugin_id, plugin = connection.plugin_name(), "capability acquired");
            callback.succeed(instance);
        }
        Err(err) => {
            warn!(%kind, %plugin_id, "plugin connection could not provide capability: {err}");
            callback.fail(err);
        }
    }
}
