#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result as AnyResult};
use crossbeam_channel::{bounded, Receiver};
use parking_lot::Mutex;

use harmoniq_media_broker::{
    BrokerConfig, BrokerError, CapabilityInstance, CapabilityKind, Completion, ConnectionProvider,
    ConnectionRequest, CrashEventSink, CrashEventTarget, CrashHelper, Decryptor,
    MediaPluginService, PluginConnection, PluginCrashedEvent, PluginId, ProcessRole, Result,
    StaticSandbox, VideoDecoder, VideoEncoder, WorkerDispatcher,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// What the mock provider does with the next request.
pub enum Behaviour {
    Connect(Arc<MockConnection>),
    Fail(BrokerError),
    /// Drops the reply without resolving it.
    Drop,
    /// Keeps the reply so the test can resolve it later.
    Hold,
}

#[derive(Default)]
pub struct MockProvider {
    behaviours: Mutex<VecDeque<Behaviour>>,
    requests: Mutex<Vec<ConnectionRequest>>,
    held: Mutex<Vec<Completion<Arc<dyn PluginConnection>>>>,
    initialized: AtomicUsize,
}

impl MockProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, behaviour: Behaviour) {
        self.behaviours.lock().push_back(behaviour);
    }

    pub fn requests(&self) -> Vec<ConnectionRequest> {
        self.requests.lock().clone()
    }

    pub fn initialize_count(&self) -> usize {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn take_held(&self) -> Option<Completion<Arc<dyn PluginConnection>>> {
        self.held.lock().pop()
    }
}

impl ConnectionProvider for MockProvider {
    fn initialize(&self) {
        self.initialized.fetch_add(1, Ordering::SeqCst);
    }

    fn request_connection(
        &self,
        request: ConnectionRequest,
        reply: Completion<Arc<dyn PluginConnection>>,
    ) {
        self.requests.lock().push(request);
        let behaviour = self
            .behaviours
            .lock()
            .pop_front()
            .unwrap_or(Behaviour::Fail(BrokerError::provider_failure("no behaviour queued")));
        match behaviour {
            Behaviour::Connect(connection) => {
                let connection: Arc<dyn PluginConnection> = connection;
                // Resolve from a foreign thread, like a real plugin host would.
                std::thread::spawn(move || reply.succeed(connection));
            }
            Behaviour::Fail(err) => reply.fail(err),
            Behaviour::Drop => drop(reply),
            Behaviour::Hold => self.held.lock().push(reply),
        }
    }
}

pub struct MockConnection {
    pub plugin_id: PluginId,
    pub name: String,
    pub capabilities: Vec<CapabilityKind>,
    pub instances: Mutex<Vec<Arc<MockInstance>>>,
}

impl MockConnection {
    pub fn new(plugin_id: u32, name: &str, capabilities: &[CapabilityKind]) -> Arc<Self> {
        Arc::new(Self {
            plugin_id: PluginId(plugin_id),
            name: name.to_owned(),
            capabilities: capabilities.to_vec(),
            instances: Mutex::new(Vec::new()),
        })
    }

    fn instance(&self, kind: CapabilityKind) -> Result<Arc<MockInstance>> {
        if !self.capabilities.contains(&kind) {
            return Err(BrokerError::CapabilityUnsupported { kind });
        }
        let instance = Arc::new(MockInstance {
            plugin_id: self.plugin_id,
            helper: Mutex::new(None),
        });
        self.instances.lock().push(Arc::clone(&instance));
        Ok(instance)
    }

    pub fn last_instance(&self) -> Option<Arc<MockInstance>> {
        self.instances.lock().last().cloned()
    }
}

impl PluginConnection for MockConnection {
    fn plugin_id(&self) -> PluginId {
        self.plugin_id
    }

    fn plugin_name(&self) -> &str {
        &self.name
    }

    fn video_decoder(&self, _decryptor_id: u32) -> Result<Arc<dyn VideoDecoder>> {
        let instance: Arc<dyn VideoDecoder> = self.instance(CapabilityKind::VideoDecoder)?;
        Ok(instance)
    }

    fn video_encoder(&self) -> Result<Arc<dyn VideoEncoder>> {
        let instance: Arc<dyn VideoEncoder> = self.instance(CapabilityKind::VideoEncoder)?;
        Ok(instance)
    }

    fn decryptor(&self) -> Result<Arc<dyn Decryptor>> {
        let instance: Arc<dyn Decryptor> = self.instance(CapabilityKind::Decryptor)?;
        Ok(instance)
    }
}

pub struct MockInstance {
    pub plugin_id: PluginId,
    pub helper: Mutex<Option<Arc<dyn CrashHelper>>>,
}

impl MockInstance {
    pub fn has_helper(&self) -> bool {
        self.helper.lock().is_some()
    }
}

impl CapabilityInstance for MockInstance {
    fn plugin_id(&self) -> PluginId {
        self.plugin_id
    }

    fn set_crash_helper(&self, helper: Arc<dyn CrashHelper>) {
        *self.helper.lock() = Some(helper);
    }
}

impl VideoDecoder for MockInstance {
    fn decryptor_id(&self) -> u32 {
        0
    }
}

impl VideoEncoder for MockInstance {}

impl Decryptor for MockInstance {}

pub struct TestHelper {
    pub target: Option<CrashEventTarget>,
}

impl TestHelper {
    pub fn window(window_id: u64) -> Arc<dyn CrashHelper> {
        Arc::new(Self {
            target: Some(CrashEventTarget {
                window_id,
                document_id: Some(window_id + 100),
            }),
        })
    }

    pub fn closed() -> Arc<dyn CrashHelper> {
        Arc::new(Self { target: None })
    }
}

impl CrashHelper for TestHelper {
    fn crash_event_target(&self) -> Option<CrashEventTarget> {
        self.target
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<(CrashEventTarget, PluginCrashedEvent)>>,
    pub failing_windows: Mutex<Vec<u64>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn windows(&self) -> Vec<u64> {
        self.events
            .lock()
            .iter()
            .map(|(target, _)| target.window_id)
            .collect()
    }
}

impl CrashEventSink for RecordingSink {
    fn deliver(&self, target: &CrashEventTarget, event: &PluginCrashedEvent) -> AnyResult<()> {
        if self.failing_windows.lock().contains(&target.window_id) {
            bail!("window {} is gone", target.window_id);
        }
        self.events.lock().push((*target, event.clone()));
        Ok(())
    }
}

pub fn test_config() -> BrokerConfig {
    BrokerConfig::default()
        .with_worker_thread_name("test-media-worker")
        .with_control_thread_name("test-media-control")
        .with_require_media_sandbox(true)
}

pub fn service_with(
    provider: Arc<MockProvider>,
    sandbox: bool,
    sink: Arc<RecordingSink>,
) -> Arc<MediaPluginService> {
    MediaPluginService::new(
        test_config(),
        ProcessRole::Supervisor,
        provider,
        Arc::new(StaticSandbox(sandbox)),
        sink,
    )
}

/// Runs `task` on the service worker and waits for its result.
pub fn on_worker<R, F>(service: &Arc<MediaPluginService>, task: F) -> R
where
    R: Send + 'static,
    F: FnOnce(&MediaPluginService) -> R + Send + 'static,
{
    let (tx, rx) = bounded(1);
    let target = Arc::clone(service);
    service
        .dispatch(move || {
            let _ = tx.send(task(&target));
        })
        .expect("worker accepts work");
    rx.recv_timeout(TIMEOUT).expect("worker ran the task")
}

/// Outcome observed by a recording completion: the plugin id on success and
/// whether the callback ran on the worker thread.
pub type Observed = (Result<PluginId>, bool);

pub fn recording_completion<T>(
    worker: WorkerDispatcher,
) -> (Completion<Arc<T>>, Receiver<Observed>)
where
    T: CapabilityInstance + ?Sized + 'static,
    Arc<T>: Send,
{
    let (tx, rx) = bounded(1);
    let completion = Completion::new(move |result: Result<Arc<T>>| {
        let outcome = result.map(|instance| instance.plugin_id());
        let _ = tx.send((outcome, worker.is_current()));
    });
    (completion, rx)
}
