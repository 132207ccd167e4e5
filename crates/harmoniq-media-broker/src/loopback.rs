//! In-process plugin hosts for tests and offline development.
//!
//! [`LoopbackProvider`] plays the supervising side: it "launches" a host for
//! the first catalog plugin whose tags match a request, on its own launcher
//! thread, and keeps one connection per (node, plugin) pair alive.
//! [`RelayProvider`] plays the subordinate side and forwards every request to
//! an upstream provider over a channel, the way a content process asks the
//! supervising process for a connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::capability::{
    CapabilityInstance, CapabilityKind, Decryptor, NodeId, PluginId, VideoDecoder, VideoEncoder,
};
use crate::completion::Completion;
use crate::crash::CrashHelper;
use crate::error::{BrokerError, Result};
use crate::provider::{ConnectionProvider, ConnectionRequest, PluginConnection};

/// Catalog entry describing a simulated plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopbackPlugin {
    pub name: String,
    pub tags: Vec<String>,
    pub capabilities: Vec<CapabilityKind>,
}

impl LoopbackPlugin {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: Vec::new(),
            capabilities: Vec::new(),
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_capability(mut self, kind: CapabilityKind) -> Self {
        if !self.capabilities.contains(&kind) {
            self.capabilities.push(kind);
        }
        self
    }

    fn serves(&self, request: &ConnectionRequest) -> bool {
        request
            .tags
            .is_satisfied_by(self.tags.iter().map(String::as_str))
    }
}

enum LaunchMessage {
    Launch {
        request: ConnectionRequest,
        reply: Completion<Arc<dyn PluginConnection>>,
    },
    Stop,
}

struct LoopbackState {
    catalog: Vec<LoopbackPlugin>,
    connections: Mutex<HashMap<(NodeId, String), Arc<LoopbackConnection>>>,
    next_plugin_id: AtomicU32,
    launches: AtomicUsize,
    initialized: AtomicBool,
}

/// Supervising side connection provider backed by in-process plugin hosts.
pub struct LoopbackProvider {
    state: Arc<LoopbackState>,
    sender: Sender<LaunchMessage>,
    launcher: Mutex<Option<JoinHandle<()>>>,
}

impl LoopbackProvider {
    pub fn spawn(catalog: Vec<LoopbackPlugin>) -> Result<Self> {
        let state = Arc::new(LoopbackState {
            catalog,
            connections: Mutex::new(HashMap::new()),
            next_plugin_id: AtomicU32::new(1),
            launches: AtomicUsize::new(0),
            initialized: AtomicBool::new(false),
        });
        let (tx, rx) = unbounded();
        let launcher_state = Arc::clone(&state);
        let launcher = thread::Builder::new()
            .name("loopback-plugin-launcher".into())
            .spawn(move || launcher_loop(launcher_state, rx))
            .map_err(|err| BrokerError::WorkerSpawn {
                name: "loopback-plugin-launcher".into(),
                reason: err.to_string(),
            })?;
        Ok(Self {
            state,
            sender: tx,
            launcher: Mutex::new(Some(launcher)),
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.state.initialized.load(Ordering::SeqCst)
    }

    /// Number of plugin hosts launched so far.
    pub fn launch_count(&self) -> usize {
        self.state.launches.load(Ordering::SeqCst)
    }

    pub fn plugin_name(&self, plugin_id: PluginId) -> Option<String> {
        self.state
            .connections
            .lock()
            .values()
            .find(|connection| connection.plugin_id == plugin_id)
            .map(|connection| connection.plugin.name.clone())
    }

    /// Simulates an abnormal exit of `plugin_id`, returning its name.
    ///
    /// The connection is forgotten, so the next matching request launches a
    /// fresh host with a new plugin id.
    pub fn crash(&self, plugin_id: PluginId) -> Option<String> {
        let mut connections = self.state.connections.lock();
        let key = connections
            .iter()
            .find(|(_, connection)| connection.plugin_id == plugin_id)
            .map(|(key, _)| key.clone())?;
        let connection = connections.remove(&key)?;
        warn!(%plugin_id, plugin = %connection.plugin.name, "loopback plugin host crashed");
        Some(connection.plugin.name.clone())
    }
}

impl ConnectionProvider for LoopbackProvider {
    fn initialize(&self) {
        if !self.state.initialized.swap(true, Ordering::SeqCst) {
            debug!(plugins = self.state.catalog.len(), "loopback plugin catalog ready");
        }
    }

    fn request_connection(
        &self,
        request: ConnectionRequest,
        reply: Completion<Arc<dyn PluginConnection>>,
    ) {
        // A stopped launcher hands the message back; dropping it resolves the reply.
        if self
            .sender
            .send(LaunchMessage::Launch { request, reply })
            .is_err()
        {
            debug!("loopback launcher stopped; dropping connection request");
        }
    }
}

impl Drop for LoopbackProvider {
    fn drop(&mut self) {
        let _ = self.sender.send(LaunchMessage::Stop);
        if let Some(handle) = self.launcher.get_mut().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

fn launcher_loop(state: Arc<LoopbackState>, receiver: Receiver<LaunchMessage>) {
    while let Ok(message) = receiver.recv() {
        match message {
            LaunchMessage::Launch { request, reply } => reply.resolve(launch(&state, &request)),
            LaunchMessage::Stop => break,
        }
    }
}

fn launch(
    state: &LoopbackState,
    request: &ConnectionRequest,
) -> Result<Arc<dyn PluginConnection>> {
    let plugin = state
        .catalog
        .iter()
        .find(|plugin| plugin.serves(request))
        .ok_or_else(|| {
            BrokerError::provider_failure(format!(
                "no plugin supports {} with tags [{}]",
                request.kind.api_name(),
                request.tags
            ))
        })?;

    let key = (request.node_id.clone(), plugin.name.clone());
    let mut connections = state.connections.lock();
    let connection: Arc<dyn PluginConnection> = connections
        .entry(key)
        .or_insert_with(|| {
            let plugin_id = PluginId(state.next_plugin_id.fetch_add(1, Ordering::SeqCst));
            state.launches.fetch_add(1, Ordering::SeqCst);
            debug!(
                %plugin_id,
                plugin = %plugin.name,
                node = %request.node_id,
                "launched loopback plugin host"
            );
            Arc::new(LoopbackConnection {
                plugin_id,
                plugin: plugin.clone(),
            })
        })
        .clone();
    Ok(connection)
}

/// Connection to a simulated plugin host.
#[derive(Debug)]
pub struct LoopbackConnection {
    plugin_id: PluginId,
    plugin: LoopbackPlugin,
}

impl LoopbackConnection {
    fn instance(&self, kind: CapabilityKind, decryptor_id: u32) -> Result<Arc<LoopbackInstance>> {
        if !self.plugin.capabilities.contains(&kind) {
            return Err(BrokerError::CapabilityUnsupported { kind });
        }
        Ok(Arc::new(LoopbackInstance {
            plugin_id: self.plugin_id,
            kind,
            decryptor_id,
            crash_helper: Mutex::new(None),
        }))
    }
}

impl PluginConnection for LoopbackConnection {
    fn plugin_id(&self) -> PluginId {
        self.plugin_id
    }

    fn plugin_name(&self) -> &str {
        &self.plugin.name
    }

    fn video_decoder(&self, decryptor_id: u32) -> Result<Arc<dyn VideoDecoder>> {
        let instance: Arc<dyn VideoDecoder> =
            self.instance(CapabilityKind::VideoDecoder, decryptor_id)?;
        Ok(instance)
    }

    fn video_encoder(&self) -> Result<Arc<dyn VideoEncoder>> {
        let instance: Arc<dyn VideoEncoder> = self.instance(CapabilityKind::VideoEncoder, 0)?;
        Ok(instance)
    }

    fn decryptor(&self) -> Result<Arc<dyn Decryptor>> {
        let instance: Arc<dyn Decryptor> = self.instance(CapabilityKind::Decryptor, 0)?;
        Ok(instance)
    }
}

/// Capability instance handed out by a [`LoopbackConnection`].
pub struct LoopbackInstance {
    plugin_id: PluginId,
    kind: CapabilityKind,
    decryptor_id: u32,
    crash_helper: Mutex<Option<Arc<dyn CrashHelper>>>,
}

impl LoopbackInstance {
    pub fn kind(&self) -> CapabilityKind {
        self.kind
    }

    pub fn has_crash_helper(&self) -> bool {
        self.crash_helper.lock().is_some()
    }
}

impl std::fmt::Debug for LoopbackInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackInstance")
            .field("plugin_id", &self.plugin_id)
            .field("kind", &self.kind)
            .field("decryptor_id", &self.decryptor_id)
            .field("has_crash_helper", &self.has_crash_helper())
            .finish()
    }
}

impl CapabilityInstance for LoopbackInstance {
    fn plugin_id(&self) -> PluginId {
        self.plugin_id
    }

    fn set_crash_helper(&self, helper: Arc<dyn CrashHelper>) {
        *self.crash_helper.lock() = Some(helper);
    }
}

impl VideoDecoder for LoopbackInstance {
    fn decryptor_id(&self) -> u32 {
        self.decryptor_id
    }
}

impl VideoEncoder for LoopbackInstance {}

impl Decryptor for LoopbackInstance {}

enum RelayMessage {
    Forward {
        request: ConnectionRequest,
        reply: Completion<Arc<dyn PluginConnection>>,
    },
    Stop,
}

/// Subordinate side provider that asks an upstream provider for connections.
pub struct RelayProvider {
    sender: Sender<RelayMessage>,
    forwarded: Arc<AtomicUsize>,
    relay: Mutex<Option<JoinHandle<()>>>,
}

impl RelayProvider {
    pub fn spawn(upstream: Arc<dyn ConnectionProvider>) -> Result<Self> {
        let (tx, rx) = unbounded::<RelayMessage>();
        let forwarded = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&forwarded);
        let relay = thread::Builder::new()
            .name("media-plugin-relay".into())
            .spawn(move || {
                while let Ok(message) = rx.recv() {
                    match message {
                        RelayMessage::Forward { request, reply } => {
                            counter.fetch_add(1, Ordering::SeqCst);
                            upstream.request_connection(request, reply);
                        }
                        RelayMessage::Stop => break,
                    }
                }
            })
            .map_err(|err| BrokerError::WorkerSpawn {
                name: "media-plugin-relay".into(),
                reason: err.to_string(),
            })?;
        Ok(Self {
            sender: tx,
            forwarded,
            relay: Mutex::new(Some(relay)),
        })
    }

    /// Number of requests handed to the upstream provider.
    pub fn forwarded_count(&self) -> usize {
        self.forwarded.load(Ordering::SeqCst)
    }
}

impl ConnectionProvider for RelayProvider {
    fn request_connection(
        &self,
        request: ConnectionRequest,
        reply: Completion<Arc<dyn PluginConnection>>,
    ) {
        if self
            .sender
            .send(RelayMessage::Forward { request, reply })
            .is_err()
        {
            debug!("media plugin relay stopped; dropping connection request");
        }
    }
}

impl Drop for RelayProvider {
    fn drop(&mut self) {
        let _ = self.sender.send(RelayMessage::Stop);
        if let Some(handle) = self.relay.get_mut().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
