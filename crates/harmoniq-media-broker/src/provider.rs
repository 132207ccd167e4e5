//! Collaborators the service depends on but does not implement: the plugin
//! host connection provider, the process role query and the sandbox check.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::capability::{
    CapabilityKind, CapabilityTags, Decryptor, NodeId, PluginId, VideoDecoder, VideoEncoder,
};
use crate::completion::Completion;
use crate::error::Result;

/// Request for a connection to a plugin host able to serve `kind` with `tags`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub node_id: NodeId,
    pub kind: CapabilityKind,
    pub tags: CapabilityTags,
}

/// Live channel to a plugin host instance.
///
/// A connection existing does not mean it provides every capability; the
/// extraction methods return [`BrokerError::CapabilityUnsupported`] when the
/// hosted plugin lacks the requested one.
///
/// [`BrokerError::CapabilityUnsupported`]: crate::BrokerError::CapabilityUnsupported
pub trait PluginConnection: Send + Sync {
    fn plugin_id(&self) -> PluginId;
    fn plugin_name(&self) -> &str;
    fn video_decoder(&self, decryptor_id: u32) -> Result<Arc<dyn VideoDecoder>>;
    fn video_encoder(&self) -> Result<Arc<dyn VideoEncoder>>;
    fn decryptor(&self) -> Result<Arc<dyn Decryptor>>;
}

/// Produces connections to plugin hosts.
pub trait ConnectionProvider: Send + Sync {
    /// One-time bootstrap, run on the service worker right after it starts.
    fn initialize(&self) {}

    /// Starts establishing a connection. `reply` may be resolved from any
    /// thread; the service moves the continuation back onto its worker.
    fn request_connection(
        &self,
        request: ConnectionRequest,
        reply: Completion<Arc<dyn PluginConnection>>,
    );
}

/// Role of the current process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessRole {
    /// Owns and launches the plugin host processes.
    Supervisor,
    /// Reaches plugin hosts through the supervising process.
    Subordinate,
}

pub trait RoleQuery: Send + Sync {
    fn current_role(&self) -> ProcessRole;
}

impl RoleQuery for ProcessRole {
    fn current_role(&self) -> ProcessRole {
        *self
    }
}

/// Platform check for media plugin sandboxing.
pub trait SandboxSupport: Send + Sync {
    fn can_sandbox_media(&self) -> bool;
}

/// Sandbox answer fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticSandbox(pub bool);

impl SandboxSupport for StaticSandbox {
    fn can_sandbox_media(&self) -> bool {
        self.0
    }
}
