//! Harmoniq media plugin service.
//!
//! Codec and decryption plugins run inside isolated plugin host processes. This
//! crate is the process-wide broker that hands out capability instances
//! (video decoders, video encoders and content decryptors) hosted by those
//! processes. All provider interaction runs on a single dedicated worker
//! thread, and every acquisition resolves its completion exactly once.
//!
//! The broker also keeps track of which crash helpers are interested in which
//! running plugin, so a plugin crash can be reported to every interested
//! window with the correct plugin identity.

pub mod capability;
pub mod completion;
pub mod config;
pub mod control;
pub mod crash;
mod error;
pub mod lifecycle;
pub mod loopback;
pub mod provider;
pub mod service;
pub mod worker;

pub use capability::{
    CapabilityInstance, CapabilityKind, CapabilityTags, Decryptor, NodeId, PluginId, VideoDecoder,
    VideoEncoder,
};
pub use completion::Completion;
pub use config::BrokerConfig;
pub use control::ControlThread;
pub use crash::{
    CrashEventSink, CrashEventTarget, CrashHelper, CrashRegistry, CrashReport, PluginCrashedEvent,
};
pub use error::{BrokerError, Result};
pub use lifecycle::{ServiceEnvironment, ServiceSlot, ShutdownGuard};
pub use provider::{
    ConnectionProvider, ConnectionRequest, PluginConnection, ProcessRole, RoleQuery,
    SandboxSupport, StaticSandbox,
};
pub use service::MediaPluginService;
pub use worker::{WorkerDispatcher, WorkerThread};
