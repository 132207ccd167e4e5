//! Process-wide ownership of the media plugin service.
//!
//! The service is only ever constructed on the control thread. Callers on any
//! other thread hand construction over and wait for it, so concurrent first
//! calls cannot build two instances. Once torn down the slot stays empty for
//! the rest of the process.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::BrokerConfig;
use crate::control::ControlThread;
use crate::crash::CrashEventSink;
use crate::error::{BrokerError, Result};
use crate::provider::{ConnectionProvider, ProcessRole, RoleQuery, SandboxSupport};
use crate::service::MediaPluginService;

/// Collaborators needed to build the service.
///
/// Both providers are supplied up front; the role query decides which one the
/// constructed service uses.
#[derive(Clone)]
pub struct ServiceEnvironment {
    pub config: BrokerConfig,
    pub role: Arc<dyn RoleQuery>,
    /// Launches plugin hosts directly.
    pub supervisor: Arc<dyn ConnectionProvider>,
    /// Reaches plugin hosts through the supervising process.
    pub subordinate: Arc<dyn ConnectionProvider>,
    pub sandbox: Arc<dyn SandboxSupport>,
    pub events: Arc<dyn CrashEventSink>,
}

impl ServiceEnvironment {
    fn build(&self) -> Result<Arc<MediaPluginService>> {
        let role = self.role.current_role();
        let provider = match role {
            ProcessRole::Supervisor => Arc::clone(&self.supervisor),
            ProcessRole::Subordinate => Arc::clone(&self.subordinate),
        };
        let service = MediaPluginService::new(
            self.config.clone(),
            role,
            provider,
            Arc::clone(&self.sandbox),
            Arc::clone(&self.events),
        );
        service.init()?;
        Ok(service)
    }
}

impl std::fmt::Debug for ServiceEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceEnvironment")
            .field("config", &self.config)
            .field("role", &self.role.current_role())
            .finish_non_exhaustive()
    }
}

enum SlotState {
    Empty,
    Live(Arc<MediaPluginService>),
    TornDown,
}

struct SlotInner {
    control: ControlThread,
    environment: ServiceEnvironment,
    state: Mutex<SlotState>,
    constructed: AtomicUsize,
}

impl SlotInner {
    fn get_or_create_on_control(&self) -> Result<Arc<MediaPluginService>> {
        debug_assert!(self.control.is_current());
        let mut state = self.state.lock();
        match &*state {
            SlotState::Live(service) => return Ok(Arc::clone(service)),
            SlotState::TornDown => {
                return Err(BrokerError::not_available(
                    "media plugin service has already been torn down",
                ))
            }
            SlotState::Empty => {}
        }

        let service = self.environment.build()?;
        *state = SlotState::Live(Arc::clone(&service));
        self.constructed.fetch_add(1, Ordering::SeqCst);
        Ok(service)
    }
}

/// Holder guaranteeing a single service instance.
#[derive(Clone)]
pub struct ServiceSlot {
    inner: Arc<SlotInner>,
}

impl ServiceSlot {
    pub fn new(control: ControlThread, environment: ServiceEnvironment) -> Self {
        Self {
            inner: Arc::new(SlotInner {
                control,
                environment,
                state: Mutex::new(SlotState::Empty),
                constructed: AtomicUsize::new(0),
            }),
        }
    }

    /// Returns the service, constructing it on the control thread if needed.
    ///
    /// Blocks the calling thread while a construction handed to the control
    /// thread completes. Fails with [`BrokerError::NotAvailable`] after
    /// [`ServiceSlot::tear_down`].
    pub fn get_or_create(&self) -> Result<Arc<MediaPluginService>> {
        if self.inner.control.is_current() {
            return self.inner.get_or_create_on_control();
        }
        let inner = Arc::clone(&self.inner);
        self.inner
            .control
            .run_sync(move || inner.get_or_create_on_control())?
    }

    /// Returns the live service without constructing one.
    pub fn get(&self) -> Option<Arc<MediaPluginService>> {
        match &*self.inner.state.lock() {
            SlotState::Live(service) => Some(Arc::clone(service)),
            SlotState::Empty | SlotState::TornDown => None,
        }
    }

    /// Number of service instances this slot has ever built.
    pub fn constructed_count(&self) -> usize {
        self.inner.constructed.load(Ordering::SeqCst)
    }

    pub fn is_torn_down(&self) -> bool {
        matches!(&*self.inner.state.lock(), SlotState::TornDown)
    }

    /// Releases the service and shuts its worker down. Later
    /// [`get_or_create`](ServiceSlot::get_or_create) calls fail instead of
    /// building a replacement.
    pub fn tear_down(&self) {
        let previous = std::mem::replace(&mut *self.inner.state.lock(), SlotState::TornDown);
        match previous {
            SlotState::Live(service) => {
                service.shutdown();
                info!("media plugin service torn down");
            }
            SlotState::Empty => debug!("media plugin service torn down before first use"),
            SlotState::TornDown => {}
        }
    }

    pub fn control(&self) -> &ControlThread {
        &self.inner.control
    }
}

impl std::fmt::Debug for ServiceSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceSlot")
            .field("constructed", &self.constructed_count())
            .field("torn_down", &self.is_torn_down())
            .finish_non_exhaustive()
    }
}

static GLOBAL: OnceCell<ServiceSlot> = OnceCell::new();

/// Installs the process-wide slot and starts its control thread.
///
/// The returned guard tears the service down when dropped; keep it alive for
/// as long as the process should be able to use media plugins. Installing
/// twice is rejected.
pub fn install(environment: ServiceEnvironment) -> Result<ShutdownGuard> {
    let control = ControlThread::spawn(&environment.config.control_thread_name)?;
    let slot = ServiceSlot::new(control, environment);
    GLOBAL.set(slot).map_err(|rejected| {
        rejected.control().stop();
        BrokerError::invalid_argument("media plugin service is already installed")
    })?;
    Ok(ShutdownGuard { _private: () })
}

/// Returns the process-wide service, constructing it on first use.
pub fn get_or_create() -> Result<Arc<MediaPluginService>> {
    GLOBAL.get().ok_or(BrokerError::NotInstalled)?.get_or_create()
}

/// Returns the process-wide service if it is currently live.
pub fn get() -> Option<Arc<MediaPluginService>> {
    GLOBAL.get().and_then(ServiceSlot::get)
}

/// Tears the process-wide service down. Idempotent.
pub fn shutdown() {
    if let Some(slot) = GLOBAL.get() {
        slot.tear_down();
        slot.control().stop();
    }
}

/// Tears the process-wide service down when dropped.
#[derive(Debug)]
#[must_use = "dropping the guard shuts the media plugin service down"]
pub struct ShutdownGuard {
    _private: (),
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        shutdown();
    }
}
