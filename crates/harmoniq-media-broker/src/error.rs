use thiserror::Error;

use crate::capability::CapabilityKind;

/// Errors surfaced by the media plugin service.
///
/// Acquisition failures are delivered through the request's completion; the
/// same value may also be returned synchronously when a request is rejected
/// before it reaches the connection provider, which is why the type is `Clone`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("media plugin service not available: {0}")]
    NotAvailable(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no plugin host connection: {0}")]
    ProviderFailure(String),
    #[error("connected plugin does not provide a {kind}")]
    CapabilityUnsupported { kind: CapabilityKind },
    #[error("failed to spawn thread {name}: {reason}")]
    WorkerSpawn { name: String, reason: String },
    #[error("media plugin service has not been installed")]
    NotInstalled,
}

impl BrokerError {
    pub fn not_available(reason: impl Into<String>) -> Self {
        Self::NotAvailable(reason.into())
    }

    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument(reason.into())
    }

    pub fn provider_failure(reason: impl Into<String>) -> Self {
        Self::ProviderFailure(reason.into())
    }

    pub fn is_not_available(&self) -> bool {
        matches!(self, Self::NotAvailable(_))
    }
}

pub type Result<T, E = BrokerError> = std::result::Result<T, E>;
