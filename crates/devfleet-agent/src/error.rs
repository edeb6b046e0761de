//! Error types for device lifecycle operations.

use std::time::Duration;

use devfleet_core::{DeviceId, DeviceState};
use thiserror::Error;

/// A result type using `AgentError`.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors that can occur while managing devices.
#[derive(Debug, Error)]
pub enum AgentError {
    /// No free proxy port was found within the probe budget.
    #[error("no free proxy port after {attempts} probes")]
    ResourceExhausted {
        /// Number of candidate ports probed.
        attempts: u32,
    },

    /// The endpoint did not come up within the startup timeout.
    #[error("endpoint for {udid} did not start within {timeout:?}")]
    StartupTimeout {
        /// Device whose endpoint timed out.
        udid: DeviceId,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The endpoint process could not be launched or exited early.
    #[error("endpoint for {udid} failed to start: {reason}")]
    StartupFailed {
        /// Device whose endpoint failed.
        udid: DeviceId,
        /// What went wrong.
        reason: String,
    },

    /// The endpoint never answered its status probe.
    #[error("healthcheck failed for {udid}: {reason}")]
    HealthcheckFailed {
        /// Device whose healthcheck failed.
        udid: DeviceId,
        /// Last probe failure.
        reason: String,
    },

    /// The device is not tracked.
    #[error("udid: {0} not found")]
    DeviceNotFound(DeviceId),

    /// The requested state transition is not valid.
    #[error("invalid state transition for {udid}: cannot transition from {from} to {to}")]
    InvalidTransition {
        /// The device being transitioned.
        udid: DeviceId,
        /// The current state.
        from: DeviceState,
        /// The requested target state.
        to: DeviceState,
    },

    /// The operation was abandoned because the device went away.
    #[error("operation on {0} cancelled")]
    Cancelled(DeviceId),

    /// Registry reporting error.
    #[error("registry error: {0}")]
    Registry(#[from] devfleet_registry::RegistryError),
}

impl AgentError {
    /// Returns the appropriate HTTP status code for this error.
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            Self::DeviceNotFound(_) => 400,
            Self::InvalidTransition { .. } | Self::Cancelled(_) => 409,
            Self::StartupTimeout { .. } | Self::StartupFailed { .. } | Self::HealthcheckFailed { .. } => {
                502
            }
            Self::ResourceExhausted { .. } | Self::Registry(_) => 503,
        }
    }

    /// Returns true if the error describes a device that failed to come up.
    ///
    /// These leave the device in `Fatal`; a cold reset may recover it.
    #[must_use]
    pub const fn is_device_failure(&self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted { .. }
                | Self::StartupTimeout { .. }
                | Self::StartupFailed { .. }
                | Self::HealthcheckFailed { .. }
        )
    }
}
