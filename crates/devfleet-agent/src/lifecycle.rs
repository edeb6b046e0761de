//! Device lifecycle state machine.
//!
//! # State Machine
//!
//! ```text
//!     plug ──▶ ┌─────────────┐
//!              │  Preparing  │◀──────────────┐
//!              └──────┬──────┘               │
//!        healthy │         │ failure         │ cold reset
//!                ▼         ▼                 │
//!         ┌─────────┐  ┌─────────┐           │
//!         │  Ready  │  │  Fatal  │───────────┤
//!         └────┬────┘  └─────────┘           │
//!              └─────────────────────────────┘
//! ```
//!
//! Unplug removes the device from any state; it is not a transition.

use devfleet_core::{DeviceId, DeviceState};

use crate::error::{AgentError, Result};

/// Validates a state transition and returns the target state if valid.
///
/// # Errors
///
/// Returns `AgentError::InvalidTransition` if the transition is not allowed.
pub fn validate_transition(
    udid: &DeviceId,
    from: DeviceState,
    to: DeviceState,
) -> Result<DeviceState> {
    if is_valid_transition(from, to) {
        Ok(to)
    } else {
        Err(AgentError::InvalidTransition {
            udid: udid.clone(),
            from,
            to,
        })
    }
}

/// Check if a state transition is valid according to the state machine.
#[must_use]
pub const fn is_valid_transition(from: DeviceState, to: DeviceState) -> bool {
    use DeviceState::{Fatal, Preparing, Ready};

    matches!(
        (from, to),
        // Preparing settles into Ready or Fatal
        (Preparing, Ready | Fatal)
            // Only a cold reset leaves Ready or Fatal
            | (Ready | Fatal, Preparing)
    )
}

/// Returns true if a cold reset may start from `state`.
#[must_use]
pub const fn can_cold_reset(state: DeviceState) -> bool {
    is_valid_transition(state, DeviceState::Preparing)
}
