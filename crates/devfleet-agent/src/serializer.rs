//! Startup serialization.
//!
//! At most one device brings its endpoint up at a time. Waiters are served
//! in arrival order.

use std::sync::Arc;

use devfleet_core::DeviceId;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::debug;

/// Process-wide gate around endpoint startup.
#[derive(Debug, Clone, Default)]
pub struct StartupSerializer {
    gate: Arc<Mutex<()>>,
}

impl StartupSerializer {
    /// Create a new serializer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the startup slot.
    ///
    /// The slot is held until the returned permit is dropped, including when
    /// the waiting future is cancelled.
    pub async fn acquire(&self, udid: &DeviceId) -> StartupPermit {
        let queued_at = Instant::now();
        let guard = Arc::clone(&self.gate).lock_owned().await;
        debug!(
            udid = %udid,
            waited_ms = queued_at.elapsed().as_millis(),
            "Startup slot acquired"
        );

        StartupPermit {
            _guard: guard,
            udid: udid.clone(),
            acquired_at: Instant::now(),
        }
    }

    /// Returns true if some device currently holds the slot.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.gate.try_lock().is_err()
    }
}

/// Exclusive right to start an endpoint.
#[derive(Debug)]
pub struct StartupPermit {
    _guard: OwnedMutexGuard<()>,
    udid: DeviceId,
    acquired_at: Instant,
}

impl Drop for StartupPermit {
    fn drop(&mut self) {
        debug!(
            udid = %self.udid,
            held_ms = self.acquired_at.elapsed().as_millis(),
            "Startup slot released"
        );
    }
}
