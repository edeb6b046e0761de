//! Proxy port allocation.
//!
//! Ports are handed out as [`PortLease`]s from a fixed range. Dropping a
//! lease returns its port. The allocator walks the range with a moving
//! cursor, so a port that was just returned is only reused after the rest
//! of the range has been tried.

use std::collections::HashSet;
use std::net::{Ipv4Addr, TcpListener};
use std::ops::Range;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{AgentError, Result};

/// Hands out locally bindable ports from a configured range.
#[derive(Debug)]
pub struct ProxyPortAllocator {
    range: Range<u16>,
    max_probes: u32,
    state: Mutex<AllocState>,
}

#[derive(Debug)]
struct AllocState {
    cursor: u16,
    outstanding: HashSet<u16>,
}

impl ProxyPortAllocator {
    /// Create an allocator over `range`, probing at most `max_probes`
    /// candidates per acquisition.
    #[must_use]
    pub fn new(range: Range<u16>, max_probes: u32) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(AllocState {
                cursor: range.start,
                outstanding: HashSet::new(),
            }),
            range,
            max_probes,
        })
    }

    /// Reserve a port that is not leased and can currently be bound.
    ///
    /// # Errors
    ///
    /// Returns `AgentError::ResourceExhausted` when no candidate within the
    /// probe budget is free.
    pub fn acquire(self: &Arc<Self>) -> Result<PortLease> {
        let span = u32::from(self.range.end.saturating_sub(self.range.start));
        let attempts = self.max_probes.min(span);

        let mut state = self.state.lock();
        for _ in 0..attempts {
            let candidate = state.cursor;
            state.cursor = self.advance(candidate);

            if state.outstanding.contains(&candidate) || !is_bindable(candidate) {
                continue;
            }

            state.outstanding.insert(candidate);
            debug!(port = candidate, "Proxy port leased");
            return Ok(PortLease {
                port: candidate,
                allocator: Arc::clone(self),
            });
        }

        Err(AgentError::ResourceExhausted { attempts })
    }

    /// Number of ports currently leased.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding.len()
    }

    /// Returns true if `port` is currently leased.
    #[must_use]
    pub fn is_leased(&self, port: u16) -> bool {
        self.state.lock().outstanding.contains(&port)
    }

    fn advance(&self, port: u16) -> u16 {
        let next = port.saturating_add(1);
        if next >= self.range.end {
            self.range.start
        } else {
            next
        }
    }

    fn release(&self, port: u16) {
        if self.state.lock().outstanding.remove(&port) {
            debug!(port, "Proxy port released");
        }
    }
}

fn is_bindable(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
}

/// A leased proxy port. The port is returned to the allocator on drop.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    allocator: Arc<ProxyPortAllocator>,
}

impl PortLease {
    /// The leased port number.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.allocator.release(self.port);
    }
}
