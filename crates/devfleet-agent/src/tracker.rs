//! Device presence tracking.
//!
//! [`CommandTracker`] polls a listing command (`idevice_id -l` by default)
//! and turns changes in the set of attached serials into a stream of
//! [`PresenceEvent`]s. A listing failure counts as "no change".

use std::collections::{BTreeSet, VecDeque};
use std::process::Stdio;
use std::time::Duration;

use devfleet_core::PresenceEvent;
use futures::Stream;
use tokio::process::Command;
use tracing::{debug, warn};

const LIST_TIMEOUT: Duration = Duration::from_secs(10);

/// Polls a command for attached device serials.
#[derive(Debug, Clone)]
pub struct CommandTracker {
    program: String,
    args: Vec<String>,
    interval: Duration,
}

impl CommandTracker {
    /// Create a tracker for a whitespace-separated command line.
    ///
    /// Returns `None` for a blank command.
    #[must_use]
    pub fn new(command: &str, interval: Duration) -> Option<Self> {
        let mut words = command.split_whitespace().map(str::to_string);
        let program = words.next()?;
        Some(Self {
            program,
            args: words.collect(),
            interval,
        })
    }

    /// Stream of presence changes. Never ends.
    pub fn into_stream(self) -> impl Stream<Item = PresenceEvent> + Send {
        let state = PollState {
            tracker: self,
            known: BTreeSet::new(),
            pending: VecDeque::new(),
            first: true,
        };

        futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Some((event, state));
                }
                if !state.first {
                    tokio::time::sleep(state.tracker.interval).await;
                }
                state.first = false;

                if let Some(current) = state.tracker.list().await {
                    state.pending.extend(diff(&state.known, &current));
                    state.known = current;
                }
            }
        })
    }

    async fn list(&self) -> Option<BTreeSet<String>> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(LIST_TIMEOUT, output).await {
            Ok(Ok(output)) if output.status.success() => {
                Some(parse_listing(&String::from_utf8_lossy(&output.stdout)))
            }
            Ok(Ok(output)) => {
                warn!(program = %self.program, status = %output.status, "Device listing failed");
                None
            }
            Ok(Err(e)) => {
                warn!(program = %self.program, error = %e, "Device listing failed");
                None
            }
            Err(_) => {
                warn!(program = %self.program, "Device listing timed out");
                None
            }
        }
    }
}

struct PollState {
    tracker: CommandTracker,
    known: BTreeSet<String>,
    pending: VecDeque<PresenceEvent>,
    first: bool,
}

/// Serials listed one per line. Blank lines are skipped.
#[must_use]
pub fn parse_listing(output: &str) -> BTreeSet<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Events turning `known` into `current`: removals first, each group in
/// sorted order.
#[must_use]
pub fn diff(known: &BTreeSet<String>, current: &BTreeSet<String>) -> Vec<PresenceEvent> {
    let removed = known.difference(current).map(PresenceEvent::unplugged);
    let added = current.difference(known).map(PresenceEvent::plugged);
    let events: Vec<_> = removed.chain(added).collect();
    if !events.is_empty() {
        debug!(count = events.len(), "Device set changed");
    }
    events
}
