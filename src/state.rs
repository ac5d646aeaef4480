//! Scan lifecycle states and the monotonic state ratchet.
//!
//! `ScanState` values are totally ordered. A scan only ever moves to a
//! larger state, never backwards, and ends in one of the terminal states
//! (`Done`, `UserAborted`, `Killed`). State changes are broadcast on a
//! `tokio::sync::watch` channel so any number of waiters can block until a
//! target state has been reached.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;

/// Lifecycle state of a scan, in execution order.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ScanState {
    /// Scan object created, `run` not called yet.
    Idle = 0,
    /// Applying parameters and preparing acquisition objects.
    Preparing = 1,
    /// Starting acquisition objects.
    Starting = 2,
    /// Stopping acquisition objects.
    Stopping = 3,
    /// Terminal: scan completed normally.
    Done = 4,
    /// Terminal: scan was interrupted by the user.
    UserAborted = 5,
    /// Terminal: scan failed.
    Killed = 6,
}

impl ScanState {
    pub fn is_terminal(self) -> bool {
        self >= ScanState::Done
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScanState::Idle => "IDLE",
            ScanState::Preparing => "PREPARING",
            ScanState::Starting => "STARTING",
            ScanState::Stopping => "STOPPING",
            ScanState::Done => "DONE",
            ScanState::UserAborted => "USER_ABORTED",
            ScanState::Killed => "KILLED",
        };
        write!(f, "{name}")
    }
}

/// Multi-subscriber state cell enforcing the monotonic ratchet.
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<ScanState>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ScanState::Idle);
        Self { tx }
    }

    pub fn get(&self) -> ScanState {
        *self.tx.borrow()
    }

    /// Advance to `state`. Returns `true` if the state changed; requests to
    /// move backwards (or stay) are ignored.
    pub fn advance(&self, state: ScanState) -> bool {
        let mut changed = false;
        self.tx.send_if_modified(|current| {
            if state > *current {
                *current = state;
                changed = true;
                true
            } else {
                false
            }
        });
        changed
    }

    /// Block the calling task until the state is at least `target`.
    pub async fn wait(&self, target: ScanState) {
        let mut rx = self.tx.subscribe();
        // wait_for checks the current value first, so intermediate wake-ups
        // and already-satisfied targets are both handled.
        let _ = rx.wait_for(|state| *state >= target).await;
    }

    pub fn subscribe(&self) -> watch::Receiver<ScanState> {
        self.tx.subscribe()
    }
}
