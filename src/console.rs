//! Suppression of incidental user-facing output.
//!
//! Motor moves and similar operations normally announce themselves to the
//! user. During the scan body such chatter is unwanted, so the scan holds
//! a [`SuppressGuard`] for its duration. Suppression is a process-global,
//! re-entrant depth counter: nested scans stack their guards.

use std::sync::atomic::{AtomicUsize, Ordering};

static SUPPRESS_DEPTH: AtomicUsize = AtomicUsize::new(0);

/// Whether user-facing messages are currently allowed.
pub fn user_output_enabled() -> bool {
    SUPPRESS_DEPTH.load(Ordering::SeqCst) == 0
}

/// Emit a message intended for the user, unless suppressed.
pub fn user_message(message: &str) {
    if user_output_enabled() {
        log::info!(target: "user", "{message}");
    } else {
        log::debug!(target: "user", "(suppressed) {message}");
    }
}

/// Suppresses user output while alive.
#[derive(Debug)]
pub struct SuppressGuard(());

impl SuppressGuard {
    pub fn new() -> Self {
        SUPPRESS_DEPTH.fetch_add(1, Ordering::SeqCst);
        Self(())
    }
}

impl Default for SuppressGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SuppressGuard {
    fn drop(&mut self) {
        SUPPRESS_DEPTH.fetch_sub(1, Ordering::SeqCst);
    }
}
