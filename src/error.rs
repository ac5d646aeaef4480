//! Custom error types for the scan engine.
//!
//! This module defines the primary error type, `ScanError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of failures a scan can
//! produce, from device faults to storage problems.
//!
//! ## Error taxonomy
//!
//! Three kinds of conditions flow through a scan:
//!
//! - **Abort** (`ScanError::Aborted`): a user interrupt delivered through the
//!   scan's abort token. It ends the scan and classifies the final state as
//!   `UserAborted`.
//! - **Clean stop**: *not* an error. A watchdog callback returning
//!   [`StopScan`](crate::watchdog::WatchdogResponse::StopScan) or a
//!   terminator device finishing ends the run phase without producing a
//!   `ScanError`.
//! - **Generic failure**: every other variant. The first one captured wins
//!   for state classification (`Killed`) and is the one `Scan::run`
//!   re-raises after teardown completes.
//!
//! [`ErrorCapture`] implements the capture policy used throughout teardown:
//! every scope records its failures, none of them interrupts the remaining
//! scopes, and the chronologically first failure is the scan's verdict.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type ScanResult<T> = std::result::Result<T, ScanError>;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Scan aborted by user")]
    Aborted,

    #[error("Scan state is not idle. Scan objects can only be used once.")]
    Reused,

    #[error("Acquisition error: {0}")]
    Acquisition(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Data has expired in live storage")]
    DataExpired,

    #[error("Watchdog error: {0}")]
    Watchdog(String),

    #[error("Preset error: {0}")]
    Preset(String),

    #[error("Writer error: {0}")]
    Writer(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Task failed: {0}")]
    Task(String),

    #[error("Phase protocol violation: {0}")]
    Sequence(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ScanError {
    /// Whether this error classifies the scan as user-aborted rather than
    /// killed.
    pub fn is_abort(&self) -> bool {
        matches!(self, ScanError::Aborted)
    }

    /// Map a task join failure into a `ScanError`. Cancelled tasks were
    /// killed on purpose and carry no error of their own.
    pub fn from_join(err: tokio::task::JoinError) -> Option<Self> {
        if err.is_cancelled() {
            None
        } else {
            Some(ScanError::Task(err.to_string()))
        }
    }
}

/// Collects failures from a stack of teardown scopes.
///
/// Mirrors the policy of the scan teardown stack: a failing step never
/// prevents later steps from running, every failure is retained for
/// reporting, and the first captured failure decides the final scan state
/// and is the one re-raised to the caller.
#[derive(Debug, Default)]
pub struct ErrorCapture {
    errors: Vec<ScanError>,
}

impl ErrorCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the failure of one step, if any.
    pub fn capture(&mut self, result: ScanResult<()>) {
        if let Err(err) = result {
            if !self.errors.is_empty() {
                // Later failures are retained but only reported in the log.
                log::warn!("additional error during scan teardown: {err}");
            }
            self.errors.push(err);
        }
    }

    /// Record a failure directly.
    pub fn push(&mut self, err: ScanError) {
        self.capture(Err(err));
    }

    pub fn is_failed(&self) -> bool {
        !self.errors.is_empty()
    }

    /// The chronologically first failure, which decides the scan verdict.
    pub fn first(&self) -> Option<&ScanError> {
        self.errors.first()
    }

    pub fn all(&self) -> &[ScanError] {
        &self.errors
    }

    /// Consume the capture, yielding the first failure if there was one.
    pub fn into_result(mut self) -> ScanResult<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors.remove(0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ScanError::Acquisition("detector timeout".to_string());
        assert_eq!(err.to_string(), "Acquisition error: detector timeout");
    }

    #[test]
    fn test_abort_classification() {
        assert!(ScanError::Aborted.is_abort());
        assert!(!ScanError::Storage("lost".into()).is_abort());
    }

    #[test]
    fn test_capture_keeps_first_error() {
        let mut capture = ErrorCapture::new();
        capture.capture(Ok(()));
        capture.capture(Err(ScanError::Storage("first".into())));
        capture.capture(Err(ScanError::Aborted));

        assert!(capture.is_failed());
        assert!(matches!(capture.first(), Some(ScanError::Storage(_))));
        assert_eq!(capture.all().len(), 2);
        assert!(matches!(
            capture.into_result(),
            Err(ScanError::Storage(_))
        ));
    }

    #[test]
    fn test_empty_capture_is_ok() {
        let capture = ErrorCapture::new();
        assert!(!capture.is_failed());
        assert!(capture.into_result().is_ok());
    }
}
