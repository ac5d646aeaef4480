//! Optional progress reporting for a running scan.
//!
//! A progress reporter is notified when the scan starts and ends, and its
//! `progress_task` runs alongside the scan body. The scan kills the task
//! at teardown if it has not finished by itself; a task that already
//! failed has its error captured like any other teardown failure.

use crate::error::ScanResult;
use crate::metadata::ScanInfo;
use async_trait::async_trait;

#[async_trait]
pub trait ScanProgress: Send + Sync {
    /// Called right before the scan body starts.
    fn on_scan_new(&self, _scan_info: &ScanInfo) {}

    /// Long-running reporting task, spawned for the duration of the scan.
    async fn progress_task(&self) -> ScanResult<()>;

    /// Called during teardown, after the task has ended.
    fn on_scan_end(&self, _scan_info: &ScanInfo) {}
}

/// Reporter that periodically logs how many points each channel produced.
pub struct LoggingProgress {
    period: std::time::Duration,
    nodes: crate::store::SharedNodes,
}

impl LoggingProgress {
    pub fn new(period: std::time::Duration, nodes: crate::store::SharedNodes) -> Self {
        Self { period, nodes }
    }
}

#[async_trait]
impl ScanProgress for LoggingProgress {
    fn on_scan_new(&self, scan_info: &ScanInfo) {
        log::info!(
            "scan '{}' started",
            scan_info.get_str("title").unwrap_or_default()
        );
    }

    async fn progress_task(&self) -> ScanResult<()> {
        loop {
            tokio::time::sleep(self.period).await;
            let keys: Vec<String> = self
                .nodes
                .read()
                .map(|nodes| nodes.keys().cloned().collect())
                .unwrap_or_default();
            log::debug!("scan progress: {} storage nodes active", keys.len());
        }
    }

    fn on_scan_end(&self, scan_info: &ScanInfo) {
        log::info!(
            "scan '{}' ended in state {}",
            scan_info.get_str("title").unwrap_or_default(),
            scan_info.get_str("state").unwrap_or_default()
        );
    }
}
