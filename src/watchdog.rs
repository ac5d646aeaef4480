//! Watchdog supervision of a running scan.
//!
//! A watchdog follows whether the detectors involved in a scan behave: its
//! callback is invoked with batches of coalesced data events, and when no
//! data arrives for the configured timeout it is told so. The callback
//! decides what happens next through its return value: keep going, stop
//! the scan cleanly, or fail it with an error.
//!
//! The supervision runs on a single consumer task, which makes the
//! guarantees structural: the data callback and the timeout callback can
//! never run concurrently, and at most one callback invocation is in
//! flight at any time. Rapid data events coalesce: many triggers before
//! the consumer wakes produce exactly one callback invocation carrying the
//! union of all signal sets, keyed by sender.
//!
//! The task holds only a weak reference to the scan's shared view; it can
//! never keep a finished scan alive, and loses access once the scan is
//! dropped.

use crate::error::{ScanError, ScanResult};
use crate::metadata::ScanInfo;
use crate::store::SharedNodes;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Coalesced unprocessed data events: sender name → set of signal names.
pub type DataEventBatch = HashMap<String, HashSet<String>>;

/// What a watchdog callback wants the scan to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchdogResponse {
    /// Nothing to report, keep scanning.
    Continue,
    /// End the scan cleanly; this is not an error.
    StopScan,
}

/// User-supplied policy watching the health of a running scan.
///
/// Errors returned from any hook end the scan and surface from
/// `Scan::run`; `StopScan` ends it cleanly.
#[async_trait]
pub trait WatchdogCallback: Send + Sync {
    /// Maximum time without a data event before `on_timeout` is called;
    /// also the minimum interval between `on_timeout` calls.
    fn timeout(&self) -> Duration {
        Duration::from_secs(1)
    }

    /// Called when the scan starts.
    async fn on_scan_new(&self, _scan_info: &ScanInfo) -> ScanResult<()> {
        Ok(())
    }

    /// Called with each coalesced batch of data events.
    async fn on_scan_data(
        &self,
        _events: &DataEventBatch,
        _nodes: &SharedNodes,
        _scan_info: &ScanInfo,
    ) -> ScanResult<WatchdogResponse> {
        Ok(WatchdogResponse::Continue)
    }

    /// Called when `timeout()` elapsed without any data event.
    async fn on_timeout(&self) -> ScanResult<WatchdogResponse> {
        Ok(WatchdogResponse::Continue)
    }

    /// Called at the end of the scan.
    async fn on_scan_end(&self, _scan_info: &ScanInfo) -> ScanResult<()> {
        Ok(())
    }
}

/// The scan state the watchdog is allowed to see.
#[derive(Debug)]
pub struct ScanView {
    pub nodes: SharedNodes,
    pub scan_info: ScanInfo,
}

enum WatchdogMessage {
    Wake,
    Stop,
}

struct WatchdogShared {
    data_events: Mutex<DataEventBatch>,
    wake_queued: AtomicBool,
    stopping: AtomicBool,
    last_activity: Mutex<Instant>,
}

/// Cloneable control surface of the watchdog task.
#[derive(Clone)]
pub struct WatchdogHandle {
    tx: mpsc::UnboundedSender<WatchdogMessage>,
    shared: Arc<WatchdogShared>,
    callback: Arc<dyn WatchdogCallback>,
}

impl WatchdogHandle {
    /// Record a data event and make sure the consumer will wake up.
    ///
    /// Resets the idle timer. Multiple rapid triggers before the consumer
    /// wakes coalesce into a single wake-up.
    pub fn trigger_data_event(&self, sender: &str, signal: &str) {
        if let Ok(mut last) = self.shared.last_activity.lock() {
            *last = Instant::now();
        }
        if let Ok(mut events) = self.shared.data_events.lock() {
            events
                .entry(sender.to_string())
                .or_default()
                .insert(signal.to_string());
        }
        if !self.shared.wake_queued.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(WatchdogMessage::Wake);
        }
    }

    /// Ask the task to finish cleanly; queued data batches are discarded.
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        let _ = self.tx.send(WatchdogMessage::Stop);
    }

    pub async fn on_scan_new(&self, scan_info: &ScanInfo) -> ScanResult<()> {
        self.callback.on_scan_new(scan_info).await?;
        if let Ok(mut last) = self.shared.last_activity.lock() {
            *last = Instant::now();
        }
        Ok(())
    }

    /// Stop the task and run the callback's end-of-scan hook.
    pub async fn on_scan_end(&self, scan_info: &ScanInfo) -> ScanResult<()> {
        self.stop();
        self.callback.on_scan_end(scan_info).await
    }

    pub fn timeout(&self) -> Duration {
        self.callback.timeout()
    }
}

impl std::fmt::Debug for WatchdogHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchdogHandle").finish()
    }
}

/// The supervision task itself; run it with `tokio::spawn(task.run())`.
pub struct WatchdogTask {
    rx: mpsc::UnboundedReceiver<WatchdogMessage>,
    shared: Arc<WatchdogShared>,
    callback: Arc<dyn WatchdogCallback>,
    scan: Weak<ScanView>,
}

impl WatchdogTask {
    pub fn new(
        callback: Arc<dyn WatchdogCallback>,
        scan: Weak<ScanView>,
    ) -> (WatchdogHandle, WatchdogTask) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(WatchdogShared {
            data_events: Mutex::new(DataEventBatch::new()),
            wake_queued: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            last_activity: Mutex::new(Instant::now()),
        });
        let handle = WatchdogHandle {
            tx,
            shared: shared.clone(),
            callback: callback.clone(),
        };
        let task = WatchdogTask {
            rx,
            shared,
            callback,
            scan,
        };
        (handle, task)
    }

    fn last_activity(&self) -> Instant {
        self.shared
            .last_activity
            .lock()
            .map(|last| *last)
            .unwrap_or_else(|_| Instant::now())
    }

    fn take_batch(&self) -> DataEventBatch {
        self.shared.wake_queued.store(false, Ordering::SeqCst);
        self.shared
            .data_events
            .lock()
            .map(|mut events| std::mem::take(&mut *events))
            .unwrap_or_default()
    }

    /// Consume data events and watch for silence until stopped.
    ///
    /// Any error returned here ends the scan; a clean stop (requested by
    /// the callback or by `WatchdogHandle::stop`) does not.
    pub async fn run(mut self) -> ScanResult<()> {
        let timeout = self.callback.timeout();
        let mut deadline = Instant::now() + timeout;
        loop {
            tokio::select! {
                message = self.rx.recv() => {
                    match message {
                        None | Some(WatchdogMessage::Stop) => return Ok(()),
                        Some(WatchdogMessage::Wake) => {
                            if self.shared.stopping.load(Ordering::SeqCst) {
                                continue;
                            }
                            let batch = self.take_batch();
                            if batch.is_empty() {
                                continue;
                            }
                            let Some(view) = self.scan.upgrade() else {
                                // The scan is gone, nothing left to watch.
                                return Ok(());
                            };
                            match self
                                .callback
                                .on_scan_data(&batch, &view.nodes, &view.scan_info)
                                .await?
                            {
                                WatchdogResponse::Continue => {
                                    deadline = self.last_activity().max(Instant::now()) + timeout;
                                }
                                WatchdogResponse::StopScan => return Ok(()),
                            }
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let fresh = self.last_activity() + timeout;
                    if fresh > Instant::now() {
                        // Data arrived since the timer was armed.
                        deadline = fresh;
                        continue;
                    }
                    match self.callback.on_timeout().await? {
                        WatchdogResponse::Continue => {
                            deadline = Instant::now() + timeout;
                        }
                        WatchdogResponse::StopScan => return Ok(()),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct RecordingCallback {
        period: Option<Duration>,
        batches: Mutex<Vec<DataEventBatch>>,
        timeouts: AtomicUsize,
        stop_after_timeouts: Option<usize>,
    }

    #[async_trait]
    impl WatchdogCallback for RecordingCallback {
        fn timeout(&self) -> Duration {
            self.period.unwrap_or(Duration::from_millis(50))
        }

        async fn on_scan_data(
            &self,
            events: &DataEventBatch,
            _nodes: &SharedNodes,
            _scan_info: &ScanInfo,
        ) -> ScanResult<WatchdogResponse> {
            self.batches.lock().expect("lock").push(events.clone());
            Ok(WatchdogResponse::Continue)
        }

        async fn on_timeout(&self) -> ScanResult<WatchdogResponse> {
            let count = self.timeouts.fetch_add(1, Ordering::SeqCst) + 1;
            match self.stop_after_timeouts {
                Some(limit) if count >= limit => Ok(WatchdogResponse::StopScan),
                _ => Ok(WatchdogResponse::Continue),
            }
        }
    }

    fn view() -> Arc<ScanView> {
        Arc::new(ScanView {
            nodes: SharedNodes::default(),
            scan_info: ScanInfo::new(),
        })
    }

    #[tokio::test]
    async fn test_rapid_triggers_coalesce_into_one_batch() {
        let callback = Arc::new(RecordingCallback {
            period: Some(Duration::from_secs(10)),
            ..Default::default()
        });
        let scan = view();
        let (handle, task) = WatchdogTask::new(callback.clone(), Arc::downgrade(&scan));
        let running = tokio::spawn(task.run());

        // All triggers land before the consumer runs: the select loop is
        // not polled until we yield.
        handle.trigger_data_event("diode", "new_data");
        handle.trigger_data_event("diode", "end");
        handle.trigger_data_event("timer", "new_data");

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop();
        running.await.expect("join").expect("clean run");

        let batches = callback.batches.lock().expect("lock");
        assert_eq!(batches.len(), 1, "one wake-up for all triggers");
        let batch = &batches[0];
        assert_eq!(batch["diode"], HashSet::from(["new_data".to_string(), "end".to_string()]));
        assert_eq!(batch["timer"], HashSet::from(["new_data".to_string()]));
    }

    #[tokio::test]
    async fn test_timeout_fires_once_per_idle_period() {
        let callback = Arc::new(RecordingCallback {
            period: Some(Duration::from_millis(30)),
            ..Default::default()
        });
        let scan = view();
        let (handle, task) = WatchdogTask::new(callback.clone(), Arc::downgrade(&scan));
        let running = tokio::spawn(task.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop();
        running.await.expect("join").expect("clean run");

        let fired = callback.timeouts.load(Ordering::SeqCst);
        assert!(fired >= 2, "timer must re-arm after firing, got {fired}");
        assert!(fired <= 4, "at most one firing per idle period, got {fired}");
    }

    #[tokio::test]
    async fn test_data_resets_idle_timer() {
        let callback = Arc::new(RecordingCallback {
            period: Some(Duration::from_millis(60)),
            ..Default::default()
        });
        let scan = view();
        let (handle, task) = WatchdogTask::new(callback.clone(), Arc::downgrade(&scan));
        let running = tokio::spawn(task.run());

        // Keep feeding data faster than the timeout.
        for _ in 0..5 {
            handle.trigger_data_event("diode", "new_data");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.stop();
        running.await.expect("join").expect("clean run");

        assert_eq!(callback.timeouts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stop_scan_from_timeout_ends_task_cleanly() {
        let callback = Arc::new(RecordingCallback {
            period: Some(Duration::from_millis(20)),
            stop_after_timeouts: Some(1),
            ..Default::default()
        });
        let scan = view();
        let (_handle, task) = WatchdogTask::new(callback.clone(), Arc::downgrade(&scan));
        let result = tokio::time::timeout(Duration::from_secs(1), task.run())
            .await
            .expect("task ends by itself");
        assert!(result.is_ok());
        assert_eq!(callback.timeouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_callback_error_escalates() {
        struct Failing;
        #[async_trait]
        impl WatchdogCallback for Failing {
            fn timeout(&self) -> Duration {
                Duration::from_millis(10)
            }
            async fn on_timeout(&self) -> ScanResult<WatchdogResponse> {
                Err(ScanError::Watchdog("detector is silent".into()))
            }
        }

        let scan = view();
        let (_handle, task) = WatchdogTask::new(Arc::new(Failing), Arc::downgrade(&scan));
        let result = tokio::time::timeout(Duration::from_secs(1), task.run())
            .await
            .expect("task ends by itself");
        assert!(matches!(result, Err(ScanError::Watchdog(_))));
    }

    #[tokio::test]
    async fn test_dropped_scan_stops_task() {
        let callback = Arc::new(RecordingCallback {
            period: Some(Duration::from_secs(10)),
            ..Default::default()
        });
        let scan = view();
        let (handle, task) = WatchdogTask::new(callback, Arc::downgrade(&scan));
        let running = tokio::spawn(task.run());

        drop(scan);
        handle.trigger_data_event("diode", "new_data");

        tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .expect("task ends once the scan is gone")
            .expect("join")
            .expect("clean exit");
    }
}
