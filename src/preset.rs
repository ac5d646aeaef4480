//! User-installable scan hooks.
//!
//! A preset is invoked at three well-defined scan lifecycle points:
//! `prepare` before the parameter-application phase, `start` before the
//! run phase, and `stop` during final teardown. All presets of one scan
//! run concurrently at each point. Prepare and start kill their siblings
//! on the first failure; stop hooks are best-effort: every stop hook
//! runs to completion even if another one fails.
//!
//! Through its [`PresetContext`] a preset can route channel data to a
//! callback for the duration of the scan. Every subscription installed via
//! [`PresetContext::connect_data_channels`] is recorded and removed again
//! when the preset stops; leaking a subscription past the scan would be a
//! defect, and this contract exists to prevent it.

use crate::chain::{AcquisitionChannel, AcquisitionDevice};
use crate::error::{ScanError, ScanResult};
use crate::events::{ChannelDataEvent, SubscriptionId};
use crate::metadata::ScanInfo;
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Callback receiving `(counter, channel name, event)` for connected
/// data channels.
pub type PresetDataCallback = Arc<dyn Fn(&str, &str, &ChannelDataEvent) + Send + Sync>;

/// User-supplied scan hook object.
#[async_trait]
pub trait ScanPreset: Send + Sync {
    /// Called once per scan, before parameters are applied.
    async fn prepare(&self, _ctx: &mut PresetContext) -> ScanResult<()> {
        Ok(())
    }

    /// Called before the run phase.
    async fn start(&self, _ctx: &mut PresetContext) -> ScanResult<()> {
        Ok(())
    }

    /// Called during final teardown, whatever happened before.
    async fn stop(&self, _ctx: &mut PresetContext) -> ScanResult<()> {
        Ok(())
    }
}

/// Per-scan state handed to a preset's hooks.
#[derive(Default)]
pub struct PresetContext {
    devices: Vec<Arc<dyn AcquisitionDevice>>,
    scan_info: ScanInfo,
    subscriptions: Vec<(Arc<AcquisitionChannel>, SubscriptionId)>,
    channel_owner: HashMap<String, String>,
}

impl PresetContext {
    /// Snapshot of the acquisition chain's devices.
    pub fn devices(&self) -> &[Arc<dyn AcquisitionDevice>] {
        &self.devices
    }

    pub fn scan_info(&self) -> &ScanInfo {
        &self.scan_info
    }

    /// The counter owning a connected channel, while the preset is active.
    pub fn channel_owner(&self, channel: &str) -> Option<&str> {
        self.channel_owner.get(channel).map(String::as_str)
    }

    /// Associate a callback with the data emitted by the channels of the
    /// given counters. Everything connected here is disconnected again
    /// when the preset stops.
    pub fn connect_data_channels(
        &mut self,
        counters: &[&str],
        callback: PresetDataCallback,
    ) -> ScanResult<()> {
        for counter in counters {
            let device = self
                .devices
                .iter()
                .find(|device| device.name() == *counter)
                .cloned()
                .ok_or_else(|| {
                    ScanError::Preset(format!("counter '{counter}' is not part of this scan"))
                })?;
            for channel in device.channels() {
                let channel_name = channel.name();
                self.channel_owner
                    .insert(channel_name.clone(), (*counter).to_string());
                let id = {
                    let callback = callback.clone();
                    let counter = (*counter).to_string();
                    channel.events().new_data.connect(Arc::new(move |event| {
                        callback(&counter, &event.channel, event);
                    }))
                };
                self.subscriptions.push((channel.clone(), id));
            }
        }
        Ok(())
    }

    fn disconnect_all(&mut self) {
        for (channel, id) in self.subscriptions.drain(..) {
            channel.events().new_data.disconnect(id);
        }
        self.channel_owner.clear();
    }
}

/// Binds one preset to a running scan and cleans up after it.
pub struct PresetHandle {
    preset: Arc<dyn ScanPreset>,
    ctx: PresetContext,
}

impl PresetHandle {
    pub fn new(preset: Arc<dyn ScanPreset>) -> Self {
        Self {
            preset,
            ctx: PresetContext::default(),
        }
    }

    /// Attach the chain snapshot and metadata for this scan run.
    pub fn bind(&mut self, devices: Vec<Arc<dyn AcquisitionDevice>>, scan_info: ScanInfo) {
        self.ctx.devices = devices;
        self.ctx.scan_info = scan_info;
    }

    pub async fn run_prepare(&mut self) -> ScanResult<()> {
        self.preset.prepare(&mut self.ctx).await
    }

    pub async fn run_start(&mut self) -> ScanResult<()> {
        self.preset.start(&mut self.ctx).await
    }

    /// Drop every subscription this preset installed, then run its stop
    /// hook.
    pub async fn run_stop(&mut self) -> ScanResult<()> {
        self.ctx.disconnect_all();
        self.preset.stop(&mut self.ctx).await
    }
}

/// Which hook to execute on a batch of presets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresetStage {
    Prepare,
    Start,
    Stop,
}

/// Run one stage of every preset concurrently.
///
/// Prepare and start kill the remaining hooks on the first failure. Stop
/// lets every hook finish and reports the first failure afterwards.
pub async fn execute_presets(
    handles: &[Arc<Mutex<PresetHandle>>],
    stage: PresetStage,
) -> ScanResult<()> {
    let mut tasks = Vec::with_capacity(handles.len());
    for handle in handles {
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move {
            let mut guard = handle.lock().await;
            match stage {
                PresetStage::Prepare => guard.run_prepare().await,
                PresetStage::Start => guard.run_start().await,
                PresetStage::Stop => guard.run_stop().await,
            }
        }));
    }

    let abort_handles: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
    let mut stream: FuturesUnordered<_> = tasks.into_iter().collect();
    let mut first_error: Option<ScanError> = None;
    while let Some(joined) = stream.next().await {
        let failure = match joined {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err),
            Err(join_err) => ScanError::from_join(join_err),
        };
        if let Some(err) = failure {
            if first_error.is_none() {
                if stage != PresetStage::Stop {
                    for handle in &abort_handles {
                        handle.abort();
                    }
                }
                first_error = Some(err);
            } else {
                log::warn!("additional preset failure: {err}");
            }
        }
    }
    match first_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DeviceEvents;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct CounterDevice {
        name: String,
        channels: Vec<Arc<AcquisitionChannel>>,
        events: DeviceEvents,
    }

    impl CounterDevice {
        fn new(name: &str, channels: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                channels: channels
                    .iter()
                    .map(|c| AcquisitionChannel::new(*c))
                    .collect(),
                events: DeviceEvents::default(),
            })
        }
    }

    impl AcquisitionDevice for CounterDevice {
        fn name(&self) -> &str {
            &self.name
        }
        fn channels(&self) -> &[Arc<AcquisitionChannel>] {
            &self.channels
        }
        fn events(&self) -> &DeviceEvents {
            &self.events
        }
    }

    struct RoutingPreset {
        received: Arc<StdMutex<Vec<(String, String, Vec<f64>)>>>,
    }

    #[async_trait]
    impl ScanPreset for RoutingPreset {
        async fn prepare(&self, ctx: &mut PresetContext) -> ScanResult<()> {
            let received = self.received.clone();
            ctx.connect_data_channels(
                &["diode"],
                Arc::new(move |counter, channel, event| {
                    if let Ok(mut log) = received.lock() {
                        log.push((
                            counter.to_string(),
                            channel.to_string(),
                            event.values.clone(),
                        ));
                    }
                }),
            )
        }
    }

    #[tokio::test]
    async fn test_connected_channels_route_to_callback() {
        let device = CounterDevice::new("diode", &["intensity"]);
        let received = Arc::new(StdMutex::new(Vec::new()));
        let mut handle = PresetHandle::new(Arc::new(RoutingPreset {
            received: received.clone(),
        }));
        handle.bind(vec![device.clone()], ScanInfo::new());
        handle.run_prepare().await.expect("prepare");

        device.channels()[0].emit_data(vec![1.0, 2.0]);

        let log = received.lock().expect("lock");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, "diode");
        assert_eq!(log[0].1, "intensity");
        assert_eq!(log[0].2, vec![1.0, 2.0]);
    }

    #[tokio::test]
    async fn test_stop_removes_every_subscription() {
        let device = CounterDevice::new("diode", &["intensity", "raw"]);
        let mut handle = PresetHandle::new(Arc::new(RoutingPreset {
            received: Arc::new(StdMutex::new(Vec::new())),
        }));
        handle.bind(vec![device.clone()], ScanInfo::new());
        handle.run_prepare().await.expect("prepare");

        for channel in device.channels() {
            assert_eq!(channel.events().new_data.subscriber_count(), 1);
        }

        handle.run_stop().await.expect("stop");
        for channel in device.channels() {
            assert_eq!(
                channel.events().new_data.subscriber_count(),
                0,
                "no leaked subscription after preset stop"
            );
        }
    }

    #[tokio::test]
    async fn test_unknown_counter_is_an_error() {
        let mut handle = PresetHandle::new(Arc::new(RoutingPreset {
            received: Arc::new(StdMutex::new(Vec::new())),
        }));
        handle.bind(Vec::new(), ScanInfo::new());
        assert!(matches!(
            handle.run_prepare().await,
            Err(ScanError::Preset(_))
        ));
    }

    struct FlagPreset {
        stops: Arc<AtomicUsize>,
        fail_stop: bool,
    }

    #[async_trait]
    impl ScanPreset for FlagPreset {
        async fn stop(&self, _ctx: &mut PresetContext) -> ScanResult<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            if self.fail_stop {
                Err(ScanError::Preset("stop hook failed".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_stop_stage_is_best_effort() {
        let stops = Arc::new(AtomicUsize::new(0));
        let handles: Vec<Arc<Mutex<PresetHandle>>> = [false, true, false]
            .into_iter()
            .map(|fail_stop| {
                Arc::new(Mutex::new(PresetHandle::new(Arc::new(FlagPreset {
                    stops: stops.clone(),
                    fail_stop,
                }))))
            })
            .collect();

        let result = execute_presets(&handles, PresetStage::Stop).await;
        assert!(matches!(result, Err(ScanError::Preset(_))));
        assert_eq!(
            stops.load(Ordering::SeqCst),
            3,
            "one failing stop hook does not block the others"
        );
    }
}
