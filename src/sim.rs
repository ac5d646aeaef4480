//! Simulated acquisition devices generating synthetic data.
//!
//! These devices exercise the full scan machinery without hardware: a
//! timer master driving point-by-point acquisition of its counters, a
//! positionable axis, a device that never finishes (for watchdog
//! scenarios) and one that fails at a chosen phase. The test-suite is
//! their main consumer, but they are regular devices and work in any
//! chain.

use crate::chain::{
    AcquisitionChannel, AcquisitionDevice, AcquisitionStep, DeviceIterator, Positioner,
};
use crate::error::{ScanError, ScanResult};
use crate::events::{DeviceEvent, DeviceEvents};
use crate::metadata::ScanInfo;
use async_trait::async_trait;
use rand::Rng;
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// SimCounter: a leaf device emitting one value per scan point
// ============================================================================

pub struct SimCounter {
    name: String,
    channels: Vec<Arc<AcquisitionChannel>>,
    events: DeviceEvents,
}

impl SimCounter {
    pub fn new(name: &str, channel: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            channels: vec![AcquisitionChannel::with_unit(channel, "V")],
            events: DeviceEvents::default(),
        })
    }

    fn emit_point(&self, index: usize) {
        let noise: f64 = rand::thread_rng().gen_range(-0.05..0.05);
        let value = (index as f64 * 0.1).sin() + noise;
        self.channels[0].emit_data(vec![value]);
    }

    fn emit_lifecycle(&self, start: bool) {
        let event = DeviceEvent {
            device: self.name.clone(),
        };
        if start {
            self.events.start.emit(&event);
        } else {
            self.events.end.emit(&event);
        }
    }
}

impl AcquisitionDevice for SimCounter {
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

// ============================================================================
// SimTimer: a master sequencing its counters through N points
// ============================================================================

struct SimTimerInner {
    name: String,
    npoints: usize,
    period: Duration,
    channels: Vec<Arc<AcquisitionChannel>>,
    events: DeviceEvents,
    counters: Mutex<Vec<Arc<SimCounter>>>,
}

/// Timer-style top-level master. Each point waits one period, then reads
/// every attached counter.
pub struct SimTimer {
    inner: Arc<SimTimerInner>,
}

impl SimTimer {
    pub fn new(name: &str, npoints: usize, period: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(SimTimerInner {
                name: name.to_string(),
                npoints,
                period,
                channels: Vec::new(),
                events: DeviceEvents::default(),
                counters: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Like [`new`](Self::new), with an "elapsed" channel of its own.
    pub fn with_elapsed_channel(name: &str, npoints: usize, period: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(SimTimerInner {
                name: name.to_string(),
                npoints,
                period,
                channels: vec![AcquisitionChannel::with_unit("elapsed", "s")],
                events: DeviceEvents::default(),
                counters: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Attach a counter read at every point. The counter must also be
    /// added to the chain below this timer.
    pub fn drive_counter(&self, counter: Arc<SimCounter>) {
        if let Ok(mut counters) = self.inner.counters.lock() {
            counters.push(counter);
        }
    }
}

impl AcquisitionDevice for SimTimer {
    fn name(&self) -> &str {
        &self.inner.name
    }
    fn channels(&self) -> &[Arc<AcquisitionChannel>] {
        &self.inner.channels
    }
    fn events(&self) -> &DeviceEvents {
        &self.inner.events
    }
    fn create_iterator(&self) -> ScanResult<Box<dyn DeviceIterator>> {
        Ok(Box::new(SimTimerIterator {
            inner: self.inner.clone(),
            point: 0,
        }))
    }
}

struct SimTimerIterator {
    inner: Arc<SimTimerInner>,
    point: usize,
}

#[async_trait]
impl DeviceIterator for SimTimerIterator {
    async fn apply_parameters(&mut self) -> ScanResult<()> {
        log::debug!("{}: parameters applied", self.inner.name);
        Ok(())
    }

    async fn prepare(&mut self, _scan_info: &ScanInfo) -> ScanResult<()> {
        Ok(())
    }

    async fn start(&mut self) -> ScanResult<()> {
        let event = DeviceEvent {
            device: self.inner.name.clone(),
        };
        self.inner.events.start.emit(&event);
        if let Ok(counters) = self.inner.counters.lock() {
            for counter in counters.iter() {
                counter.emit_lifecycle(true);
            }
        }
        Ok(())
    }

    async fn next_step(&mut self) -> ScanResult<Option<Box<dyn AcquisitionStep>>> {
        if self.point >= self.inner.npoints {
            if let Ok(counters) = self.inner.counters.lock() {
                for counter in counters.iter() {
                    counter.emit_lifecycle(false);
                }
            }
            let event = DeviceEvent {
                device: self.inner.name.clone(),
            };
            self.inner.events.end.emit(&event);
            return Ok(None);
        }
        let index = self.point;
        self.point += 1;
        Ok(Some(Box::new(SimTimerPoint {
            inner: self.inner.clone(),
            index,
        })))
    }

    async fn stop(&mut self) -> ScanResult<()> {
        log::debug!("{}: stopped", self.inner.name);
        Ok(())
    }
}

struct SimTimerPoint {
    inner: Arc<SimTimerInner>,
    index: usize,
}

#[async_trait]
impl AcquisitionStep for SimTimerPoint {
    async fn prepare(&mut self, _scan_info: &ScanInfo) -> ScanResult<()> {
        Ok(())
    }

    async fn start(&mut self) -> ScanResult<()> {
        tokio::time::sleep(self.inner.period).await;
        if let Some(channel) = self.inner.channels.first() {
            channel.emit_data(vec![self.index as f64 * self.inner.period.as_secs_f64()]);
        }
        let counters: Vec<Arc<SimCounter>> = self
            .inner
            .counters
            .lock()
            .map(|counters| counters.clone())
            .unwrap_or_default();
        for counter in counters {
            counter.emit_point(self.index);
        }
        Ok(())
    }
}

// ============================================================================
// SimAxis: a positionable device
// ============================================================================

pub struct SimAxis {
    name: String,
    position: Arc<Mutex<f64>>,
    targets: Vec<f64>,
    calculated: bool,
    channels: Vec<Arc<AcquisitionChannel>>,
    events: DeviceEvents,
}

impl SimAxis {
    pub fn new(name: &str, initial: f64, targets: Vec<f64>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            position: Arc::new(Mutex::new(initial)),
            targets,
            calculated: false,
            channels: vec![AcquisitionChannel::with_unit("position", "mm")],
            events: DeviceEvents::default(),
        })
    }

    pub fn calculated(name: &str, initial: f64) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            position: Arc::new(Mutex::new(initial)),
            targets: Vec::new(),
            calculated: true,
            channels: Vec::new(),
            events: DeviceEvents::default(),
        })
    }
}

impl AcquisitionDevice for SimAxis {
    fn name(&self) -> &str {
        &self.name
    }
    fn channels(&self) -> &[Arc<AcquisitionChannel>] {
        &self.channels
    }
    fn events(&self) -> &DeviceEvents {
        &self.events
    }
    fn as_positioner(&self) -> Option<&dyn Positioner> {
        Some(self)
    }
    fn create_iterator(&self) -> ScanResult<Box<dyn DeviceIterator>> {
        Ok(Box::new(SimAxisIterator {
            axis: SimAxisHandle {
                position: self.position.clone(),
                name: self.name.clone(),
                channel: self.channels.first().cloned(),
            },
            targets: self.targets.clone(),
            next: 0,
        }))
    }
}

#[async_trait]
impl Positioner for SimAxis {
    fn position(&self) -> f64 {
        self.position.lock().map(|p| *p).unwrap_or(f64::NAN)
    }

    async fn move_to(&self, position: f64) -> ScanResult<()> {
        tokio::time::sleep(Duration::from_millis(1)).await;
        if let Ok(mut current) = self.position.lock() {
            *current = position;
        }
        Ok(())
    }

    fn is_calculated(&self) -> bool {
        self.calculated
    }
}

struct SimAxisHandle {
    position: Arc<Mutex<f64>>,
    name: String,
    channel: Option<Arc<AcquisitionChannel>>,
}

struct SimAxisIterator {
    axis: SimAxisHandle,
    targets: Vec<f64>,
    next: usize,
}

#[async_trait]
impl DeviceIterator for SimAxisIterator {
    async fn apply_parameters(&mut self) -> ScanResult<()> {
        Ok(())
    }

    async fn prepare(&mut self, _scan_info: &ScanInfo) -> ScanResult<()> {
        Ok(())
    }

    async fn start(&mut self) -> ScanResult<()> {
        Ok(())
    }

    async fn next_step(&mut self) -> ScanResult<Option<Box<dyn AcquisitionStep>>> {
        if self.next >= self.targets.len() {
            return Ok(None);
        }
        let target = self.targets[self.next];
        self.next += 1;
        tokio::time::sleep(Duration::from_millis(1)).await;
        if let Ok(mut position) = self.axis.position.lock() {
            *position = target;
        }
        if let Some(channel) = &self.axis.channel {
            channel.emit_data(vec![target]);
        }
        log::debug!("{} moved to {target}", self.axis.name);
        // Motion happens here; there is no separate per-step work.
        Ok(Some(Box::new(NoopStep)))
    }

    async fn stop(&mut self) -> ScanResult<()> {
        Ok(())
    }
}

struct NoopStep;

#[async_trait]
impl AcquisitionStep for NoopStep {
    async fn prepare(&mut self, _scan_info: &ScanInfo) -> ScanResult<()> {
        Ok(())
    }
    async fn start(&mut self) -> ScanResult<()> {
        Ok(())
    }
}

// ============================================================================
// HangingDevice: never finishes by itself
// ============================================================================

/// Master whose iterator starts fine and then never produces another
/// step. Used in watchdog scenarios.
pub struct HangingDevice {
    name: String,
    channels: Vec<Arc<AcquisitionChannel>>,
    events: DeviceEvents,
}

impl HangingDevice {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            channels: vec![AcquisitionChannel::new("value")],
            events: DeviceEvents::default(),
        })
    }
}

impl AcquisitionDevice for HangingDevice {
    fn name(&self) -> &str {
        &self.name
    }
    fn channels(&self) -> &[Arc<AcquisitionChannel>] {
        &self.channels
    }
    fn events(&self) -> &DeviceEvents {
        &self.events
    }
    fn create_iterator(&self) -> ScanResult<Box<dyn DeviceIterator>> {
        Ok(Box::new(HangingIterator))
    }
}

struct HangingIterator;

#[async_trait]
impl DeviceIterator for HangingIterator {
    async fn apply_parameters(&mut self) -> ScanResult<()> {
        Ok(())
    }
    async fn prepare(&mut self, _scan_info: &ScanInfo) -> ScanResult<()> {
        Ok(())
    }
    async fn start(&mut self) -> ScanResult<()> {
        Ok(())
    }
    async fn next_step(&mut self) -> ScanResult<Option<Box<dyn AcquisitionStep>>> {
        futures::future::pending().await
    }
    async fn stop(&mut self) -> ScanResult<()> {
        Ok(())
    }
}

// ============================================================================
// FailingDevice: fails at a configurable phase
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailAt {
    ApplyParameters,
    Prepare,
    Start,
    Stop,
}

/// Master whose iterator fails at one configured phase.
pub struct FailingDevice {
    name: String,
    fail_at: FailAt,
    message: String,
    channels: Vec<Arc<AcquisitionChannel>>,
    events: DeviceEvents,
}

impl FailingDevice {
    pub fn new(name: &str, fail_at: FailAt, message: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            fail_at,
            message: message.to_string(),
            channels: vec![AcquisitionChannel::new("value")],
            events: DeviceEvents::default(),
        })
    }
}

impl AcquisitionDevice for FailingDevice {
    fn name(&self) -> &str {
        &self.name
    }
    fn channels(&self) -> &[Arc<AcquisitionChannel>] {
        &self.channels
    }
    fn events(&self) -> &DeviceEvents {
        &self.events
    }
    fn create_iterator(&self) -> ScanResult<Box<dyn DeviceIterator>> {
        Ok(Box::new(FailingIterator {
            fail_at: self.fail_at,
            message: self.message.clone(),
        }))
    }
}

struct FailingIterator {
    fail_at: FailAt,
    message: String,
}

impl FailingIterator {
    fn fail_if(&self, phase: FailAt) -> ScanResult<()> {
        if self.fail_at == phase {
            Err(ScanError::Acquisition(self.message.clone()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DeviceIterator for FailingIterator {
    async fn apply_parameters(&mut self) -> ScanResult<()> {
        self.fail_if(FailAt::ApplyParameters)
    }
    async fn prepare(&mut self, _scan_info: &ScanInfo) -> ScanResult<()> {
        self.fail_if(FailAt::Prepare)
    }
    async fn start(&mut self) -> ScanResult<()> {
        self.fail_if(FailAt::Start)
    }
    async fn next_step(&mut self) -> ScanResult<Option<Box<dyn AcquisitionStep>>> {
        Ok(None)
    }
    async fn stop(&mut self) -> ScanResult<()> {
        self.fail_if(FailAt::Stop)
    }
}
