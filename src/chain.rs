//! The acquisition chain: the tree of devices participating in one scan.
//!
//! A chain is a tree of acquisition devices. Top-level nodes are *masters*:
//! they own an iterator driving the apply-parameters/prepare/start/stop
//! protocol and may carry the *terminator* flag, meaning their completion
//! ends the whole run phase. Inner nodes may be masters or *slaves*
//! (leaves). Every device exposes data channels.
//!
//! The chain is fixed once a scan has been constructed. Channel names are
//! made unique in the scope of the scan at that point: a colliding name is
//! rewritten to `device:name`, and if that collides too, to a form carrying
//! the channel's object identity.

use crate::error::{ScanError, ScanResult};
use crate::events::{ChannelDataEvent, ChannelEvents, DeviceEvents};
use crate::metadata::ScanInfo;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Arc, RwLock};

/// One data stream of a device.
pub struct AcquisitionChannel {
    short_name: String,
    name: RwLock<String>,
    unit: Option<String>,
    shape: Vec<usize>,
    dtype: String,
    events: ChannelEvents,
}

impl AcquisitionChannel {
    pub fn new(short_name: impl Into<String>) -> Arc<Self> {
        let short_name = short_name.into();
        Arc::new(Self {
            name: RwLock::new(short_name.clone()),
            short_name,
            unit: None,
            shape: Vec::new(),
            dtype: "f64".to_string(),
            events: ChannelEvents::default(),
        })
    }

    pub fn with_unit(short_name: impl Into<String>, unit: impl Into<String>) -> Arc<Self> {
        let short_name = short_name.into();
        Arc::new(Self {
            name: RwLock::new(short_name.clone()),
            short_name,
            unit: Some(unit.into()),
            shape: Vec::new(),
            dtype: "f64".to_string(),
            events: ChannelEvents::default(),
        })
    }

    /// Name as rewritten for uniqueness within the scan.
    pub fn name(&self) -> String {
        self.name
            .read()
            .map(|name| name.clone())
            .unwrap_or_else(|_| self.short_name.clone())
    }

    pub fn short_name(&self) -> &str {
        &self.short_name
    }

    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> &str {
        &self.dtype
    }

    pub fn events(&self) -> &ChannelEvents {
        &self.events
    }

    pub(crate) fn set_name(&self, name: String) {
        if let Ok(mut slot) = self.name.write() {
            *slot = name;
        }
    }

    /// Publish a batch of values on this channel.
    pub fn emit_data(&self, values: Vec<f64>) {
        let event = ChannelDataEvent {
            channel: self.name(),
            values,
        };
        self.events.new_data.emit(&event);
    }
}

impl std::fmt::Debug for AcquisitionChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionChannel")
            .field("name", &self.name())
            .field("unit", &self.unit)
            .finish()
    }
}

/// Motion capability of a device, used to restore positions after a scan.
#[async_trait]
pub trait Positioner: Send + Sync {
    /// Current (set-point) position.
    fn position(&self) -> f64;

    /// Move to an absolute position.
    async fn move_to(&self, position: f64) -> ScanResult<()>;

    /// Calculated (virtual) axes are excluded from position restore.
    fn is_calculated(&self) -> bool {
        false
    }
}

/// A controllable device taking part in a scan.
pub trait AcquisitionDevice: Send + Sync {
    fn name(&self) -> &str;

    fn channels(&self) -> &[Arc<AcquisitionChannel>];

    fn events(&self) -> &DeviceEvents;

    /// Motion capability, if this device is an axis.
    fn as_positioner(&self) -> Option<&dyn Positioner> {
        None
    }

    /// Create the iterator driving this device through a scan. Only
    /// top-level masters are asked for one.
    fn create_iterator(&self) -> ScanResult<Box<dyn DeviceIterator>> {
        Err(ScanError::Acquisition(format!(
            "device '{}' does not provide a scan iterator",
            self.name()
        )))
    }
}

/// Runtime driver sequencing one top-level device through the scan phases.
#[async_trait]
pub trait DeviceIterator: Send {
    /// Push the configured parameters onto the hardware.
    async fn apply_parameters(&mut self) -> ScanResult<()>;

    /// Prepare for acquisition, given the scan metadata.
    async fn prepare(&mut self, scan_info: &ScanInfo) -> ScanResult<()>;

    /// Begin acquisition.
    async fn start(&mut self) -> ScanResult<()>;

    /// Produce the next sub-step, or `None` when iteration is complete.
    async fn next_step(&mut self) -> ScanResult<Option<Box<dyn AcquisitionStep>>>;

    /// Stop acquisition. Always called during teardown.
    async fn stop(&mut self) -> ScanResult<()>;
}

/// One sub-step yielded by a [`DeviceIterator`] during the run phase.
#[async_trait]
pub trait AcquisitionStep: Send {
    async fn prepare(&mut self, scan_info: &ScanInfo) -> ScanResult<()>;
    async fn start(&mut self) -> ScanResult<()>;
}

/// A device iterator shared between the run and stop phases.
pub type SharedIterator = Arc<tokio::sync::Mutex<Box<dyn DeviceIterator>>>;

struct ChainEntry {
    device: Arc<dyn AcquisitionDevice>,
    parent: Option<usize>,
    master: bool,
    terminator: bool,
}

/// The tree of devices participating in one scan.
#[derive(Default)]
pub struct AcquisitionChain {
    entries: Vec<ChainEntry>,
}

impl AcquisitionChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a top-level master. `terminator` marks that its iterator's
    /// completion ends the run phase.
    pub fn add_master(&mut self, device: Arc<dyn AcquisitionDevice>, terminator: bool) {
        self.entries.push(ChainEntry {
            device,
            parent: None,
            master: true,
            terminator,
        });
    }

    /// Add a nested master below `parent`.
    pub fn add_sub_master(
        &mut self,
        parent: &str,
        device: Arc<dyn AcquisitionDevice>,
    ) -> ScanResult<()> {
        let parent = self.index_of(parent)?;
        self.entries.push(ChainEntry {
            device,
            parent: Some(parent),
            master: true,
            terminator: false,
        });
        Ok(())
    }

    /// Add a leaf device below `parent`.
    pub fn add_slave(
        &mut self,
        parent: &str,
        device: Arc<dyn AcquisitionDevice>,
    ) -> ScanResult<()> {
        let parent = self.index_of(parent)?;
        self.entries.push(ChainEntry {
            device,
            parent: Some(parent),
            master: false,
            terminator: false,
        });
        Ok(())
    }

    fn index_of(&self, name: &str) -> ScanResult<usize> {
        self.entries
            .iter()
            .position(|entry| entry.device.name() == name)
            .ok_or_else(|| {
                ScanError::Acquisition(format!("device '{name}' is not part of this chain"))
            })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Top-level masters with their terminator flags.
    pub fn top_masters(&self) -> Vec<(Arc<dyn AcquisitionDevice>, bool)> {
        self.entries
            .iter()
            .filter(|entry| entry.parent.is_none())
            .map(|entry| (entry.device.clone(), entry.terminator))
            .collect()
    }

    /// All devices in depth-first order.
    pub fn devices(&self) -> Vec<Arc<dyn AcquisitionDevice>> {
        self.depth_first()
            .into_iter()
            .map(|idx| self.entries[idx].device.clone())
            .collect()
    }

    /// All channels of all devices, in depth-first device order.
    pub fn channels(&self) -> Vec<Arc<AcquisitionChannel>> {
        self.devices()
            .iter()
            .flat_map(|device| device.channels().iter().cloned())
            .collect()
    }

    pub fn find_device(&self, name: &str) -> Option<Arc<dyn AcquisitionDevice>> {
        self.entries
            .iter()
            .find(|entry| entry.device.name() == name)
            .map(|entry| entry.device.clone())
    }

    /// Depth of a device, 1 for top-level nodes.
    fn depth(&self, mut idx: usize) -> usize {
        let mut depth = 1;
        while let Some(parent) = self.entries[idx].parent {
            depth += 1;
            idx = parent;
        }
        depth
    }

    /// Devices grouped by depth level in ascending order. Each item is
    /// `(device, parent_device)`; parents always appear in a level before
    /// any of their children.
    pub fn levels(&self) -> Vec<Vec<(Arc<dyn AcquisitionDevice>, Option<Arc<dyn AcquisitionDevice>>)>> {
        let mut levels: Vec<Vec<(Arc<dyn AcquisitionDevice>, Option<Arc<dyn AcquisitionDevice>>)>> =
            Vec::new();
        for idx in 0..self.entries.len() {
            let depth = self.depth(idx);
            while levels.len() < depth {
                levels.push(Vec::new());
            }
            let parent = self.entries[idx]
                .parent
                .map(|p| self.entries[p].device.clone());
            levels[depth - 1].push((self.entries[idx].device.clone(), parent));
        }
        levels
    }

    fn depth_first(&self) -> Vec<usize> {
        fn visit(chain: &AcquisitionChain, idx: usize, out: &mut Vec<usize>) {
            out.push(idx);
            for (child, entry) in chain.entries.iter().enumerate() {
                if entry.parent == Some(idx) {
                    visit(chain, child, out);
                }
            }
        }
        let mut out = Vec::new();
        for (idx, entry) in self.entries.iter().enumerate() {
            if entry.parent.is_none() {
                visit(self, idx, &mut out);
            }
        }
        out
    }

    /// Make channel names unique in the scope of this scan.
    ///
    /// Walks devices depth-first. A channel whose name was already seen is
    /// renamed to `device:name`; if that is taken as well it falls back to
    /// a name carrying the channel's object identity, which is unique but
    /// not stable across runs.
    pub fn make_channel_names_unique(&self) {
        let mut seen: Vec<String> = Vec::new();
        for idx in self.depth_first() {
            let device = &self.entries[idx].device;
            for channel in device.channels() {
                let current = channel.name();
                if seen.contains(&current) {
                    let mut new_name = format!("{}:{}", device.name(), current);
                    if seen.contains(&new_name) {
                        let identity = Arc::as_ptr(channel) as usize;
                        new_name = format!("{identity}:{current}");
                    }
                    channel.set_name(new_name);
                }
                seen.push(channel.name());
            }
        }
    }

    /// JSON description of the tree, recorded in the scan metadata.
    pub fn description(&self) -> Value {
        fn describe(chain: &AcquisitionChain, idx: usize) -> Value {
            let entry = &chain.entries[idx];
            let children: Vec<Value> = chain
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.parent == Some(idx))
                .map(|(child, _)| describe(chain, child))
                .collect();
            json!({
                "name": entry.device.name(),
                "kind": if entry.master { "master" } else { "slave" },
                "terminator": entry.terminator,
                "channels": entry
                    .device
                    .channels()
                    .iter()
                    .map(|c| c.name())
                    .collect::<Vec<_>>(),
                "children": children,
            })
        }

        let tops: Vec<Value> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.parent.is_none())
            .map(|(idx, _)| describe(self, idx))
            .collect();
        Value::Array(tops)
    }
}

impl std::fmt::Debug for AcquisitionChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionChain")
            .field("devices", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BareDevice {
        name: String,
        channels: Vec<Arc<AcquisitionChannel>>,
        events: DeviceEvents,
    }

    impl BareDevice {
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

    impl AcquisitionDevice for BareDevice {
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

    fn two_level_chain() -> (AcquisitionChain, Arc<BareDevice>, Arc<BareDevice>) {
        let master = BareDevice::new("timer", &["elapsed"]);
        let slave = BareDevice::new("diode", &["intensity"]);
        let mut chain = AcquisitionChain::new();
        chain.add_master(master.clone(), true);
        chain.add_slave("timer", slave.clone()).expect("parent exists");
        (chain, master, slave)
    }

    #[test]
    fn test_levels_parent_before_child() {
        let (chain, _, _) = two_level_chain();
        let levels = chain.levels();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0][0].0.name(), "timer");
        assert_eq!(levels[1][0].0.name(), "diode");
        assert_eq!(
            levels[1][0].1.as_ref().map(|d| d.name().to_string()),
            Some("timer".to_string())
        );
    }

    #[test]
    fn test_top_masters_and_terminator() {
        let (chain, _, _) = two_level_chain();
        let tops = chain.top_masters();
        assert_eq!(tops.len(), 1);
        assert!(tops[0].1);
    }

    #[test]
    fn test_collision_renames_to_device_prefixed_name() {
        let p1 = BareDevice::new("p1", &["x"]);
        let p2 = BareDevice::new("p2", &["x"]);
        let mut chain = AcquisitionChain::new();
        chain.add_master(p1.clone(), false);
        chain.add_master(p2.clone(), false);

        chain.make_channel_names_unique();

        assert_eq!(p1.channels()[0].name(), "x");
        assert_eq!(p2.channels()[0].name(), "p2:x");
    }

    #[test]
    fn test_collision_falls_back_to_identity() {
        // "p2:x" is already taken by an actual channel of that name, so the
        // second "x" under p2 must fall back to an identity-based name.
        let p1 = BareDevice::new("p1", &["x", "p2:x"]);
        let p2 = BareDevice::new("p2", &["x"]);
        let mut chain = AcquisitionChain::new();
        chain.add_master(p1, false);
        chain.add_master(p2.clone(), false);

        chain.make_channel_names_unique();

        let renamed = p2.channels()[0].name();
        assert_ne!(renamed, "x");
        assert_ne!(renamed, "p2:x");
        assert!(renamed.ends_with(":x"));
    }

    #[test]
    fn test_description_structure() {
        let (chain, _, _) = two_level_chain();
        let desc = chain.description();
        let tops = desc.as_array().expect("array of top masters");
        assert_eq!(tops.len(), 1);
        assert_eq!(tops[0]["name"], "timer");
        assert_eq!(tops[0]["children"][0]["name"], "diode");
        assert_eq!(tops[0]["terminator"], true);
    }

    #[test]
    fn test_unknown_parent_is_an_error() {
        let mut chain = AcquisitionChain::new();
        let dev = BareDevice::new("lonely", &[]);
        assert!(chain.add_slave("missing", dev).is_err());
    }
}
