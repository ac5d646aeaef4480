//! The scan orchestrator.
//!
//! A `Scan` publishes the data of one acquisition run and guarantees
//! deterministic teardown. `run` enters a fixed stack of scoped resources
//! (state tracking, motor-position restore, saving and numbering, node
//! creation, write buffering, watchdog, progress, output suppression and
//! finally the scan loop) and leaves them in exact reverse order whatever
//! happens inside. Each scope's teardown runs in its own error capture, so
//! a failing step never prevents the outer steps from running; the first
//! captured failure decides the final state and is re-raised once teardown
//! has completed.
//!
//! Optional scopes (motor restore, watchdog, progress) are part of the
//! stack as no-ops when not configured, so the enter/exit order never
//! changes shape at runtime.
//!
//! Inside the scan loop the [`ScanIterationsRunner`] drives the device
//! tree through the four-phase protocol while the watchdog observes data
//! events concurrently.

use crate::cancel::AbortToken;
use crate::chain::{AcquisitionChain, AcquisitionChannel, AcquisitionDevice, SharedIterator};
use crate::config::Settings;
use crate::console::SuppressGuard;
use crate::error::{ErrorCapture, ScanError, ScanResult};
use crate::events::{ChannelDataEvent, DeviceEvent, SubscriptionId};
use crate::metadata::{MetaTiming, MetadataSource, ScanInfo};
use crate::pipeline::{FlushPolicy, RotatingPipeline};
use crate::preset::{execute_presets, PresetHandle, PresetStage, ScanPreset};
use crate::progress::ScanProgress;
use crate::runner::{ChainIterTask, RunPayload, ScanIterationsRunner};
use crate::saving::{
    ScanSaving, ScanWriter, SCAN_NUMBER_KEY, SCAN_NUMBER_LOCK, SHADOW_SCAN_NUMBER_KEY,
};
use crate::state::{ScanState, StateCell};
use crate::store::{DataStore, MemoryStore, NodeHandle, NodeSpec, NodeType, SharedNodes};
use crate::watchdog::{ScanView, WatchdogCallback, WatchdogHandle, WatchdogTask};
use once_cell::sync::Lazy;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Store used by scans that were not given one explicitly. Shared by the
/// whole process so scan numbering is global, like the real backend.
static DEFAULT_STORE: Lazy<Arc<MemoryStore>> = Lazy::new(MemoryStore::new);

/// The ordered scope stack of `Scan::run`. Optional scopes stay in the
/// list and turn into no-ops, so enter/exit order is fixed.
const SCOPE_STACK: [Scope; 10] = [
    Scope::State,
    Scope::MotorRestore,
    Scope::Saving,
    Scope::Node,
    Scope::Pipeline,
    Scope::Watchdog,
    Scope::WatchdogCallback,
    Scope::Progress,
    Scope::Output,
    Scope::Runner,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Scope {
    State,
    MotorRestore,
    Saving,
    Node,
    Pipeline,
    Watchdog,
    WatchdogCallback,
    Progress,
    Output,
    Runner,
}

/// Builder for [`Scan`]; the constructor surface of the orchestrator.
pub struct ScanBuilder {
    chain: AcquisitionChain,
    name: String,
    scan_info: Map<String, Value>,
    save: bool,
    save_images: Option<bool>,
    scan_saving: Option<ScanSaving>,
    watchdog_callback: Option<Arc<dyn WatchdogCallback>>,
    scan_progress: Option<Arc<dyn ScanProgress>>,
    store: Option<Arc<dyn DataStore>>,
    metadata_sources: Vec<Arc<dyn MetadataSource>>,
    flush_policy: Option<FlushPolicy>,
}

impl ScanBuilder {
    pub fn new(chain: AcquisitionChain, name: &str) -> Self {
        Self {
            chain,
            name: name.to_string(),
            scan_info: Map::new(),
            save: true,
            save_images: None,
            scan_saving: None,
            watchdog_callback: None,
            scan_progress: None,
            store: None,
            metadata_sources: Vec::new(),
            flush_policy: None,
        }
    }

    pub fn scan_info(mut self, scan_info: Map<String, Value>) -> Self {
        self.scan_info = scan_info;
        self
    }

    pub fn save(mut self, save: bool) -> Self {
        self.save = save;
        self
    }

    /// `None` follows `save`.
    pub fn save_images(mut self, save_images: bool) -> Self {
        self.save_images = Some(save_images);
        self
    }

    pub fn scan_saving(mut self, saving: ScanSaving) -> Self {
        self.scan_saving = Some(saving);
        self
    }

    pub fn watchdog_callback(mut self, callback: Arc<dyn WatchdogCallback>) -> Self {
        self.watchdog_callback = Some(callback);
        self
    }

    pub fn scan_progress(mut self, progress: Arc<dyn ScanProgress>) -> Self {
        self.scan_progress = Some(progress);
        self
    }

    pub fn store(mut self, store: Arc<dyn DataStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn metadata_source(mut self, source: Arc<dyn MetadataSource>) -> Self {
        self.metadata_sources.push(source);
        self
    }

    pub fn flush_policy(mut self, policy: FlushPolicy) -> Self {
        self.flush_policy = Some(policy);
        self
    }

    pub fn build(self) -> Scan {
        Scan::from_builder(self)
    }
}

/// Orchestrates one scan run over an acquisition chain.
///
/// A `Scan` is single-use: calling [`run`](Scan::run) a second time fails.
pub struct Scan {
    name: String,
    uid: String,
    save: bool,
    shadow_scan_number: bool,
    enable_scanmeta: bool,
    scan_number: Option<u64>,
    chain: AcquisitionChain,
    shared: Arc<ScanView>,
    state: StateCell,
    saving: ScanSaving,
    writer: Box<dyn ScanWriter>,
    store: Arc<dyn DataStore>,
    flush_policy: FlushPolicy,
    pipeline: Option<Arc<RotatingPipeline>>,
    watchdog_callback: Option<Arc<dyn WatchdogCallback>>,
    watchdog: Option<WatchdogHandle>,
    watchdog_task: Option<JoinHandle<ScanResult<()>>>,
    progress: Option<Arc<dyn ScanProgress>>,
    progress_task: Option<JoinHandle<ScanResult<()>>>,
    presets: Vec<Arc<tokio::sync::Mutex<PresetHandle>>>,
    metadata_sources: Vec<Arc<dyn MetadataSource>>,
    comments: Vec<Value>,
    abort: AbortToken,
    restore_motor_positions: bool,
    motor_snapshot: Vec<(Arc<dyn AcquisitionDevice>, f64)>,
    node: Option<NodeHandle>,
    device_subs: Vec<(Arc<dyn AcquisitionDevice>, SubscriptionId, SubscriptionId)>,
    channel_subs: Vec<(Arc<AcquisitionChannel>, SubscriptionId)>,
    suppress_guard: Option<SuppressGuard>,
    runner: Option<ScanIterationsRunner>,
}

impl Scan {
    pub fn builder(chain: AcquisitionChain, name: &str) -> ScanBuilder {
        ScanBuilder::new(chain, name)
    }

    /// Scan with default saving policy and store.
    pub fn new(chain: AcquisitionChain, name: &str) -> Self {
        ScanBuilder::new(chain, name).build()
    }

    fn from_builder(builder: ScanBuilder) -> Self {
        let ScanBuilder {
            chain,
            name,
            scan_info,
            save,
            save_images,
            scan_saving,
            watchdog_callback,
            scan_progress,
            store,
            metadata_sources,
            flush_policy,
        } = builder;

        // Independent initialization.
        chain.make_channel_names_unique();
        let saving = scan_saving.unwrap_or_else(|| {
            ScanSaving::from_settings(&Settings::default().saving)
        });
        let store: Arc<dyn DataStore> = match store {
            Some(store) => store,
            None => DEFAULT_STORE.clone(),
        };

        let nonsaved_ct = scan_info.get("type").and_then(Value::as_str) == Some("ct") && !save;

        let info = ScanInfo::from_map(scan_info);
        let uid = uuid::Uuid::new_v4().to_string();

        // Dependent initialization: metadata snapshot, then the writer.
        info.set_default("title", name.clone());
        info.set("session_name", saving.session.clone());
        info.set("user_name", saving.user_name.clone());
        info.set("data_policy", saving.data_policy.clone());
        info.set("shadow_scan_number", !save);
        info.set("save", save);
        info.set("publisher", "daq-scan");
        info.set("publisher_version", env!("CARGO_PKG_VERSION"));
        info.set("uid", uid.clone());
        info.set("acquisition_chain", chain.description());

        let save_images = save_images.unwrap_or(save);
        let writer = saving.create_writer(&name, save, save_images);

        let shared = Arc::new(ScanView {
            nodes: SharedNodes::default(),
            scan_info: info,
        });

        Self {
            name,
            uid,
            save,
            shadow_scan_number: !save,
            enable_scanmeta: !nonsaved_ct,
            scan_number: None,
            chain,
            shared,
            state: StateCell::new(),
            saving,
            writer,
            store,
            flush_policy: flush_policy
                .unwrap_or_else(|| Settings::default().pipeline.flush_policy()),
            pipeline: None,
            watchdog_callback,
            watchdog: None,
            watchdog_task: None,
            progress: scan_progress,
            progress_task: None,
            presets: Vec::new(),
            metadata_sources,
            comments: Vec::new(),
            abort: AbortToken::new(),
            restore_motor_positions: false,
            motor_snapshot: Vec::new(),
            node: None,
            device_subs: Vec::new(),
            channel_subs: Vec::new(),
            suppress_guard: None,
            runner: None,
        }
    }

    // Accessors -----------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn state(&self) -> ScanState {
        self.state.get()
    }

    pub fn scan_info(&self) -> &ScanInfo {
        &self.shared.scan_info
    }

    pub fn acq_chain(&self) -> &AcquisitionChain {
        &self.chain
    }

    /// Storage handle of the scan's own node, once created.
    pub fn node(&self) -> Option<&NodeHandle> {
        self.node.as_ref()
    }

    /// Snapshot of the device/channel storage handles. Keys are device and
    /// channel names (channel names are unique after chain construction;
    /// device names must not collide with them).
    pub fn nodes(&self) -> std::collections::HashMap<String, NodeHandle> {
        self.shared
            .nodes
            .read()
            .map(|nodes| nodes.clone())
            .unwrap_or_default()
    }

    /// Formatted scan number, or the unresolved placeholder.
    pub fn scan_number(&self) -> String {
        match self.scan_number {
            Some(number) => self.saving.format_scan_number(number),
            None => "{scan_number}".to_string(),
        }
    }

    pub fn scan_saving(&self) -> &ScanSaving {
        &self.saving
    }

    /// Token that aborts this scan from any task.
    pub fn abort_token(&self) -> AbortToken {
        self.abort.clone()
    }

    /// Request the abort of a running scan.
    pub fn abort(&self) {
        self.abort.abort();
    }

    /// Whether to restore the initial motor positions at the end of the
    /// run (for relative scans).
    pub fn restore_motor_positions(&self) -> bool {
        self.restore_motor_positions
    }

    pub fn set_restore_motor_positions(&mut self, restore: bool) {
        self.restore_motor_positions = restore;
    }

    pub fn add_preset(&mut self, preset: Arc<dyn ScanPreset>) {
        self.presets
            .push(Arc::new(tokio::sync::Mutex::new(PresetHandle::new(preset))));
    }

    /// Install or clear the watchdog callback. Only effective before `run`.
    pub fn set_watchdog_callback(&mut self, callback: Option<Arc<dyn WatchdogCallback>>) {
        self.watchdog_callback = callback;
    }

    /// Block until the scan has reached at least `target`.
    pub async fn wait_state(&self, target: ScanState) {
        self.state.wait(target).await;
    }

    /// Watch channel mirroring the scan state, for external observers.
    pub fn state_watch(&self) -> tokio::sync::watch::Receiver<ScanState> {
        self.state.subscribe()
    }

    pub fn comments(&self) -> &[Value] {
        &self.comments
    }

    /// Attach a timestamped comment; recorded in the metadata and saved
    /// with the scan. Rejected once the scan has terminated.
    pub fn add_comment(&mut self, comment: &str) -> ScanResult<()> {
        if self.state.get() >= ScanState::Done {
            return Err(ScanError::Sequence(
                "comments can only be added to scans that have not terminated".into(),
            ));
        }
        let entry = json!({
            "timestamp": chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
            "message": comment,
        });
        self.comments.push(entry);
        self.scan_info()
            .set("comments", Value::Array(self.comments.clone()));
        if self.state.get() != ScanState::Idle {
            if let Some(node) = &self.node {
                let _ = node.set_info("comments", Value::Array(self.comments.clone()));
            }
        }
        Ok(())
    }

    // Data access ---------------------------------------------------------

    /// Aggregate the stored channel arrays of this scan.
    ///
    /// Falls back to the writer's durable copy when live storage has
    /// expired; unsaved scans have no durable copy and fail instead.
    pub fn get_data(&self) -> ScanResult<ScanData> {
        let channels = self.chain.channels();
        let mut data = BTreeMap::new();
        let mut expired = false;
        {
            let nodes = self
                .shared
                .nodes
                .read()
                .map_err(|_| ScanError::Storage("nodes lock poisoned".into()))?;
            for channel in &channels {
                let name = channel.name();
                let Some(handle) = nodes.get(&name) else {
                    continue;
                };
                match handle.read() {
                    Ok(values) => {
                        data.insert(name, values);
                    }
                    Err(ScanError::DataExpired) => {
                        expired = true;
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }
        }
        if expired {
            if !self.save {
                return Err(ScanError::Storage(
                    "unsaved scan has expired in live storage, use saved scans for later access"
                        .into(),
                ));
            }
            data.clear();
            for channel in &channels {
                let name = channel.name();
                data.insert(name.clone(), self.writer.read_channel(&name)?);
            }
        }
        Ok(ScanData { data })
    }

    /// Axis position of the counter's maximum.
    pub fn peak(&self, counter: &str, axis: &str) -> ScanResult<f64> {
        let data = self.get_data()?;
        crate::math::peak(data.get(axis)?, data.get(counter)?)
    }

    /// Axis position of the counter's minimum.
    pub fn trough(&self, counter: &str, axis: &str) -> ScanResult<f64> {
        let data = self.get_data()?;
        crate::math::trough(data.get(axis)?, data.get(counter)?)
    }

    /// Center of mass of the counter along the axis.
    pub fn com(&self, counter: &str, axis: &str) -> ScanResult<f64> {
        let data = self.get_data()?;
        crate::math::com(data.get(axis)?, data.get(counter)?)
    }

    /// Center position at half maximum.
    pub fn cen(&self, counter: &str, axis: &str) -> ScanResult<f64> {
        let data = self.get_data()?;
        Ok(crate::math::cen(data.get(axis)?, data.get(counter)?)?.0)
    }

    /// Full width at half maximum.
    pub fn fwhm(&self, counter: &str, axis: &str) -> ScanResult<f64> {
        let data = self.get_data()?;
        Ok(crate::math::cen(data.get(axis)?, data.get(counter)?)?.1)
    }

    // State ---------------------------------------------------------------

    fn set_state(&self, state: ScanState) {
        if self.state.advance(state) {
            // The node can be missing when the change happens before it is
            // constructed, e.g. on an early failure.
            if let Some(node) = &self.node {
                let _ = node.set_info("state", json!(state.to_string()));
            }
            self.scan_info().set("state", state.to_string());
        }
    }

    // Run -----------------------------------------------------------------

    /// Execute the scan.
    ///
    /// Drives the acquisition chain through apply-parameters, prepare,
    /// run and stop while publishing data, then tears everything down in
    /// reverse scope order. The first failure captured anywhere decides
    /// the final state (`UserAborted` for an abort, `Killed` otherwise)
    /// and is returned after teardown has finished.
    pub async fn run(&mut self) -> ScanResult<()> {
        if self.state.get() != ScanState::Idle {
            return Err(ScanError::Reused);
        }

        let mut capture = ErrorCapture::new();
        let mut entered: Vec<Scope> = Vec::new();

        for scope in SCOPE_STACK {
            match self.enter_scope(scope).await {
                Ok(()) => entered.push(scope),
                Err(err) => {
                    capture.push(err);
                    break;
                }
            }
        }

        if entered.len() == SCOPE_STACK.len() {
            let result = self.scan_body().await;
            capture.capture(result);
        }

        for scope in entered.iter().rev() {
            self.exit_scope(*scope, &mut capture).await;
        }

        capture.into_result()
    }

    async fn enter_scope(&mut self, scope: Scope) -> ScanResult<()> {
        match scope {
            Scope::State => Ok(()),
            Scope::MotorRestore => {
                if self.restore_motor_positions {
                    self.snapshot_motor_positions();
                }
                Ok(())
            }
            Scope::Saving => {
                self.init_scan_number().await?;
                self.saving.on_scan_run(!self.shadow_scan_number);
                Ok(())
            }
            Scope::Node => {
                self.metadata_at_scan_start();
                self.create_scan_node()
            }
            Scope::Pipeline => {
                self.pipeline = Some(RotatingPipeline::new(
                    self.store.clone(),
                    self.flush_policy,
                ));
                Ok(())
            }
            Scope::Watchdog => {
                if let Some(callback) = &self.watchdog_callback {
                    let (handle, task) =
                        WatchdogTask::new(callback.clone(), Arc::downgrade(&self.shared));
                    self.watchdog = Some(handle);
                    self.watchdog_task = Some(tokio::spawn(task.run()));
                }
                Ok(())
            }
            Scope::WatchdogCallback => {
                if let Some(watchdog) = self.watchdog.clone() {
                    watchdog.on_scan_new(self.scan_info()).await?;
                }
                Ok(())
            }
            Scope::Progress => {
                if let Some(progress) = self.progress.clone() {
                    progress.on_scan_new(self.scan_info());
                    self.progress_task =
                        Some(tokio::spawn(async move { progress.progress_task().await }));
                }
                Ok(())
            }
            Scope::Output => {
                self.suppress_guard = Some(SuppressGuard::new());
                Ok(())
            }
            Scope::Runner => {
                self.runner = Some(ScanIterationsRunner::new(self.abort.clone()));
                Ok(())
            }
        }
    }

    async fn exit_scope(&mut self, scope: Scope, capture: &mut ErrorCapture) {
        match scope {
            Scope::Runner => {
                // Last chance to guarantee data durability, so this flush
                // raises.
                if let Some(pipeline) = self.pipeline.clone() {
                    capture.capture(pipeline.flush(true));
                }
                self.disconnect_all();
                for handle in self.nodes().into_values() {
                    capture.capture(handle.close());
                }
                capture.capture(execute_presets(&self.presets, PresetStage::Stop).await);
            }
            Scope::Output => {
                self.suppress_guard = None;
            }
            Scope::Progress => {
                if let Some(task) = self.progress_task.take() {
                    if task.is_finished() {
                        match task.await {
                            Ok(result) => capture.capture(result),
                            Err(join_err) => {
                                if let Some(err) = ScanError::from_join(join_err) {
                                    capture.push(err);
                                }
                            }
                        }
                    } else {
                        task.abort();
                        let _ = task.await;
                    }
                }
                if let Some(progress) = &self.progress {
                    progress.on_scan_end(self.scan_info());
                }
            }
            Scope::WatchdogCallback => {
                if let Some(watchdog) = self.watchdog.clone() {
                    capture.capture(watchdog.on_scan_end(self.scan_info()).await);
                }
            }
            Scope::Watchdog => {
                // The run phase may already have consumed (and killed) the
                // task; otherwise kill it here.
                if let Some(task) = self.watchdog_task.take() {
                    task.abort();
                    let _ = task.await;
                }
                self.watchdog = None;
            }
            Scope::Pipeline => {
                self.pipeline = None;
            }
            Scope::Node => {
                self.metadata_at_scan_end();
                if let Some(node) = self.node.clone() {
                    let error = capture
                        .first()
                        .map(ToString::to_string)
                        .unwrap_or_default();
                    capture.capture(node.end(self.scan_info().snapshot(), &error));
                }
                capture.capture(self.set_expiration_time());
                self.store.disable_caching();
            }
            Scope::Saving => {
                let data = self.collect_data_snapshot();
                let info = self.scan_info().clone();
                capture.capture(self.writer.finalize(&info, &data).await);
                capture.capture(self.writer.close().await);
            }
            Scope::MotorRestore => {
                if self.restore_motor_positions {
                    capture.capture(self.restore_motor_snapshot().await);
                }
            }
            Scope::State => {
                let final_state = match capture.first() {
                    None => ScanState::Done,
                    Some(err) if err.is_abort() => ScanState::UserAborted,
                    Some(_) => ScanState::Killed,
                };
                self.set_state(final_state);
            }
        }
    }

    /// The scan loop: the four-phase protocol with preset hooks and device
    /// preparation in between.
    async fn scan_body(&mut self) -> ScanResult<()> {
        let mut runner = self
            .runner
            .take()
            .ok_or_else(|| ScanError::Sequence("runner scope was not entered".into()))?;

        let mut iterators: Vec<(SharedIterator, bool)> = Vec::new();
        for (device, terminator) in self.chain.top_masters() {
            let iterator = device.create_iterator()?;
            iterators.push((Arc::new(tokio::sync::Mutex::new(iterator)), terminator));
        }

        let scan_info = self.scan_info().clone();

        let apply_tasks = iterators
            .iter()
            .map(|(iterator, _)| {
                let iterator = iterator.clone();
                tokio::spawn(async move { iterator.lock().await.apply_parameters().await })
            })
            .collect();
        runner.apply_parameters(apply_tasks).await?;

        self.set_state(ScanState::Preparing);

        let devices = self.chain.devices();
        for handle in &self.presets {
            handle
                .lock()
                .await
                .bind(devices.clone(), scan_info.clone());
        }
        execute_presets(&self.presets, PresetStage::Prepare).await?;

        self.prepare_devices().await?;

        let prepare_tasks = iterators
            .iter()
            .map(|(iterator, _)| {
                let iterator = iterator.clone();
                let scan_info = scan_info.clone();
                tokio::spawn(async move { iterator.lock().await.prepare(&scan_info).await })
            })
            .collect();
        runner.prepare(prepare_tasks).await?;

        self.set_state(ScanState::Starting);

        execute_presets(&self.presets, PresetStage::Start).await?;

        let payload = RunPayload {
            scan_info: scan_info.clone(),
            iterators: iterators
                .iter()
                .map(|(iterator, terminator)| ChainIterTask {
                    iterator: iterator.clone(),
                    terminator: *terminator,
                })
                .collect(),
            watchdog: self.watchdog_task.take(),
        };
        runner.run(payload).await?;

        self.set_state(ScanState::Stopping);

        let stop_tasks = iterators
            .iter()
            .map(|(iterator, _)| {
                let iterator = iterator.clone();
                tokio::spawn(async move { iterator.lock().await.stop().await })
            })
            .collect();
        runner.stop(stop_tasks).await
    }

    // Scan number & node --------------------------------------------------

    async fn init_scan_number(&mut self) -> ScanResult<()> {
        if self.scan_number.is_some() {
            return Err(ScanError::Sequence(
                "the scan number can be initialized only once".into(),
            ));
        }
        let _guard = SCAN_NUMBER_LOCK.lock().await;
        let root = self.saving.root_key();
        let key = if self.shadow_scan_number {
            SHADOW_SCAN_NUMBER_KEY
        } else {
            SCAN_NUMBER_KEY
        };
        let last = self.store.counter(&root, key)?;
        let next = if !self.shadow_scan_number && last.is_none() && self.saving.filename_is_final()
        {
            // Continue numbering from the existing destination file.
            let next = self.writer.last_scan_number()? + 1;
            self.store.set_counter_if_absent(&root, key, next)?;
            next
        } else {
            self.store.incr_counter(&root, key)?
        };
        self.scan_number = Some(next);
        self.writer
            .set_scan_number(next, &self.saving.format_scan_number(next));
        Ok(())
    }

    fn node_name(&self) -> ScanResult<String> {
        let number = self.scan_number.ok_or_else(|| {
            ScanError::Sequence("the scan number is not known yet".into())
        })?;
        let name = format!("{number}_{}", self.name);
        if self.shadow_scan_number {
            Ok(format!("_{name}"))
        } else {
            Ok(name)
        }
    }

    fn create_scan_node(&mut self) -> ScanResult<()> {
        if self.node.is_some() {
            return Err(ScanError::Sequence("the scan node already exists".into()));
        }
        self.store.enable_caching();
        let root = self.saving.root_key();
        let node_name = self.node_name()?;
        let keys = self.store.create_nodes(&[
            NodeSpec {
                name: root.clone(),
                node_type: NodeType::Container,
                parent: None,
                info: Map::new(),
            },
            NodeSpec {
                name: node_name,
                node_type: NodeType::Scan,
                parent: Some(root),
                info: self.scan_info().snapshot(),
            },
        ])?;
        let scan_key = keys
            .into_iter()
            .nth(1)
            .ok_or_else(|| ScanError::Storage("scan node was not created".into()))?;
        self.node = Some(NodeHandle::new(self.store.clone(), scan_key));
        Ok(())
    }

    fn set_expiration_time(&self) -> ScanResult<()> {
        let data_keys: Vec<String> = self
            .nodes()
            .values()
            .map(|handle| handle.key().to_string())
            .collect();
        let mut parent_keys = vec![self.saving.root_key()];
        if let Some(node) = &self.node {
            parent_keys.push(node.key().to_string());
        }
        self.saving
            .set_expiration_time(&self.store, &data_keys, &parent_keys)
    }

    // Device-tree preparation and event wiring ----------------------------

    /// Create the persisted representation of the device tree and wire all
    /// device/channel events.
    ///
    /// All node creations go out in one batch; parent/child announcements
    /// follow level by level, shallowest first, so a consumer never sees a
    /// child before its parent. Event handlers are connected only after
    /// the node mapping is fully populated.
    async fn prepare_devices(&mut self) -> ScanResult<()> {
        let scan_key = self
            .node
            .as_ref()
            .map(|node| node.key().to_string())
            .ok_or_else(|| ScanError::Sequence("scan node does not exist yet".into()))?;

        let levels = self.chain.levels();
        let mut specs: Vec<NodeSpec> = Vec::new();
        let mut device_keys: std::collections::HashMap<String, String> =
            std::collections::HashMap::new();
        let mut channel_keys: Vec<(String, String)> = Vec::new(); // (channel name, key)
        let mut level_links: Vec<(Vec<(String, String)>, Vec<(String, String)>)> = Vec::new();

        for level in &levels {
            let mut parent_links = Vec::new();
            let mut child_links = Vec::new();
            for (device, parent) in level {
                let parent_key = match parent {
                    Some(parent_device) => device_keys
                        .get(parent_device.name())
                        .cloned()
                        .unwrap_or_else(|| scan_key.clone()),
                    None => scan_key.clone(),
                };
                let device_key = format!("{parent_key}:{}", device.name());
                specs.push(NodeSpec {
                    name: device.name().to_string(),
                    node_type: NodeType::Device,
                    parent: Some(parent_key.clone()),
                    info: Map::new(),
                });
                parent_links.push((parent_key, device_key.clone()));
                device_keys.insert(device.name().to_string(), device_key.clone());

                for channel in device.channels() {
                    let mut info = Map::new();
                    info.insert("shape".into(), json!(channel.shape()));
                    info.insert("dtype".into(), json!(channel.dtype()));
                    info.insert("unit".into(), json!(channel.unit()));
                    info.insert("fullname".into(), json!(channel.name()));
                    specs.push(NodeSpec {
                        name: channel.short_name().to_string(),
                        node_type: NodeType::Channel,
                        parent: Some(device_key.clone()),
                        info,
                    });
                    let channel_key = format!("{device_key}:{}", channel.short_name());
                    child_links.push((device_key.clone(), channel_key.clone()));
                    channel_keys.push((channel.name(), channel_key));
                }
            }
            level_links.push((parent_links, child_links));
        }

        // One round trip for every node of the tree.
        self.store.create_nodes(&specs)?;

        // Announce links level by level, parents before children.
        for (parent_links, child_links) in &level_links {
            if !parent_links.is_empty() {
                self.store.link_children(parent_links)?;
            }
            if !child_links.is_empty() {
                self.store.link_children(child_links)?;
            }
        }

        {
            let mut nodes = self
                .shared
                .nodes
                .write()
                .map_err(|_| ScanError::Storage("nodes lock poisoned".into()))?;
            for (name, key) in &device_keys {
                nodes.insert(name.clone(), NodeHandle::new(self.store.clone(), key.clone()));
            }
            for (name, key) in &channel_keys {
                nodes.insert(name.clone(), NodeHandle::new(self.store.clone(), key.clone()));
            }
        }

        self.connect_events()?;

        let scan_info = self.scan_info().clone();
        self.writer.prepare(&scan_info).await?;
        self.merge_metadata(MetaTiming::Prepared);
        if let Some(node) = &self.node {
            node.set_info("prepared", json!(true))?;
        }
        Ok(())
    }

    fn connect_events(&mut self) -> ScanResult<()> {
        let pipeline = self
            .pipeline
            .clone()
            .ok_or_else(|| ScanError::Sequence("pipeline scope was not entered".into()))?;

        for device in self.chain.devices() {
            let start_id = device.events().start.connect(Arc::new(|event: &DeviceEvent| {
                log::debug!("device '{}' started", event.device);
            }));
            let end_id = {
                let pipeline = pipeline.clone();
                let watchdog = self.watchdog.clone();
                device.events().end.connect(Arc::new(move |event: &DeviceEvent| {
                    // A device finished: push its buffered data out, but do
                    // not fail the emitting task over it.
                    let _ = pipeline.flush(false);
                    if let Some(watchdog) = &watchdog {
                        watchdog.trigger_data_event(&event.device, "end");
                    }
                }))
            };
            self.device_subs.push((device, start_id, end_id));
        }

        for channel in self.chain.channels() {
            let handler = {
                let pipeline = pipeline.clone();
                let nodes = self.shared.nodes.clone();
                let watchdog = self.watchdog.clone();
                let channel = channel.clone();
                Arc::new(move |event: &ChannelDataEvent| {
                    let mut proxy = pipeline.async_proxy();
                    if let Ok(nodes) = nodes.read() {
                        if let Some(handle) = nodes.get(&event.channel) {
                            handle.store(event, &mut proxy);
                            let stored = event.clone();
                            let channel = channel.clone();
                            proxy.add_execute_callback(move || {
                                channel.events().new_data_stored.emit(&stored);
                            });
                        }
                    }
                    drop(proxy);
                    if let Some(watchdog) = &watchdog {
                        watchdog.trigger_data_event(&event.channel, "new_data");
                    }
                })
            };
            let id = channel.events().new_data.connect(handler);
            self.channel_subs.push((channel, id));
        }
        Ok(())
    }

    fn disconnect_all(&mut self) {
        for (channel, id) in self.channel_subs.drain(..) {
            channel.events().new_data.disconnect(id);
        }
        for (device, start_id, end_id) in self.device_subs.drain(..) {
            device.events().start.disconnect(start_id);
            device.events().end.disconnect(end_id);
        }
    }

    // Metadata ------------------------------------------------------------

    fn metadata_at_scan_start(&self) {
        let info = self.scan_info();
        info.set("scan_nb", self.scan_number.unwrap_or_default());
        info.set("filename", self.writer.filename().display().to_string());

        let now = chrono::Utc::now();
        info.set("start_time", now.to_rfc3339());
        info.set(
            "start_timestamp",
            now.timestamp_millis() as f64 / 1000.0,
        );
        self.merge_metadata(MetaTiming::Start);
    }

    fn metadata_at_scan_end(&self) {
        let info = self.scan_info();
        let now = chrono::Utc::now();
        info.set("end_time", now.to_rfc3339());
        info.set("end_timestamp", now.timestamp_millis() as f64 / 1000.0);
        self.merge_metadata(MetaTiming::End);
    }

    fn merge_metadata(&self, timing: MetaTiming) {
        if !self.enable_scanmeta {
            return;
        }
        for source in &self.metadata_sources {
            self.scan_info()
                .merge_category(source.category(), source.collect(timing));
        }
    }

    // Motor positions ------------------------------------------------------

    fn snapshot_motor_positions(&mut self) {
        for (device, _) in self.chain.top_masters() {
            let position = {
                let Some(positioner) = device.as_positioner() else {
                    continue;
                };
                if positioner.is_calculated() {
                    continue;
                }
                positioner.position()
            };
            // Axes with an undefined position cannot be restored.
            if position.is_nan() {
                continue;
            }
            self.motor_snapshot.push((device, position));
        }
    }

    async fn restore_motor_snapshot(&mut self) -> ScanResult<()> {
        let snapshot = std::mem::take(&mut self.motor_snapshot);
        let moves = snapshot.iter().filter_map(|(device, position)| {
            device
                .as_positioner()
                .map(|positioner| positioner.move_to(*position))
        });
        let results = futures::future::join_all(moves).await;
        for result in results {
            result?;
        }
        Ok(())
    }

    // Writer support ------------------------------------------------------

    fn collect_data_snapshot(&self) -> BTreeMap<String, Vec<f64>> {
        let mut data = BTreeMap::new();
        let Ok(nodes) = self.shared.nodes.read() else {
            return data;
        };
        for channel in self.chain.channels() {
            let name = channel.name();
            if let Some(handle) = nodes.get(&name) {
                if let Ok(values) = handle.read() {
                    data.insert(name, values);
                }
            }
        }
        data
    }
}

impl std::fmt::Debug for Scan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scan")
            .field("name", &self.name)
            .field("number", &self.scan_number)
            .field("state", &self.state.get())
            .field("save", &self.save)
            .finish()
    }
}

/// Aggregated channel data of one scan.
#[derive(Clone, Debug, Default)]
pub struct ScanData {
    data: BTreeMap<String, Vec<f64>>,
}

impl ScanData {
    /// Look up a channel by full name, or by short name when unambiguous.
    pub fn get(&self, key: &str) -> ScanResult<&[f64]> {
        if let Some(values) = self.data.get(key) {
            return Ok(values);
        }
        let suffix = format!(":{key}");
        let matches: Vec<&String> = self
            .data
            .keys()
            .filter(|name| name.ends_with(&suffix))
            .collect();
        match matches.as_slice() {
            [name] => Ok(&self.data[*name]),
            [] => Err(ScanError::Storage(format!(
                "channel '{key}' not found, available: {:?}",
                self.channel_names()
            ))),
            _ => Err(ScanError::Storage(format!(
                "ambiguous channel '{key}', matches: {matches:?}"
            ))),
        }
    }

    pub fn channel_names(&self) -> Vec<&str> {
        self.data.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_inner(self) -> BTreeMap<String, Vec<f64>> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_data_lookup() {
        let mut data = BTreeMap::new();
        data.insert("diode:intensity".to_string(), vec![1.0]);
        data.insert("timer:elapsed".to_string(), vec![0.0]);
        let data = ScanData { data };

        assert_eq!(data.get("diode:intensity").expect("full name"), &[1.0]);
        assert_eq!(data.get("intensity").expect("short name"), &[1.0]);
        assert!(data.get("missing").is_err());

        let mut ambiguous = BTreeMap::new();
        ambiguous.insert("a:x".to_string(), vec![1.0]);
        ambiguous.insert("b:x".to_string(), vec![2.0]);
        let ambiguous = ScanData { data: ambiguous };
        assert!(ambiguous.get("x").is_err());
    }

    #[tokio::test]
    async fn test_scan_is_single_use() {
        let mut scan = Scan::builder(AcquisitionChain::new(), "empty")
            .save(false)
            .store(MemoryStore::new())
            .build();
        scan.run().await.expect("empty chain runs fine");
        assert!(matches!(scan.run().await, Err(ScanError::Reused)));
    }

    #[tokio::test]
    async fn test_scan_info_carries_identity() {
        let scan = Scan::builder(AcquisitionChain::new(), "a_scan")
            .save(false)
            .store(MemoryStore::new())
            .build();
        let info = scan.scan_info();
        assert_eq!(info.get_str("title").as_deref(), Some("a_scan"));
        assert_eq!(info.get_bool("save"), Some(false));
        assert_eq!(info.get_bool("shadow_scan_number"), Some(true));
        assert_eq!(info.get_str("publisher").as_deref(), Some("daq-scan"));
    }

    #[tokio::test]
    async fn test_comments_rejected_after_termination() {
        let mut scan = Scan::builder(AcquisitionChain::new(), "empty")
            .save(false)
            .store(MemoryStore::new())
            .build();
        scan.add_comment("before").expect("comments allowed before run");
        scan.run().await.expect("run");
        assert!(scan.add_comment("after").is_err());
        assert_eq!(scan.comments().len(), 1);
    }

    #[tokio::test]
    async fn test_scan_number_placeholder_before_allocation() {
        let scan = Scan::builder(AcquisitionChain::new(), "empty")
            .store(MemoryStore::new())
            .build();
        assert_eq!(scan.scan_number(), "{scan_number}");
    }
}
