//! Storage backend interface and the in-process reference implementation.
//!
//! The scan engine does not talk to any concrete database. It publishes
//! through the narrow [`DataStore`] trait: batched node creation (one
//! round trip per pipeline stage), level-batched parent/child announcement,
//! per-channel data appends, end-of-scan bookkeeping and the numbering
//! store used for scan-number allocation.
//!
//! [`MemoryStore`] is the crate's own backend. It keeps everything in
//! process memory and records an event journal, which the test-suite uses
//! to assert ordering guarantees (parents announced before children) and
//! teardown completeness. It can also simulate data expiry and inject
//! end-of-scan failures.

use crate::error::{ScanError, ScanResult};
use crate::events::ChannelDataEvent;
use crate::pipeline::AsyncProxy;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Kind of a persisted node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeType {
    /// Session/sample container above the scans.
    Container,
    Scan,
    Device,
    Channel,
}

/// Description of one node to create.
#[derive(Clone, Debug)]
pub struct NodeSpec {
    /// Short name, appended to the parent key.
    pub name: String,
    pub node_type: NodeType,
    /// Key of the parent node; `None` creates a root-level node.
    pub parent: Option<String>,
    /// Initial info payload (scan metadata, channel shape/dtype/unit, ...).
    pub info: Map<String, Value>,
}

impl NodeSpec {
    pub fn key(&self) -> String {
        match &self.parent {
            Some(parent) => format!("{parent}:{}", self.name),
            None => self.name.clone(),
        }
    }
}

/// Narrow interface to the external storage backend.
pub trait DataStore: Send + Sync {
    /// Create a batch of nodes in one round trip. Returns their keys in
    /// the same order.
    fn create_nodes(&self, specs: &[NodeSpec]) -> ScanResult<Vec<String>>;

    /// Announce parent/child links, one batch per tree level.
    fn link_children(&self, pairs: &[(String, String)]) -> ScanResult<()>;

    /// Append channel data.
    fn append(&self, key: &str, values: &[f64]) -> ScanResult<()>;

    /// Update a single info field of a node.
    fn set_info(&self, key: &str, field: &str, value: Value) -> ScanResult<()>;

    /// Mark a node ended, carrying the final metadata and the description
    /// of the first captured error (empty for a clean scan).
    fn mark_ended(&self, key: &str, info: Map<String, Value>, error: &str) -> ScanResult<()>;

    /// Set the expiration of a set of keys.
    fn set_ttl(&self, keys: &[String], ttl: Duration) -> ScanResult<()>;

    /// Read back the full data of a channel node. Fails with
    /// [`ScanError::DataExpired`] once the live data is gone.
    fn read_channel(&self, key: &str) -> ScanResult<Vec<f64>>;

    /// Close a node, releasing any per-node resources.
    fn close_node(&self, key: &str) -> ScanResult<()>;

    // Numbering store -----------------------------------------------------

    fn counter(&self, parent: &str, field: &str) -> ScanResult<Option<u64>>;

    /// Atomic increment-and-get.
    fn incr_counter(&self, parent: &str, field: &str) -> ScanResult<u64>;

    /// Set the counter only if absent. Returns whether it was set.
    fn set_counter_if_absent(&self, parent: &str, field: &str, value: u64) -> ScanResult<bool>;

    // Read-caching hints --------------------------------------------------

    /// Enable client-side read caching for the duration of a scan.
    fn enable_caching(&self) {}

    /// Disable read caching again at the end of the scan.
    fn disable_caching(&self) {}
}

/// The scan's mapping from device/channel name to storage handle, shared
/// with the event handlers and the watchdog.
pub type SharedNodes = Arc<std::sync::RwLock<HashMap<String, NodeHandle>>>;

/// Handle to one persisted node, owned by the scan's node mapping.
#[derive(Clone)]
pub struct NodeHandle {
    key: String,
    store: Arc<dyn DataStore>,
}

impl NodeHandle {
    pub fn new(store: Arc<dyn DataStore>, key: String) -> Self {
        Self { key, store }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Queue a data event on the write pipeline. The data becomes visible
    /// to readers when the pipeline commits.
    pub fn store(&self, event: &ChannelDataEvent, proxy: &mut AsyncProxy<'_>) {
        proxy.append(&self.key, &event.values);
    }

    pub fn set_info(&self, field: &str, value: Value) -> ScanResult<()> {
        self.store.set_info(&self.key, field, value)
    }

    pub fn end(&self, info: Map<String, Value>, error: &str) -> ScanResult<()> {
        self.store.mark_ended(&self.key, info, error)
    }

    pub fn read(&self) -> ScanResult<Vec<f64>> {
        self.store.read_channel(&self.key)
    }

    pub fn close(&self) -> ScanResult<()> {
        self.store.close_node(&self.key)
    }
}

impl std::fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeHandle").field("key", &self.key).finish()
    }
}

/// Journal entry of the in-memory backend, used by tests to assert ordering.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    NodeCreated { key: String },
    ChildLinked { parent: String, child: String },
    Appended { key: String, count: usize },
    Ended { key: String, error: String },
    TtlSet { key: String },
    Closed { key: String },
    CachingEnabled,
    CachingDisabled,
}

#[derive(Debug, Default)]
struct Record {
    node_type: Option<NodeType>,
    info: Map<String, Value>,
    children: Vec<String>,
    data: Vec<f64>,
    ttl: Option<Duration>,
    ended: bool,
    end_error: String,
    expired: bool,
    closed: u32,
}

/// In-process [`DataStore`] with an observable journal.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Record>>,
    counters: Mutex<HashMap<(String, String), u64>>,
    journal: Mutex<Vec<StoreEvent>>,
    caching: AtomicBool,
    fail_mark_ended: AtomicBool,
    fail_append: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn log(&self, event: StoreEvent) {
        if let Ok(mut journal) = self.journal.lock() {
            journal.push(event);
        }
    }

    fn with_records<R>(&self, f: impl FnOnce(&mut HashMap<String, Record>) -> R) -> ScanResult<R> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| ScanError::Storage("store lock poisoned".into()))?;
        Ok(f(&mut records))
    }

    /// Copy of the event journal.
    pub fn journal(&self) -> Vec<StoreEvent> {
        self.journal.lock().map(|j| j.clone()).unwrap_or_default()
    }

    /// How many times a node has been closed.
    pub fn close_count(&self, key: &str) -> u32 {
        self.records
            .lock()
            .ok()
            .and_then(|records| records.get(key).map(|r| r.closed))
            .unwrap_or(0)
    }

    pub fn node_info(&self, key: &str) -> Option<Map<String, Value>> {
        self.records
            .lock()
            .ok()
            .and_then(|records| records.get(key).map(|r| r.info.clone()))
    }

    pub fn end_error(&self, key: &str) -> Option<String> {
        self.records.lock().ok().and_then(|records| {
            records
                .get(key)
                .filter(|r| r.ended)
                .map(|r| r.end_error.clone())
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records
            .lock()
            .map(|records| records.contains_key(key))
            .unwrap_or(false)
    }

    /// Simulate live-data expiry of every channel node.
    pub fn expire_all(&self) {
        if let Ok(mut records) = self.records.lock() {
            for record in records.values_mut() {
                if record.node_type == Some(NodeType::Channel) {
                    record.expired = true;
                }
            }
        }
    }

    /// Make the next `mark_ended` calls fail (teardown-completeness tests).
    pub fn fail_mark_ended(&self, fail: bool) {
        self.fail_mark_ended.store(fail, Ordering::SeqCst);
    }

    /// Make the next `append` calls fail (pipeline flush error tests).
    pub fn fail_append(&self, fail: bool) {
        self.fail_append.store(fail, Ordering::SeqCst);
    }

    pub fn caching_enabled(&self) -> bool {
        self.caching.load(Ordering::SeqCst)
    }
}

impl DataStore for MemoryStore {
    fn create_nodes(&self, specs: &[NodeSpec]) -> ScanResult<Vec<String>> {
        let keys = self.with_records(|records| {
            let mut keys = Vec::with_capacity(specs.len());
            for spec in specs {
                let key = spec.key();
                let record = records.entry(key.clone()).or_default();
                record.node_type = Some(spec.node_type);
                record.info = spec.info.clone();
                keys.push(key);
            }
            keys
        })?;
        for key in &keys {
            self.log(StoreEvent::NodeCreated { key: key.clone() });
        }
        Ok(keys)
    }

    fn link_children(&self, pairs: &[(String, String)]) -> ScanResult<()> {
        self.with_records(|records| {
            for (parent, child) in pairs {
                records
                    .entry(parent.clone())
                    .or_default()
                    .children
                    .push(child.clone());
            }
        })?;
        for (parent, child) in pairs {
            self.log(StoreEvent::ChildLinked {
                parent: parent.clone(),
                child: child.clone(),
            });
        }
        Ok(())
    }

    fn append(&self, key: &str, values: &[f64]) -> ScanResult<()> {
        if self.fail_append.load(Ordering::SeqCst) {
            return Err(ScanError::Storage("injected append failure".into()));
        }
        self.with_records(|records| {
            records
                .entry(key.to_string())
                .or_default()
                .data
                .extend_from_slice(values);
        })?;
        self.log(StoreEvent::Appended {
            key: key.to_string(),
            count: values.len(),
        });
        Ok(())
    }

    fn set_info(&self, key: &str, field: &str, value: Value) -> ScanResult<()> {
        self.with_records(|records| {
            records
                .entry(key.to_string())
                .or_default()
                .info
                .insert(field.to_string(), value);
        })
    }

    fn mark_ended(&self, key: &str, info: Map<String, Value>, error: &str) -> ScanResult<()> {
        if self.fail_mark_ended.load(Ordering::SeqCst) {
            return Err(ScanError::Storage("injected end-of-scan failure".into()));
        }
        self.with_records(|records| {
            let record = records.entry(key.to_string()).or_default();
            record.info = info;
            record.ended = true;
            record.end_error = error.to_string();
        })?;
        self.log(StoreEvent::Ended {
            key: key.to_string(),
            error: error.to_string(),
        });
        Ok(())
    }

    fn set_ttl(&self, keys: &[String], ttl: Duration) -> ScanResult<()> {
        self.with_records(|records| {
            for key in keys {
                if let Some(record) = records.get_mut(key) {
                    record.ttl = Some(ttl);
                }
            }
        })?;
        for key in keys {
            self.log(StoreEvent::TtlSet { key: key.clone() });
        }
        Ok(())
    }

    fn read_channel(&self, key: &str) -> ScanResult<Vec<f64>> {
        self.with_records(|records| match records.get(key) {
            Some(record) if record.expired => Err(ScanError::DataExpired),
            Some(record) => Ok(record.data.clone()),
            None => Err(ScanError::Storage(format!("unknown node '{key}'"))),
        })?
    }

    fn close_node(&self, key: &str) -> ScanResult<()> {
        self.with_records(|records| {
            records.entry(key.to_string()).or_default().closed += 1;
        })?;
        self.log(StoreEvent::Closed {
            key: key.to_string(),
        });
        Ok(())
    }

    fn counter(&self, parent: &str, field: &str) -> ScanResult<Option<u64>> {
        let counters = self
            .counters
            .lock()
            .map_err(|_| ScanError::Storage("counter lock poisoned".into()))?;
        Ok(counters.get(&(parent.to_string(), field.to_string())).copied())
    }

    fn incr_counter(&self, parent: &str, field: &str) -> ScanResult<u64> {
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| ScanError::Storage("counter lock poisoned".into()))?;
        let slot = counters
            .entry((parent.to_string(), field.to_string()))
            .or_insert(0);
        *slot += 1;
        Ok(*slot)
    }

    fn set_counter_if_absent(&self, parent: &str, field: &str, value: u64) -> ScanResult<bool> {
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| ScanError::Storage("counter lock poisoned".into()))?;
        let key = (parent.to_string(), field.to_string());
        if counters.contains_key(&key) {
            Ok(false)
        } else {
            counters.insert(key, value);
            Ok(true)
        }
    }

    fn enable_caching(&self) {
        self.caching.store(true, Ordering::SeqCst);
        self.log(StoreEvent::CachingEnabled);
    }

    fn disable_caching(&self) {
        self.caching.store(false, Ordering::SeqCst);
        self.log(StoreEvent::CachingDisabled);
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let nodes = self.records.lock().map(|r| r.len()).unwrap_or(0);
        f.debug_struct("MemoryStore").field("nodes", &nodes).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, parent: Option<&str>, node_type: NodeType) -> NodeSpec {
        NodeSpec {
            name: name.to_string(),
            node_type,
            parent: parent.map(str::to_string),
            info: Map::new(),
        }
    }

    #[test]
    fn test_batched_create_returns_keys_in_order() {
        let store = MemoryStore::new();
        let keys = store
            .create_nodes(&[
                spec("session", None, NodeType::Scan),
                spec("timer", Some("session"), NodeType::Device),
                spec("elapsed", Some("session:timer"), NodeType::Channel),
            ])
            .expect("create succeeds");
        assert_eq!(keys, vec!["session", "session:timer", "session:timer:elapsed"]);
        assert!(store.contains("session:timer:elapsed"));
    }

    #[test]
    fn test_append_and_read_roundtrip() {
        let store = MemoryStore::new();
        store.append("ch", &[1.0, 2.0]).expect("append");
        store.append("ch", &[3.0]).expect("append");
        assert_eq!(store.read_channel("ch").expect("read"), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_expired_channel_read_fails() {
        let store = MemoryStore::new();
        store
            .create_nodes(&[spec("ch", None, NodeType::Channel)])
            .expect("create");
        store.append("ch", &[1.0]).expect("append");
        store.expire_all();
        assert!(matches!(
            store.read_channel("ch"),
            Err(ScanError::DataExpired)
        ));
    }

    #[test]
    fn test_numbering_store_semantics() {
        let store = MemoryStore::new();
        assert_eq!(store.counter("root", "last_scan_number").expect("get"), None);
        assert_eq!(store.incr_counter("root", "last_scan_number").expect("incr"), 1);
        assert_eq!(store.incr_counter("root", "last_scan_number").expect("incr"), 2);
        assert!(!store
            .set_counter_if_absent("root", "last_scan_number", 10)
            .expect("setnx"));
        assert!(store
            .set_counter_if_absent("root", "other", 10)
            .expect("setnx"));
        assert_eq!(store.counter("root", "other").expect("get"), Some(10));
    }

    #[test]
    fn test_injected_end_failure() {
        let store = MemoryStore::new();
        store.fail_mark_ended(true);
        assert!(store.mark_ended("scan", Map::new(), "").is_err());
        store.fail_mark_ended(false);
        assert!(store.mark_ended("scan", Map::new(), "boom").is_ok());
        assert_eq!(store.end_error("scan").as_deref(), Some("boom"));
    }

    #[test]
    fn test_journal_records_link_order() {
        let store = MemoryStore::new();
        store
            .link_children(&[("a".into(), "a:b".into())])
            .expect("link");
        store
            .link_children(&[("a:b".into(), "a:b:c".into())])
            .expect("link");
        let journal = store.journal();
        let links: Vec<&StoreEvent> = journal
            .iter()
            .filter(|e| matches!(e, StoreEvent::ChildLinked { .. }))
            .collect();
        assert_eq!(links.len(), 2);
        assert!(matches!(
            links[0],
            StoreEvent::ChildLinked { parent, .. } if parent == "a"
        ));
    }
}
