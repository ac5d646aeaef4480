//! Scan metadata handling.
//!
//! Every scan carries a `ScanInfo`, a mutable JSON-object mapping that
//! accumulates the title, timestamps, the acquisition-chain description,
//! user/controller metadata snapshots and the final state over the scan's
//! lifetime. It is shared between the orchestrator, the watchdog, presets
//! and the writer, so it is a cheaply clonable handle over interior state.
//!
//! External metadata producers implement [`MetadataSource`] and are
//! evaluated at three timing points: when the scan is prepared, when it
//! starts and when it ends.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::{Arc, RwLock};

/// Timing points at which [`MetadataSource`]s are evaluated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetaTiming {
    Prepared,
    Start,
    End,
}

/// A producer of metadata snapshots (user or controller supplied).
pub trait MetadataSource: Send + Sync {
    /// Category key the snapshot is merged under (e.g. "instrument").
    fn category(&self) -> &str;

    /// Produce the metadata for one timing point. Returning an empty map
    /// contributes nothing for that point.
    fn collect(&self, timing: MetaTiming) -> Map<String, Value>;
}

/// Shared, mutable metadata mapping for one scan.
#[derive(Clone, Debug, Default)]
pub struct ScanInfo {
    inner: Arc<RwLock<Map<String, Value>>>,
}

impl ScanInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(map)),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.read().ok()?.get(key).cloned()
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key)?.as_bool()
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) {
        if let Ok(mut map) = self.inner.write() {
            map.insert(key.to_string(), value.into());
        }
    }

    /// Insert `value` only if `key` is not present yet.
    pub fn set_default(&self, key: &str, value: impl Into<Value>) {
        if let Ok(mut map) = self.inner.write() {
            map.entry(key.to_string()).or_insert_with(|| value.into());
        }
    }

    /// Deep-merge `update` into the mapping: nested objects are merged
    /// recursively, everything else is replaced.
    pub fn update(&self, update: Map<String, Value>) {
        if let Ok(mut map) = self.inner.write() {
            deep_update(&mut map, update);
        }
    }

    /// Merge one metadata-source snapshot under its category key.
    pub fn merge_category(&self, category: &str, snapshot: Map<String, Value>) {
        if snapshot.is_empty() {
            return;
        }
        let mut wrapper = Map::new();
        wrapper.insert(category.to_string(), Value::Object(snapshot));
        self.update(wrapper);
    }

    /// A point-in-time copy of the whole mapping.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.inner.read().map(|map| map.clone()).unwrap_or_default()
    }
}

fn deep_update(target: &mut Map<String, Value>, update: Map<String, Value>) {
    for (key, value) in update {
        match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_update(existing, incoming);
            }
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}
