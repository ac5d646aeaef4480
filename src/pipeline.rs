//! Batching write pipeline for outgoing channel data.
//!
//! Channel data is not committed to the storage backend one event at a
//! time. Events are buffered and flushed in batches, triggered by whichever
//! of three thresholds is reached first: a number of buffered events, a
//! byte volume, or the time elapsed since the first buffered event. A
//! flush can also be forced, which the scan does on device "end" signals
//! and, raising on failure, once at the very end of the scan loop, the
//! last chance to guarantee data durability.
//!
//! Writers obtain a scoped [`AsyncProxy`]: appends and post-commit
//! callbacks queued on the proxy are merged into the pipeline when the
//! proxy goes out of scope, and the callbacks run only after the batch they
//! belong to has been committed. All buffering is synchronous, so a task
//! cancelled at a suspension point can never leave a half-queued event.

use crate::error::{ScanError, ScanResult};
use crate::store::DataStore;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Flush thresholds; whichever is reached first triggers a commit.
#[derive(Clone, Copy, Debug)]
pub struct FlushPolicy {
    /// Maximum number of buffered events.
    pub max_events: usize,
    /// Maximum buffered payload size in bytes. `None` means no byte cap.
    pub max_bytes: Option<usize>,
    /// Maximum time from the first buffered event.
    pub max_time: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        // Keep subscribers waiting at most 200 ms for a partial batch.
        Self {
            max_events: 50,
            max_bytes: None,
            max_time: Duration::from_millis(200),
        }
    }
}

struct PendingAppend {
    key: String,
    values: Vec<f64>,
}

type CommitCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Buffer {
    ops: Vec<PendingAppend>,
    callbacks: Vec<CommitCallback>,
    bytes: usize,
    first_at: Option<Instant>,
}

impl Buffer {
    fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.callbacks.is_empty()
    }
}

/// Double-buffered batching pipeline in front of a [`DataStore`].
pub struct RotatingPipeline {
    store: Arc<dyn DataStore>,
    policy: FlushPolicy,
    buffer: Mutex<Buffer>,
}

impl RotatingPipeline {
    pub fn new(store: Arc<dyn DataStore>, policy: FlushPolicy) -> Arc<Self> {
        Arc::new(Self {
            store,
            policy,
            buffer: Mutex::new(Buffer::default()),
        })
    }

    /// Scoped proxy; queued work is merged into the pipeline when the
    /// proxy is dropped.
    pub fn async_proxy(&self) -> AsyncProxy<'_> {
        AsyncProxy {
            pipeline: self,
            ops: Vec::new(),
            callbacks: Vec::new(),
        }
    }

    /// Commit everything buffered so far.
    ///
    /// With `raise_error` the first commit failure is returned; otherwise
    /// failures are only logged, which is what incidental flushes (device
    /// "end" events) use.
    pub fn flush(&self, raise_error: bool) -> ScanResult<()> {
        let drained = {
            let mut buffer = self
                .buffer
                .lock()
                .map_err(|_| ScanError::Storage("pipeline lock poisoned".into()))?;
            std::mem::take(&mut *buffer)
        };
        self.commit(drained, raise_error)
    }

    fn merge(&self, ops: Vec<PendingAppend>, callbacks: Vec<CommitCallback>) {
        let due = {
            let Ok(mut buffer) = self.buffer.lock() else {
                return;
            };
            if buffer.first_at.is_none() && !ops.is_empty() {
                buffer.first_at = Some(Instant::now());
            }
            buffer.bytes += ops.iter().map(|op| op.values.len() * 8).sum::<usize>();
            buffer.ops.extend(ops);
            buffer.callbacks.extend(callbacks);

            let over_events = buffer.ops.len() >= self.policy.max_events;
            let over_bytes = self
                .policy
                .max_bytes
                .is_some_and(|max| buffer.bytes >= max);
            let over_time = buffer
                .first_at
                .is_some_and(|t| t.elapsed() >= self.policy.max_time);
            if over_events || over_bytes || over_time {
                Some(std::mem::take(&mut *buffer))
            } else {
                None
            }
        };
        if let Some(drained) = due {
            // Threshold flushes never raise; the final explicit flush does.
            let _ = self.commit(drained, false);
        }
    }

    fn commit(&self, buffer: Buffer, raise_error: bool) -> ScanResult<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        let mut first_error: Option<ScanError> = None;
        for op in buffer.ops {
            if let Err(err) = self.store.append(&op.key, &op.values) {
                if first_error.is_none() {
                    first_error = Some(err);
                } else {
                    log::warn!("additional pipeline commit error: {err}");
                }
            }
        }
        match first_error {
            None => {
                for callback in buffer.callbacks {
                    callback();
                }
                Ok(())
            }
            Some(err) if raise_error => Err(err),
            Some(err) => {
                log::warn!("pipeline flush failed: {err}");
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for RotatingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotatingPipeline")
            .field("policy", &self.policy)
            .finish()
    }
}

/// Scoped write handle on the pipeline.
pub struct AsyncProxy<'a> {
    pipeline: &'a RotatingPipeline,
    ops: Vec<PendingAppend>,
    callbacks: Vec<CommitCallback>,
}

impl AsyncProxy<'_> {
    /// Queue an append of channel values.
    pub fn append(&mut self, key: &str, values: &[f64]) {
        self.ops.push(PendingAppend {
            key: key.to_string(),
            values: values.to_vec(),
        });
    }

    /// Register a callback executed after the batch has been committed.
    pub fn add_execute_callback(&mut self, callback: impl FnOnce() + Send + 'static) {
        self.callbacks.push(Box::new(callback));
    }
}

impl Drop for AsyncProxy<'_> {
    fn drop(&mut self) {
        self.pipeline
            .merge(std::mem::take(&mut self.ops), std::mem::take(&mut self.callbacks));
    }
}
