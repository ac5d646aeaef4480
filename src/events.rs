//! Typed event wiring between acquisition objects and the scan.
//!
//! Devices announce their lifecycle ("start"/"end") and channels announce
//! new data. Instead of a stringly-typed signal bus, each entity carries a
//! small set of typed [`Signal`]s that handlers subscribe to individually,
//! so only valid signal kinds can be wired while subscribe/unsubscribe
//! stays dynamic per instance.
//!
//! Handlers are synchronous closures. Emission never suspends, which keeps
//! the data path uninterruptible by task cancellation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::sync::Arc;

/// Identifies one subscription on one signal, for later disconnection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A single typed signal with dynamic subscribers.
pub struct Signal<T> {
    next_id: AtomicU64,
    handlers: Mutex<HashMap<u64, Handler<T>>>,
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    pub fn connect(&self, handler: Handler<T>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.insert(id, handler);
        }
        SubscriptionId(id)
    }

    /// Returns `true` if the subscription existed.
    pub fn disconnect(&self, id: SubscriptionId) -> bool {
        self.handlers
            .lock()
            .map(|mut handlers| handlers.remove(&id.0).is_some())
            .unwrap_or(false)
    }

    pub fn emit(&self, event: &T) {
        // Snapshot under the lock, call outside it: a handler may
        // re-subscribe or disconnect without deadlocking.
        let snapshot: Vec<Handler<T>> = match self.handlers.lock() {
            Ok(handlers) => handlers.values().cloned().collect(),
            Err(_) => return,
        };
        for handler in snapshot {
            handler(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.lock().map(|h| h.len()).unwrap_or(0)
    }
}

impl<T> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Lifecycle signal emitted by a device.
#[derive(Clone, Debug)]
pub struct DeviceEvent {
    /// Name of the emitting device.
    pub device: String,
}

/// Data emitted by a channel: one batch of values for the scan point(s)
/// just acquired.
#[derive(Clone, Debug)]
pub struct ChannelDataEvent {
    /// Unique (scan-scoped) channel name.
    pub channel: String,
    pub values: Vec<f64>,
}

/// Signals available on every device.
#[derive(Debug, Default)]
pub struct DeviceEvents {
    pub start: Signal<DeviceEvent>,
    pub end: Signal<DeviceEvent>,
}

/// Signals available on every channel.
#[derive(Debug, Default)]
pub struct ChannelEvents {
    pub new_data: Signal<ChannelDataEvent>,
    /// Emitted once a `new_data` payload has been committed to storage.
    pub new_data_stored: Signal<ChannelDataEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_connect_emit_disconnect() {
        let signal: Signal<u32> = Signal::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let id = {
            let hits = hits.clone();
            signal.connect(Arc::new(move |value: &u32| {
                hits.fetch_add(*value as usize, Ordering::SeqCst);
            }))
        };
        assert_eq!(signal.subscriber_count(), 1);

        signal.emit(&3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        assert!(signal.disconnect(id));
        assert!(!signal.disconnect(id));
        signal.emit(&3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(signal.subscriber_count(), 0);
    }

    #[test]
    fn test_multiple_subscribers_all_called() {
        let signal: Signal<()> = Signal::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let hits = hits.clone();
            signal.connect(Arc::new(move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            }));
        }
        signal.emit(&());
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_handler_may_disconnect_during_emit() {
        let signal: Arc<Signal<()>> = Arc::new(Signal::new());
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));

        let id = {
            let signal = signal.clone();
            let slot = slot.clone();
            signal.clone().connect(Arc::new(move |_| {
                if let Some(id) = slot.lock().ok().and_then(|s| *s) {
                    signal.disconnect(id);
                }
            }))
        };
        *slot.lock().unwrap() = Some(id);

        signal.emit(&());
        assert_eq!(signal.subscriber_count(), 0);
    }
}
