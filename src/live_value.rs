use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::types::QueryCacheKey;

pub type ListenerId = Uuid;

pub type ChangeCallback = Arc<dyn Fn(Arc<Value>) + Send + Sync>;

/// Gives a handle's reference back to whoever counted it.
pub(crate) trait Releaser: Send + Sync {
    fn release(&self, entry: &Arc<WatchEntry>, listener: ListenerId);
}

pub(crate) struct Listener {
    callbacks: Mutex<Vec<ChangeCallback>>,
    active: AtomicBool,
}

impl Listener {
    fn new() -> Self {
        Self {
            callbacks: Mutex::new(Vec::new()),
            active: AtomicBool::new(true),
        }
    }

    fn notify(&self, value: &Arc<Value>) {
        if !self.active.load(Ordering::SeqCst) {
            return;
        }
        let callbacks = self.callbacks.lock().clone();
        for cb in callbacks {
            cb(Arc::clone(value));
        }
    }
}

struct WatchState {
    current: Option<Arc<Value>>,
    // Bumped by every applied update.
    version: u64,
    listeners: Vec<(ListenerId, Arc<Listener>)>,
}

pub(crate) struct WatchEntry {
    key: QueryCacheKey,
    state: Mutex<WatchState>,
    // Held for a whole fan-out so updates reach listeners in arrival order.
    delivery: Mutex<()>,
    changed: Notify,
}

impl WatchEntry {
    pub(crate) fn new(key: QueryCacheKey) -> Arc<Self> {
        Arc::new(Self {
            key,
            state: Mutex::new(WatchState {
                current: None,
                version: 0,
                listeners: Vec::new(),
            }),
            delivery: Mutex::new(()),
            changed: Notify::new(),
        })
    }

    pub(crate) fn key(&self) -> &QueryCacheKey {
        &self.key
    }

    pub(crate) fn snapshot(&self) -> Option<Arc<Value>> {
        self.state.lock().current.clone()
    }

    /// Stores the initial fetch unless a pushed update already arrived.
    pub(crate) fn seed(&self, initial: Value) {
        let mut state = self.state.lock();
        if state.current.is_none() {
            state.current = Some(Arc::new(initial));
        }
    }

    pub(crate) fn version(&self) -> u64 {
        self.state.lock().version
    }

    /// Replaces the value and notifies every listener in registration order.
    pub(crate) fn apply(&self, value: Value) {
        let _delivery = self.delivery.lock();
        self.deliver(value);
    }

    /// Applies a fetched value only if nothing was applied since `seen` was
    /// read and the value actually differs.
    pub(crate) fn apply_if_current(&self, value: Value, seen: u64) -> bool {
        let _delivery = self.delivery.lock();
        {
            let state = self.state.lock();
            if state.version != seen || state.current.as_deref() == Some(&value) {
                return false;
            }
        }
        self.deliver(value);
        true
    }

    // Caller holds `delivery`.
    fn deliver(&self, value: Value) {
        let value = Arc::new(value);
        let listeners: Vec<Arc<Listener>> = {
            let mut state = self.state.lock();
            state.current = Some(Arc::clone(&value));
            state.version += 1;
            state.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
        };

        for listener in listeners {
            listener.notify(&value);
        }
        self.changed.notify_waiters();
    }

    pub(crate) fn add_listener(&self) -> (ListenerId, Arc<Listener>) {
        let id = Uuid::new_v4();
        let listener = Arc::new(Listener::new());
        self.state
            .lock()
            .listeners
            .push((id, Arc::clone(&listener)));
        (id, listener)
    }

    pub(crate) fn remove_listener(&self, id: ListenerId) -> bool {
        let mut state = self.state.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(lid, _)| *lid != id);
        state.listeners.len() != before
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        self.state.lock().listeners.len()
    }
}

/// A caller's view of one live query.
///
/// Always reflects the latest known value. Dropping the handle (or calling
/// [`LiveValue::release`]) gives its reference back exactly once; after that
/// no further change callbacks run.
pub struct LiveValue {
    entry: Arc<WatchEntry>,
    listener_id: ListenerId,
    listener: Arc<Listener>,
    releaser: Arc<dyn Releaser>,
}

impl LiveValue {
    /// Registers a new listener on `entry`. The caller must already hold the
    /// reference this handle will give back.
    pub(crate) fn attach(entry: Arc<WatchEntry>, releaser: Arc<dyn Releaser>) -> Self {
        let (listener_id, listener) = entry.add_listener();
        Self {
            entry,
            listener_id,
            listener,
            releaser,
        }
    }

    pub fn key(&self) -> &QueryCacheKey {
        self.entry.key()
    }

    /// Latest known value; `None` only before the first result arrived.
    pub fn snapshot(&self) -> Option<Arc<Value>> {
        self.entry.snapshot()
    }

    pub fn snapshot_as<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.snapshot()
            .map(|v| T::deserialize(&*v))
            .transpose()
    }

    pub fn on_change<F>(&self, callback: F)
    where
        F: Fn(Arc<Value>) + Send + Sync + 'static,
    {
        self.listener.callbacks.lock().push(Arc::new(callback));
    }

    pub async fn changed(&self) -> Option<Arc<Value>> {
        self.entry.changed.notified().await;
        self.snapshot()
    }

    pub fn release(self) {}

    pub fn shares_watch_with(&self, other: &LiveValue) -> bool {
        Arc::ptr_eq(&self.entry, &other.entry)
    }
}

impl Drop for LiveValue {
    fn drop(&mut self) {
        if self.listener.active.swap(false, Ordering::SeqCst) {
            self.releaser.release(&self.entry, self.listener_id);
        }
    }
}

impl fmt::Debug for LiveValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveValue")
            .field("key", self.entry.key())
            .field("listener_id", &self.listener_id)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
