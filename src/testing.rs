//! In-memory channels for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::channel::{RequestChannel, StreamingChannel, UpdateCallback, WatchId};
use crate::error::ChannelError;
use crate::transport::{ChannelFactory, DualTransport, TransportConfig};
use crate::types::{FunctionPath, RemoteCall};

#[derive(Debug, Clone)]
pub(crate) enum Answer {
    Value(Value),
    Reject(&'static str),
}

impl Answer {
    fn result(&self) -> Result<Value, ChannelError> {
        match self {
            Answer::Value(value) => Ok(value.clone()),
            Answer::Reject(message) => Err(ChannelError::remote(*message)),
        }
    }
}

pub(crate) struct StubPrimary {
    answer: Mutex<Answer>,
    watches: Mutex<HashMap<u64, UpdateCallback>>,
    next_watch: AtomicU64,
    unwatches: AtomicUsize,
    lost: CancellationToken,
}

impl StubPrimary {
    fn new() -> Self {
        Self {
            answer: Mutex::new(Answer::Value(json!({ "ok": true }))),
            watches: Mutex::new(HashMap::new()),
            next_watch: AtomicU64::new(1),
            unwatches: AtomicUsize::new(0),
            lost: CancellationToken::new(),
        }
    }

    pub(crate) fn set_answer(&self, answer: Answer) {
        *self.answer.lock() = answer;
    }

    pub(crate) fn active_watches(&self) -> usize {
        self.watches.lock().len()
    }

    pub(crate) fn unwatches(&self) -> usize {
        self.unwatches.load(Ordering::SeqCst)
    }

    pub(crate) fn push_all(&self, value: Value) {
        let targets: Vec<UpdateCallback> = self.watches.lock().values().cloned().collect();
        for target in targets {
            target(value.clone());
        }
    }
}

#[async_trait]
impl StreamingChannel for StubPrimary {
    async fn call(&self, _call: &RemoteCall) -> Result<Value, ChannelError> {
        self.answer.lock().result()
    }

    fn watch(&self, _path: &FunctionPath, _args: &Value, on_update: UpdateCallback) -> WatchId {
        let id = self.next_watch.fetch_add(1, Ordering::SeqCst);
        if !self.lost.is_cancelled() {
            self.watches.lock().insert(id, on_update);
        }
        WatchId(id)
    }

    fn unwatch(&self, id: WatchId) -> Result<(), ChannelError> {
        self.unwatches.fetch_add(1, Ordering::SeqCst);
        self.watches.lock().remove(&id.0);
        Ok(())
    }

    async fn lost(&self) {
        self.lost.cancelled().await;
    }

    fn close(&self) {
        self.watches.lock().clear();
        self.lost.cancel();
    }
}

pub(crate) struct StubSecondary {
    answer: Mutex<Answer>,
    calls: AtomicUsize,
}

impl StubSecondary {
    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RequestChannel for StubSecondary {
    async fn call(&self, _call: &RemoteCall) -> Result<Value, ChannelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer.lock().result()
    }
}

pub(crate) struct Stubs {
    primaries: Arc<Mutex<Vec<Arc<StubPrimary>>>>,
    pub(crate) secondary: Arc<StubSecondary>,
}

impl Stubs {
    pub(crate) fn primary(&self, generation: usize) -> Arc<StubPrimary> {
        Arc::clone(&self.primaries.lock()[generation])
    }

    pub(crate) fn created(&self) -> usize {
        self.primaries.lock().len()
    }
}

/// Transport over stub channels with short deadlines and no recreation
/// throttle. Must be called inside a tokio runtime.
pub(crate) fn transport() -> (Arc<DualTransport>, Stubs) {
    let primaries: Arc<Mutex<Vec<Arc<StubPrimary>>>> = Arc::new(Mutex::new(Vec::new()));
    let factory: ChannelFactory = {
        let primaries = Arc::clone(&primaries);
        Arc::new(move || {
            let channel = Arc::new(StubPrimary::new());
            primaries.lock().push(Arc::clone(&channel));
            channel as Arc<dyn StreamingChannel>
        })
    };
    let secondary = Arc::new(StubSecondary {
        answer: Mutex::new(Answer::Value(json!({ "ok": true }))),
        calls: AtomicUsize::new(0),
    });

    let transport = DualTransport::new(
        factory,
        Arc::clone(&secondary) as Arc<dyn RequestChannel>,
        TransportConfig {
            primary_timeout: Duration::from_millis(100),
            secondary_timeout: Duration::from_millis(200),
            reconnect_backoff: Duration::ZERO,
        },
    );
    (
        transport,
        Stubs {
            primaries,
            secondary,
        },
    )
}
