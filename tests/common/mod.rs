//! Test harness for multiplexer integration tests.
//!
//! Provides:
//! - MockPrimary: an in-memory streaming channel with scripted replies
//! - MockSecondary: an in-memory request/response channel
//! - Harness: a DualTransport and Multiplexer wired to the mocks

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use quasar_live::channel::{RequestChannel, StreamingChannel, UpdateCallback, WatchId};
use quasar_live::transport::ChannelFactory;
use quasar_live::types::RemoteCall;
use quasar_live::{ChannelError, DualTransport, FunctionPath, Multiplexer, TransportConfig};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Installs a test-writer subscriber once; `RUST_LOG` selects verbosity.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// How a mock channel answers a call.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Returns `{"path": .., "args": ..}` for the call.
    Echo,
    Value(Value),
    DelayThenValue(Duration, Value),
    ConnectionReset,
    Reject(String),
    DelayThenReject(Duration, String),
    NeverRespond,
}

impl Reply {
    async fn answer(&self, call: &RemoteCall) -> Result<Value, ChannelError> {
        match self {
            Reply::Echo => Ok(json!({ "path": call.path.as_str(), "args": call.args })),
            Reply::Value(value) => Ok(value.clone()),
            Reply::DelayThenValue(delay, value) => {
                tokio::time::sleep(*delay).await;
                Ok(value.clone())
            }
            Reply::ConnectionReset => Err(ChannelError::Io(io::Error::from(
                io::ErrorKind::ConnectionReset,
            ))),
            Reply::Reject(message) => Err(ChannelError::remote(message.clone())),
            Reply::DelayThenReject(delay, message) => {
                tokio::time::sleep(*delay).await;
                Err(ChannelError::remote(message.clone()))
            }
            Reply::NeverRespond => std::future::pending().await,
        }
    }
}

struct Registration {
    path: FunctionPath,
    args: Value,
    on_update: UpdateCallback,
}

/// Streaming channel that keeps registrations in memory.
pub struct MockPrimary {
    pub generation: usize,
    reply: Mutex<Reply>,
    calls: Mutex<Vec<RemoteCall>>,
    watch_calls: AtomicUsize,
    unwatch_calls: AtomicUsize,
    watches: Mutex<HashMap<u64, Registration>>,
    next_watch: AtomicU64,
    closed: AtomicBool,
    lost: CancellationToken,
}

impl MockPrimary {
    fn new(generation: usize, reply: Reply) -> Self {
        Self {
            generation,
            reply: Mutex::new(reply),
            calls: Mutex::new(Vec::new()),
            watch_calls: AtomicUsize::new(0),
            unwatch_calls: AtomicUsize::new(0),
            watches: Mutex::new(HashMap::new()),
            next_watch: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            lost: CancellationToken::new(),
        }
    }

    pub fn set_reply(&self, reply: Reply) {
        *self.reply.lock() = reply;
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().clone()
    }

    pub fn watch_count(&self) -> usize {
        self.watch_calls.load(Ordering::SeqCst)
    }

    pub fn unwatch_count(&self) -> usize {
        self.unwatch_calls.load(Ordering::SeqCst)
    }

    pub fn active_watches(&self) -> usize {
        self.watches.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Simulates the connection dropping for good.
    pub fn drop_connection(&self) {
        self.lost.cancel();
    }

    /// Pushes `value` to every registration on `path(args)`. Returns how many
    /// registrations received it.
    pub fn push(&self, path: &str, args: &Value, value: Value) -> usize {
        let targets: Vec<UpdateCallback> = self
            .watches
            .lock()
            .values()
            .filter(|r| r.path.as_str() == path && &r.args == args)
            .map(|r| Arc::clone(&r.on_update))
            .collect();
        for target in &targets {
            target(value.clone());
        }
        targets.len()
    }
}

#[async_trait]
impl StreamingChannel for MockPrimary {
    async fn call(&self, call: &RemoteCall) -> Result<Value, ChannelError> {
        self.calls.lock().push(call.clone());
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let reply = self.reply.lock().clone();
        reply.answer(call).await
    }

    fn watch(&self, path: &FunctionPath, args: &Value, on_update: UpdateCallback) -> WatchId {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        let id = self.next_watch.fetch_add(1, Ordering::SeqCst);
        if !self.is_closed() {
            self.watches.lock().insert(
                id,
                Registration {
                    path: path.clone(),
                    args: args.clone(),
                    on_update,
                },
            );
        }
        WatchId(id)
    }

    fn unwatch(&self, id: WatchId) -> Result<(), ChannelError> {
        self.unwatch_calls.fetch_add(1, Ordering::SeqCst);
        self.watches.lock().remove(&id.0);
        Ok(())
    }

    async fn lost(&self) {
        self.lost.cancelled().await;
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.watches.lock().clear();
        self.lost.cancel();
    }
}

/// Request/response channel with a scripted reply.
pub struct MockSecondary {
    reply: Mutex<Reply>,
    calls: Mutex<Vec<RemoteCall>>,
}

impl MockSecondary {
    pub fn new(reply: Reply) -> Self {
        Self {
            reply: Mutex::new(reply),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_reply(&self, reply: Reply) {
        *self.reply.lock() = reply;
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl RequestChannel for MockSecondary {
    async fn call(&self, call: &RemoteCall) -> Result<Value, ChannelError> {
        self.calls.lock().push(call.clone());
        let reply = self.reply.lock().clone();
        reply.answer(call).await
    }
}

/// Short deadlines so failover tests finish quickly. Recreation is not
/// throttled.
pub fn fast_config() -> TransportConfig {
    TransportConfig {
        primary_timeout: Duration::from_millis(100),
        secondary_timeout: Duration::from_millis(200),
        reconnect_backoff: Duration::ZERO,
    }
}

/// Orchestrates a DualTransport and Multiplexer over mock channels.
pub struct Harness {
    primaries: Arc<Mutex<Vec<Arc<MockPrimary>>>>,
    next_reply: Arc<Mutex<Reply>>,
    pub secondary: Arc<MockSecondary>,
    pub transport: Arc<DualTransport>,
    pub mux: Multiplexer,
}

impl Harness {
    /// Must be called inside a tokio runtime.
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: TransportConfig) -> Self {
        init_tracing();
        let primaries: Arc<Mutex<Vec<Arc<MockPrimary>>>> = Arc::new(Mutex::new(Vec::new()));
        let next_reply = Arc::new(Mutex::new(Reply::Echo));

        let factory: ChannelFactory = {
            let primaries = Arc::clone(&primaries);
            let next_reply = Arc::clone(&next_reply);
            Arc::new(move || {
                let mut primaries = primaries.lock();
                let channel = Arc::new(MockPrimary::new(
                    primaries.len(),
                    next_reply.lock().clone(),
                ));
                primaries.push(Arc::clone(&channel));
                channel as Arc<dyn StreamingChannel>
            })
        };

        let secondary = Arc::new(MockSecondary::new(Reply::Echo));
        let transport = DualTransport::new(
            factory,
            Arc::clone(&secondary) as Arc<dyn RequestChannel>,
            config,
        );
        let mux = Multiplexer::new(Arc::clone(&transport), 4);

        Self {
            primaries,
            next_reply,
            secondary,
            transport,
            mux,
        }
    }

    /// The primary channel created most recently.
    pub fn primary(&self) -> Arc<MockPrimary> {
        let primaries = self.primaries.lock();
        Arc::clone(primaries.last().expect("factory runs at construction"))
    }

    pub fn primary_at(&self, generation: usize) -> Arc<MockPrimary> {
        Arc::clone(&self.primaries.lock()[generation])
    }

    pub fn primaries_created(&self) -> usize {
        self.primaries.lock().len()
    }

    /// Reply used by primaries the factory creates from now on.
    pub fn set_next_primary_reply(&self, reply: Reply) {
        *self.next_reply.lock() = reply;
    }

    /// Watch registrations summed over every primary ever created.
    pub fn total_watches(&self) -> usize {
        self.primaries.lock().iter().map(|p| p.watch_count()).sum()
    }

    pub fn total_unwatches(&self) -> usize {
        self.primaries.lock().iter().map(|p| p.unwatch_count()).sum()
    }

    /// Drops the current primary's connection and waits for its replacement.
    pub async fn lose_primary(&self) {
        let before = self.transport.generation();
        self.primary().drop_connection();
        let transport = Arc::clone(&self.transport);
        assert!(
            eventually(Duration::from_secs(2), || transport.generation() > before).await,
            "primary was not recreated"
        );
    }
}

/// Polls `condition` until it holds or `within` elapses.
pub async fn eventually<F>(within: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
