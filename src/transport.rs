use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::channel::{RequestChannel, StreamingChannel, UpdateCallback, WatchId};
use crate::config::Config;
use crate::error::{ChannelError, Result, TransportError};
use crate::http_channel::HttpChannel;
use crate::types::{FunctionPath, OperationKind, RemoteCall};
use crate::ws_channel::WsChannel;

pub type ChannelFactory = Arc<dyn Fn() -> Arc<dyn StreamingChannel> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub primary_timeout: Duration,
    pub secondary_timeout: Duration,
    pub reconnect_backoff: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            primary_timeout: Duration::from_secs(5),
            secondary_timeout: Duration::from_secs(20),
            reconnect_backoff: Duration::from_secs(3),
        }
    }
}

impl From<&Config> for TransportConfig {
    fn from(config: &Config) -> Self {
        Self {
            primary_timeout: Duration::from_millis(config.primary_timeout_ms),
            secondary_timeout: Duration::from_millis(config.secondary_timeout_ms),
            reconnect_backoff: Duration::from_millis(config.reconnect_backoff_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The primary channel was replaced. Push registrations made on earlier
    /// generations are gone and must be re-established.
    PrimaryRecreated { generation: u64 },
}

struct Primary {
    channel: Arc<dyn StreamingChannel>,
    generation: u64,
}

/// Streaming primary channel with a request/response fallback.
pub struct DualTransport {
    config: TransportConfig,
    factory: ChannelFactory,
    secondary: Arc<dyn RequestChannel>,
    primary: RwLock<Primary>,
    last_recreated: Mutex<Option<Instant>>,
    events: broadcast::Sender<TransportEvent>,
    this: Weak<DualTransport>,
}

impl DualTransport {
    /// Must be called inside a tokio runtime: a monitor task is spawned per
    /// primary channel.
    pub fn new(
        factory: ChannelFactory,
        secondary: Arc<dyn RequestChannel>,
        config: TransportConfig,
    ) -> Arc<Self> {
        let channel = factory();
        let (events, _) = broadcast::channel(16);

        let transport = Arc::new_cyclic(|this| Self {
            config,
            factory,
            secondary,
            primary: RwLock::new(Primary {
                channel: Arc::clone(&channel),
                generation: 0,
            }),
            last_recreated: Mutex::new(None),
            events,
            this: this.clone(),
        });

        transport.spawn_monitor(0, channel);
        transport
    }

    pub fn from_config(config: &Config) -> Arc<Self> {
        let primary_url = config.primary_url.clone();
        let factory: ChannelFactory =
            Arc::new(move || Arc::new(WsChannel::new(primary_url.clone())) as Arc<dyn StreamingChannel>);
        let secondary = Arc::new(HttpChannel::new(config.secondary_url.clone()));
        Self::new(factory, secondary, TransportConfig::from(config))
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn generation(&self) -> u64 {
        self.primary.read().generation
    }

    pub fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn primary(&self) -> (Arc<dyn StreamingChannel>, u64) {
        let primary = self.primary.read();
        (Arc::clone(&primary.channel), primary.generation)
    }

    pub(crate) async fn query(&self, path: &FunctionPath, args: Value) -> Result<Value> {
        self.call(RemoteCall {
            kind: OperationKind::Query,
            path: path.clone(),
            args,
        })
        .await
    }

    /// Primary first under a short deadline; on a transient failure or
    /// deadline expiry, once more on the secondary under a longer one.
    pub(crate) async fn call(&self, call: RemoteCall) -> Result<Value> {
        let (primary, generation) = self.primary();

        match timeout(self.config.primary_timeout, primary.call(&call)).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if !e.is_transient() => {
                debug!(path = %call.path, error = %e, "primary rejected call");
                return Err(TransportError::Fatal(Arc::new(e)));
            }
            Ok(Err(e)) => {
                warn!(path = %call.path, generation, error = %e, "primary call failed, falling back");
            }
            Err(_) => {
                warn!(
                    path = %call.path,
                    generation,
                    timeout = ?self.config.primary_timeout,
                    "primary call timed out, falling back"
                );
            }
        }
        drop(primary);

        self.recreate_primary(generation, "call failure");

        match timeout(self.config.secondary_timeout, self.secondary.call(&call)).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                warn!(path = %call.path, error = %e, "secondary call failed");
                Err(e.into())
            }
            Err(_) => Err(TransportError::Timeout {
                path: call.path,
                after: self.config.primary_timeout + self.config.secondary_timeout,
            }),
        }
    }

    /// Registers `on_update` for pushes of `path(args)` on the current
    /// primary and fetches the initial value through the failover path.
    pub(crate) async fn subscribe(
        &self,
        path: &FunctionPath,
        args: Value,
        on_update: UpdateCallback,
    ) -> Result<(Value, TransportSubscription)> {
        let subscription = self.watch(path, &args, on_update);
        // On error the subscription is dropped, which unwatches it.
        let initial = self.query(path, args).await?;
        debug!(%path, generation = subscription.generation, "subscribed");
        Ok((initial, subscription))
    }

    pub(crate) fn watch(
        &self,
        path: &FunctionPath,
        args: &Value,
        on_update: UpdateCallback,
    ) -> TransportSubscription {
        let (channel, generation) = self.primary();
        let watch_id = channel.watch(path, args, on_update);
        TransportSubscription {
            channel,
            generation,
            watch_id,
            closed: AtomicBool::new(false),
        }
    }

    /// Replaces the primary if it is still generation `failed_generation`.
    ///
    /// Concurrent detections of the same failure replace it once; a second
    /// replacement inside `reconnect_backoff` is skipped.
    pub(crate) fn recreate_primary(&self, failed_generation: u64, reason: &str) -> bool {
        let mut last = self.last_recreated.lock();

        if self.primary.read().generation != failed_generation {
            return false;
        }
        if let Some(at) = *last {
            if at.elapsed() < self.config.reconnect_backoff {
                debug!(failed_generation, reason, "primary recreation throttled");
                return false;
            }
        }

        let channel = (self.factory)();
        let (old, generation) = {
            let mut primary = self.primary.write();
            let old = std::mem::replace(&mut primary.channel, Arc::clone(&channel));
            primary.generation += 1;
            (old, primary.generation)
        };
        *last = Some(Instant::now());
        drop(last);

        old.close();
        info!(generation, reason, "primary channel recreated");

        self.spawn_monitor(generation, channel);
        let _ = self.events.send(TransportEvent::PrimaryRecreated { generation });
        true
    }

    fn spawn_monitor(&self, generation: u64, channel: Arc<dyn StreamingChannel>) {
        let this = self.this.clone();
        let backoff = self.config.reconnect_backoff;
        tokio::spawn(async move {
            channel.lost().await;
            drop(channel);
            tokio::time::sleep(backoff).await;
            if let Some(transport) = this.upgrade() {
                transport.recreate_primary(generation, "connection lost");
            }
        });
    }
}

impl Drop for DualTransport {
    fn drop(&mut self) {
        self.primary.get_mut().channel.close();
    }
}

/// One push registration. Unsubscribing is idempotent, and once the owning
/// channel has been replaced it only marks the registration closed.
pub(crate) struct TransportSubscription {
    channel: Arc<dyn StreamingChannel>,
    generation: u64,
    watch_id: WatchId,
    closed: AtomicBool,
}

impl TransportSubscription {
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    #[cfg(test)]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn unsubscribe(&self) -> Result<(), ChannelError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.channel.unwatch(self.watch_id)
    }
}

impl Drop for TransportSubscription {
    fn drop(&mut self) {
        if let Err(e) = self.unsubscribe() {
            debug!(watch_id = ?self.watch_id, error = %e, "unwatch on drop failed");
        }
    }
}

impl std::fmt::Debug for TransportSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSubscription")
            .field("generation", &self.generation)
            .field("watch_id", &self.watch_id)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}
