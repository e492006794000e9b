//! Primary channel: a WebSocket connection carrying calls and pushed query
//! results.
//!
//! A channel connects lazily on first use and is single-use: once the socket
//! drops, every in-flight call fails with [`ChannelError::Closed`] and
//! [`StreamingChannel::lost`] resolves. Reconnecting means building a new
//! channel, which the dual transport does.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{StreamingChannel, UpdateCallback, WatchId};
use crate::error::ChannelError;
use crate::types::{ClientFrame, FunctionPath, RemoteCall, ServerFrame};

type Reply = oneshot::Sender<Result<Value, ChannelError>>;

struct Registration {
    path: FunctionPath,
    args: Value,
    on_update: UpdateCallback,
}

struct Shared {
    url: String,
    connect_lock: tokio::sync::Mutex<()>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
    pending: DashMap<u64, Reply>,
    watches: DashMap<u64, Registration>,
    next_id: AtomicU64,
    closed: AtomicBool,
    lost: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

pub struct WsChannel {
    shared: Arc<Shared>,
}

impl WsChannel {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                url: url.into(),
                connect_lock: tokio::sync::Mutex::new(()),
                outbound: Mutex::new(None),
                pending: DashMap::new(),
                watches: DashMap::new(),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                lost: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.outbound.lock().is_some()
    }
}

impl Drop for WsChannel {
    fn drop(&mut self) {
        self.shared.shutdown();
    }
}

/// Removes the pending entry if the caller stops waiting (e.g. on timeout).
struct PendingCall<'a> {
    shared: &'a Shared,
    request_id: u64,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.shared.pending.remove(&self.request_id);
    }
}

impl Shared {
    fn is_dead(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.lost.is_cancelled()
    }

    async fn ensure_connected(self: &Arc<Self>) -> Result<(), ChannelError> {
        if self.outbound.lock().is_some() {
            return Ok(());
        }
        if self.is_dead() {
            return Err(ChannelError::Closed);
        }

        let _guard = self.connect_lock.lock().await;
        if self.outbound.lock().is_some() {
            return Ok(());
        }
        if self.is_dead() {
            return Err(ChannelError::Closed);
        }

        let (socket, _) = match connect_async(self.url.as_str()).await {
            Ok(connected) => connected,
            Err(e) => {
                warn!(url = %self.url, error = %e, "primary connect failed");
                self.lost.cancel();
                return Err(e.into());
            }
        };
        info!(url = %self.url, "primary connected");

        let (mut ws_sink, mut ws_stream) = socket.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<ClientFrame>();

        let send_task = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(t) => t,
                    Err(e) => {
                        warn!(error = %e, "failed to serialize client frame");
                        continue;
                    }
                };
                if ws_sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_sink.close().await;
        });

        let reader = Arc::clone(self);
        let recv_task = tokio::spawn(async move {
            while let Some(msg) = ws_stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => reader.handle_frame(&text),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        warn!(error = %e, "primary read failed");
                        break;
                    }
                }
            }
            reader.disconnect();
        });

        {
            let mut tasks = self.tasks.lock();
            tasks.push(send_task);
            tasks.push(recv_task);
        }

        // Announce registrations made while we were connecting. Holding the
        // outbound lock keeps `watch` from racing this replay.
        let mut outbound = self.outbound.lock();
        if self.is_dead() {
            drop(outbound);
            for task in self.tasks.lock().drain(..) {
                task.abort();
            }
            return Err(ChannelError::Closed);
        }
        for entry in self.watches.iter() {
            let _ = tx.send(ClientFrame::Watch {
                watch_id: *entry.key(),
                path: entry.path.clone(),
                args: entry.args.clone(),
            });
        }
        *outbound = Some(tx);
        Ok(())
    }

    fn handle_frame(&self, text: &str) {
        let frame: ServerFrame = match serde_json::from_str(text) {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, "unparseable server frame");
                return;
            }
        };

        match frame {
            ServerFrame::Result { request_id, value } => {
                if let Some((_, reply)) = self.pending.remove(&request_id) {
                    let _ = reply.send(Ok(value));
                }
            }
            ServerFrame::Failure {
                request_id,
                message,
            } => {
                if let Some((_, reply)) = self.pending.remove(&request_id) {
                    let _ = reply.send(Err(ChannelError::remote(message)));
                }
            }
            ServerFrame::Update { watch_id, value } => {
                let callback = self
                    .watches
                    .get(&watch_id)
                    .map(|r| Arc::clone(&r.on_update));
                match callback {
                    Some(cb) => cb(value),
                    None => debug!(watch_id, "update for unknown watch"),
                }
            }
            ServerFrame::WatchFailure { watch_id, message } => {
                // The holder would otherwise wait on pushes that never come.
                // Losing the channel has every live query re-watched on its
                // replacement.
                self.watches.remove(&watch_id);
                warn!(watch_id, %message, "server rejected watch, dropping connection");
                self.disconnect();
            }
        }
    }

    /// Connection dropped underneath us.
    fn disconnect(&self) {
        self.outbound.lock().take();
        self.fail_pending();
        if !self.lost.is_cancelled() {
            info!(url = %self.url, "primary connection lost");
            self.lost.cancel();
        }
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the sender lets the send task close the socket.
        self.outbound.lock().take();
        self.fail_pending();
        self.watches.clear();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.lost.cancel();
        debug!(url = %self.url, "primary channel closed");
    }

    fn fail_pending(&self) {
        let ids: Vec<u64> = self.pending.iter().map(|r| *r.key()).collect();
        for id in ids {
            if let Some((_, reply)) = self.pending.remove(&id) {
                let _ = reply.send(Err(ChannelError::Closed));
            }
        }
    }
}

#[async_trait]
impl StreamingChannel for WsChannel {
    async fn call(&self, call: &RemoteCall) -> Result<Value, ChannelError> {
        self.shared.ensure_connected().await?;

        let request_id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (reply, response) = oneshot::channel();
        self.shared.pending.insert(request_id, reply);
        let _pending = PendingCall {
            shared: &self.shared,
            request_id,
        };

        let sent = self.shared.outbound.lock().as_ref().is_some_and(|tx| {
            tx.send(ClientFrame::Call {
                request_id,
                kind: call.kind,
                path: call.path.clone(),
                args: call.args.clone(),
            })
            .is_ok()
        });
        if !sent {
            return Err(ChannelError::Closed);
        }

        response.await.map_err(|_| ChannelError::Closed)?
    }

    fn watch(&self, path: &FunctionPath, args: &Value, on_update: UpdateCallback) -> WatchId {
        let watch_id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        if self.shared.is_dead() {
            return WatchId(watch_id);
        }

        let connected = {
            let outbound = self.shared.outbound.lock();
            self.shared.watches.insert(
                watch_id,
                Registration {
                    path: path.clone(),
                    args: args.clone(),
                    on_update,
                },
            );
            if let Some(tx) = outbound.as_ref() {
                let _ = tx.send(ClientFrame::Watch {
                    watch_id,
                    path: path.clone(),
                    args: args.clone(),
                });
                true
            } else {
                false
            }
        };

        if !connected {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                if let Err(e) = shared.ensure_connected().await {
                    debug!(error = %e, "background connect for watch failed");
                }
            });
        }

        WatchId(watch_id)
    }

    fn unwatch(&self, id: WatchId) -> Result<(), ChannelError> {
        let outbound = self.shared.outbound.lock();
        if self.shared.watches.remove(&id.0).is_none() {
            return Ok(());
        }
        match outbound.as_ref() {
            Some(tx) => tx
                .send(ClientFrame::Unwatch { watch_id: id.0 })
                .map_err(|_| ChannelError::Closed),
            None => Ok(()),
        }
    }

    async fn lost(&self) {
        self.shared.lost.cancelled().await;
    }

    fn close(&self) {
        self.shared.shutdown();
    }
}
