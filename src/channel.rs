use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ChannelError;
use crate::types::{FunctionPath, RemoteCall};

pub type UpdateCallback = Arc<dyn Fn(Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(pub u64);

/// Stateless request/response access to the data service.
#[async_trait]
pub trait RequestChannel: Send + Sync {
    async fn call(&self, call: &RemoteCall) -> Result<Value, ChannelError>;
}

/// Stateful channel that can also push query results.
#[async_trait]
pub trait StreamingChannel: Send + Sync {
    async fn call(&self, call: &RemoteCall) -> Result<Value, ChannelError>;

    /// Registration never blocks; the channel announces it to the service
    /// as soon as it is connected.
    fn watch(&self, path: &FunctionPath, args: &Value, on_update: UpdateCallback) -> WatchId;

    /// Removes a registration. Unknown ids and closed channels are a no-op.
    fn unwatch(&self, id: WatchId) -> Result<(), ChannelError>;

    async fn lost(&self);

    /// Shuts the channel down. Idempotent.
    fn close(&self);
}
