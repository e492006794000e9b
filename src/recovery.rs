//! Re-establishes push registrations after the primary channel is replaced.

use std::sync::{Arc, Weak};

use serde_json::Value;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::multiplexer::{update_sink, Registry};
use crate::transport::TransportEvent;
use crate::types::QueryCacheKey;

pub(crate) fn spawn_recovery_loop(
    registry: Weak<Registry>,
    mut events: broadcast::Receiver<TransportEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(TransportEvent::PrimaryRecreated { generation }) => {
                    debug!(generation, "primary recreated");
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "missed transport events, resubscribing everything stale");
                }
                Err(RecvError::Closed) => break,
            }

            let Some(registry) = registry.upgrade() else {
                break;
            };
            resubscribe_all(&registry).await;
        }
        debug!("recovery loop stopped");
    })
}

async fn resubscribe_all(registry: &Arc<Registry>) {
    let keys = registry.stale_keys();
    if keys.is_empty() {
        return;
    }
    info!(
        key_count = keys.len(),
        generation = registry.transport.generation(),
        "resubscribing live queries on new primary"
    );

    let mut handles = Vec::with_capacity(keys.len());
    for key in keys {
        let registry = Arc::clone(registry);
        handles.push(tokio::spawn(async move {
            let _permit = registry.resubscribe_permits.acquire().await;
            resubscribe_single(&registry, &key).await;
        }));
    }

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "resubscribe task panicked");
        }
    }
}

/// Resubscribes one key whose registration went stale while it was being
/// built.
pub(crate) fn spawn_resubscribe(registry: Arc<Registry>, key: QueryCacheKey) {
    tokio::spawn(async move {
        let _permit = registry.resubscribe_permits.acquire().await;
        resubscribe_single(&registry, &key).await;
    });
}

async fn resubscribe_single(registry: &Registry, key: &QueryCacheKey) {
    let Some(entry) = registry.stale_entry(key) else {
        return;
    };

    let args: Value = match serde_json::from_str(&key.args_canonical) {
        Ok(args) => args,
        Err(e) => {
            warn!(query = %key, error = %e, "stored arguments no longer parse");
            return;
        }
    };

    // Pushes may have been missed while no registration was live. Anything
    // pushed on the new registration is newer than the catch-up fetch.
    let seen = entry.version();
    let subscription = registry
        .transport
        .watch(&key.path, &args, update_sink(&entry));
    if !registry.replace_subscription(key, &entry, subscription) {
        debug!(query = %key, "watch released during resubscribe");
        return;
    }

    match registry.transport.query(&key.path, args).await {
        Ok(value) => {
            if !entry.apply_if_current(value, seen) {
                debug!(query = %key, "catch-up fetch unchanged or superseded");
            }
        }
        Err(e) => {
            warn!(query = %key, error = %e, "refresh after resubscribe failed, keeping last value");
        }
    }
}
