//! Deduplicating, reference-counted registry of live queries.
//!
//! Each distinct [`QueryCacheKey`] has at most one slot. A slot is either
//! `Pending` (a leader task is subscribing; callers that arrive meanwhile are
//! counted as waiters and share its outcome) or `Ready` (one transport
//! subscription shared by `ref_count` handles). All transitions of a key
//! happen under that key's dashmap shard lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use crate::cache_key::{self, normalize_args};
use crate::channel::UpdateCallback;
use crate::config::Config;
use crate::error::{Result, TransportError};
use crate::live_value::{ListenerId, LiveValue, Releaser, WatchEntry};
use crate::recovery;
use crate::transport::{DualTransport, TransportSubscription};
use crate::types::{FunctionRef, QueryCacheKey, RemoteCall};

type Outcome = Shared<BoxFuture<'static, Result<Arc<WatchEntry>>>>;

enum Slot {
    Pending {
        attempt: u64,
        waiters: u32,
        outcome: Outcome,
    },
    Ready {
        attempt: u64,
        entry: Arc<WatchEntry>,
        ref_count: u32,
        subscription: TransportSubscription,
    },
}

impl Slot {
    fn pending_waiters(&self, id: u64) -> Option<u32> {
        match self {
            Slot::Pending {
                attempt, waiters, ..
            } if *attempt == id => Some(*waiters),
            _ => None,
        }
    }
}

enum Joined {
    Ready(Arc<WatchEntry>),
    Waiting { attempt: u64, outcome: Outcome },
}

pub(crate) struct Registry {
    pub(crate) transport: Arc<DualTransport>,
    pub(crate) resubscribe_permits: Semaphore,
    slots: DashMap<QueryCacheKey, Slot>,
    next_attempt: AtomicU64,
}

/// Hands each coalesced caller's count back if it stops waiting early.
struct Waiter<'a> {
    registry: &'a Registry,
    key: &'a QueryCacheKey,
    attempt: u64,
    armed: bool,
}

impl Drop for Waiter<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.abandon(self.key, self.attempt);
        }
    }
}

/// Forwards pushed values into `entry` without keeping it alive.
pub(crate) fn update_sink(entry: &Arc<WatchEntry>) -> UpdateCallback {
    let weak = Arc::downgrade(entry);
    Arc::new(move |value| {
        if let Some(entry) = weak.upgrade() {
            entry.apply(value);
        }
    })
}

fn teardown(key: &QueryCacheKey, subscription: &TransportSubscription) {
    if let Err(e) = subscription.unsubscribe() {
        warn!(query = %key, error = %e, "unsubscribe failed, dropping watch anyway");
    }
}

impl Registry {
    fn join(self: &Arc<Self>, key: &QueryCacheKey, args: &Value) -> Joined {
        match self.slots.entry(key.clone()) {
            Entry::Occupied(mut occupied) => match occupied.get_mut() {
                Slot::Ready {
                    entry, ref_count, ..
                } => {
                    *ref_count += 1;
                    debug!(query = %key, ref_count = *ref_count, "joined live query");
                    Joined::Ready(Arc::clone(entry))
                }
                Slot::Pending {
                    attempt,
                    waiters,
                    outcome,
                } => {
                    *waiters += 1;
                    debug!(query = %key, waiters = *waiters, "waiting on in-flight subscribe");
                    Joined::Waiting {
                        attempt: *attempt,
                        outcome: outcome.clone(),
                    }
                }
            },
            Entry::Vacant(vacant) => {
                let attempt = self.next_attempt.fetch_add(1, Ordering::SeqCst);
                let outcome = self.lead(key.clone(), args.clone(), attempt);
                vacant.insert(Slot::Pending {
                    attempt,
                    waiters: 1,
                    outcome: outcome.clone(),
                });
                debug!(query = %key, attempt, "subscribing");
                Joined::Waiting { attempt, outcome }
            }
        }
    }

    /// Runs the one subscribe for `key` in its own task, so it finishes even
    /// if every caller waiting on it goes away.
    fn lead(self: &Arc<Self>, key: QueryCacheKey, args: Value, attempt: u64) -> Outcome {
        let registry = Arc::clone(self);
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            let entry = WatchEntry::new(task_key.clone());
            let result = registry
                .transport
                .subscribe(&task_key.path, args, update_sink(&entry))
                .await;
            registry.settle(&task_key, attempt, entry, result)
        });

        let registry = Arc::downgrade(self);
        task.map(move |joined| match joined {
            Ok(result) => result,
            Err(e) => {
                error!(query = %key, error = %e, "subscribe task panicked");
                if let Some(registry) = registry.upgrade() {
                    registry
                        .slots
                        .remove_if(&key, |_, slot| slot.pending_waiters(attempt).is_some());
                }
                Err(TransportError::lookup(format!("subscribe task failed: {e}")))
            }
        })
        .boxed()
        .shared()
    }

    fn settle(
        self: &Arc<Self>,
        key: &QueryCacheKey,
        attempt: u64,
        entry: Arc<WatchEntry>,
        result: Result<(Value, TransportSubscription)>,
    ) -> Result<Arc<WatchEntry>> {
        let (initial, subscription) = match result {
            Ok(subscribed) => subscribed,
            Err(e) => {
                self.slots
                    .remove_if(key, |_, slot| slot.pending_waiters(attempt).is_some());
                debug!(query = %key, error = %e, "subscribe failed");
                return Err(e);
            }
        };
        entry.seed(initial);
        let registered_on = subscription.generation();

        let Entry::Occupied(mut occupied) = self.slots.entry(key.clone()) else {
            error!(query = %key, "pending slot vanished during subscribe");
            teardown(key, &subscription);
            return Err(TransportError::lookup(format!(
                "registry lost the pending watch for {}",
                key.path
            )));
        };
        let stale = match occupied.get().pending_waiters(attempt) {
            Some(0) => {
                teardown(key, &subscription);
                occupied.remove();
                debug!(query = %key, "every waiter left before subscribe finished");
                return Ok(entry);
            }
            Some(waiters) => {
                occupied.insert(Slot::Ready {
                    attempt,
                    entry: Arc::clone(&entry),
                    ref_count: waiters,
                    subscription,
                });
                debug!(query = %key, ref_count = waiters, "live query ready");
                // Read with the shard still held: a recreation after this
                // point has its recovery scan find the slot Ready.
                registered_on != self.transport.generation()
            }
            None => {
                drop(occupied);
                error!(query = %key, "pending slot replaced during subscribe");
                teardown(key, &subscription);
                return Err(TransportError::lookup(format!(
                    "registry lost the pending watch for {}",
                    key.path
                )));
            }
        };
        drop(occupied);

        if stale {
            recovery::spawn_resubscribe(Arc::clone(self), key.clone());
        }
        Ok(entry)
    }

    /// Gives back one reference of the `Ready` slot matched by `owns`,
    /// tearing the subscription down when it was the last.
    fn drop_ref(&self, key: &QueryCacheKey, owns: impl Fn(&Slot) -> bool) -> bool {
        let Entry::Occupied(mut occupied) = self.slots.entry(key.clone()) else {
            return false;
        };
        if !owns(occupied.get()) {
            return false;
        }
        let Slot::Ready {
            ref_count,
            subscription,
            ..
        } = occupied.get_mut()
        else {
            return false;
        };

        if *ref_count > 1 {
            *ref_count -= 1;
            debug!(query = %key, ref_count = *ref_count, "released live query");
            return true;
        }

        // Unsubscribe before the key becomes absent so a new acquire cannot
        // open a second subscription while this one is still live.
        teardown(key, subscription);
        occupied.remove();
        debug!(query = %key, "live query torn down");
        true
    }

    fn abandon(&self, key: &QueryCacheKey, attempt: u64) {
        if let Some(mut slot) = self.slots.get_mut(key) {
            if let Slot::Pending {
                attempt: current,
                waiters,
                ..
            } = &mut *slot
            {
                if *current == attempt {
                    *waiters = waiters.saturating_sub(1);
                    debug!(query = %key, waiters = *waiters, "waiter cancelled");
                    return;
                }
            }
        }

        self.drop_ref(key, |slot| {
            matches!(slot, Slot::Ready { attempt: current, .. } if *current == attempt)
        });
    }

    pub(crate) fn stale_keys(&self) -> Vec<QueryCacheKey> {
        let generation = self.transport.generation();
        self.slots
            .iter()
            .filter(|slot| {
                matches!(
                    slot.value(),
                    Slot::Ready { subscription, .. } if subscription.generation() != generation
                )
            })
            .map(|slot| slot.key().clone())
            .collect()
    }

    /// The entry for `key` if its push registration predates the current
    /// primary channel.
    pub(crate) fn stale_entry(&self, key: &QueryCacheKey) -> Option<Arc<WatchEntry>> {
        let generation = self.transport.generation();
        match self.slots.get(key).as_deref() {
            Some(Slot::Ready {
                entry,
                subscription,
                ..
            }) if subscription.generation() != generation => Some(Arc::clone(entry)),
            _ => None,
        }
    }

    /// Swaps in a registration made on the current primary. Returns false
    /// (dropping, and thereby unwatching, `subscription`) when `entry` is no
    /// longer the live watch for `key`.
    pub(crate) fn replace_subscription(
        &self,
        key: &QueryCacheKey,
        entry: &Arc<WatchEntry>,
        subscription: TransportSubscription,
    ) -> bool {
        let Some(mut slot) = self.slots.get_mut(key) else {
            return false;
        };
        match &mut *slot {
            Slot::Ready {
                entry: current,
                subscription: active,
                ..
            } if Arc::ptr_eq(current, entry) => {
                let previous = std::mem::replace(active, subscription);
                teardown(key, &previous);
                true
            }
            _ => false,
        }
    }
}

impl Releaser for Registry {
    fn release(&self, entry: &Arc<WatchEntry>, listener: ListenerId) {
        entry.remove_listener(listener);
        let owned = self.drop_ref(entry.key(), |slot| {
            matches!(slot, Slot::Ready { entry: current, .. } if Arc::ptr_eq(current, entry))
        });
        if !owned {
            warn!(query = %entry.key(), "released a watch that is no longer registered");
        }
    }
}

/// Entry point for application code: live queries with at most one
/// subscription per distinct `(query, arguments)` pair.
#[derive(Clone)]
pub struct Multiplexer {
    registry: Arc<Registry>,
}

impl Multiplexer {
    /// Must be called inside a tokio runtime.
    pub fn new(transport: Arc<DualTransport>, resubscribe_concurrency: usize) -> Self {
        let events = transport.events();
        let registry = Arc::new(Registry {
            transport,
            resubscribe_permits: Semaphore::new(resubscribe_concurrency.max(1)),
            slots: DashMap::new(),
            next_attempt: AtomicU64::new(1),
        });
        recovery::spawn_recovery_loop(Arc::downgrade(&registry), events);
        Self { registry }
    }

    pub fn connect(config: &Config) -> Self {
        Self::new(
            DualTransport::from_config(config),
            config.resubscribe_concurrency,
        )
    }

    pub fn key_for<A>(query: &FunctionRef, args: &A) -> Result<QueryCacheKey>
    where
        A: Serialize + ?Sized,
    {
        cache_key::encode(&query.path, &normalize_args(args)?)
    }

    /// Returns a handle on the live value of `query(args)`, subscribing only
    /// if no other holder already keeps that key live.
    ///
    /// The handle is released when dropped. A failed acquire leaves nothing
    /// behind; retrying is up to the caller.
    pub async fn acquire<A>(&self, query: &FunctionRef, args: &A) -> Result<LiveValue>
    where
        A: Serialize + ?Sized,
    {
        if !query.kind.is_subscribable() {
            return Err(TransportError::lookup(format!(
                "{query} cannot be subscribed to"
            )));
        }
        let args = normalize_args(args)?;
        let key = cache_key::encode(&query.path, &args)?;

        let (attempt, outcome) = match self.registry.join(&key, &args) {
            Joined::Ready(entry) => return Ok(self.attach(entry)),
            Joined::Waiting { attempt, outcome } => (attempt, outcome),
        };

        let mut waiter = Waiter {
            registry: &self.registry,
            key: &key,
            attempt,
            armed: true,
        };
        let result = outcome.await;
        waiter.armed = false;

        result.map(|entry| self.attach(entry))
    }

    fn attach(&self, entry: Arc<WatchEntry>) -> LiveValue {
        let releaser: Arc<dyn Releaser> = Arc::clone(&self.registry) as Arc<dyn Releaser>;
        LiveValue::attach(entry, releaser)
    }

    /// One-shot call through the failover path, for mutations and actions
    /// (or a query that does not need to stay live).
    pub async fn call<A>(&self, function: &FunctionRef, args: &A) -> Result<Value>
    where
        A: Serialize + ?Sized,
    {
        if function.path.is_blank() {
            return Err(TransportError::lookup("function path is empty"));
        }
        let args = normalize_args(args)?;
        self.registry
            .transport
            .call(RemoteCall::new(function, args))
            .await
    }

    pub async fn query<A>(&self, path: &str, args: &A) -> Result<Value>
    where
        A: Serialize + ?Sized,
    {
        self.call(&FunctionRef::query(path), args).await
    }

    pub async fn mutation<A>(&self, path: &str, args: &A) -> Result<Value>
    where
        A: Serialize + ?Sized,
    {
        self.call(&FunctionRef::mutation(path), args).await
    }

    pub async fn action<A>(&self, path: &str, args: &A) -> Result<Value>
    where
        A: Serialize + ?Sized,
    {
        self.call(&FunctionRef::action(path), args).await
    }

    pub fn active_keys(&self) -> Vec<QueryCacheKey> {
        self.registry
            .slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Ready { .. }))
            .map(|slot| slot.key().clone())
            .collect()
    }

    /// Number of handles holding `key`; 0 when it is not live.
    pub fn ref_count(&self, key: &QueryCacheKey) -> u32 {
        match self.registry.slots.get(key).as_deref() {
            Some(Slot::Ready { ref_count, .. }) => *ref_count,
            _ => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.active_keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("active", &self.len())
            .field("generation", &self.registry.transport.generation())
            .finish()
    }
}
