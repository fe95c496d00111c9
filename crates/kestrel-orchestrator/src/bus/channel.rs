//! Single-event-type publish/subscribe channel.
//!
//! A channel maps each [`ComponentTag`] to exactly one handler. Subscribing a
//! tag that already has a handler replaces it; components rely on this to
//! reset their subscription. Dispatch goes through the bus's [`WorkerPool`],
//! one unit of work per handler queued in that handler's lane, each isolated
//! against panics.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, error, trace};

use super::pool::WorkerPool;
use crate::event::{ComponentTag, Event};

type Handler<T> = Arc<dyn Fn(Event<T>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Invoked after a handler panicked, with the channel name and subscriber tag.
pub(crate) type FailSafe = Arc<dyn Fn(&'static str, ComponentTag) + Send + Sync>;

/// Typed publish/subscribe channel. Cloning shares the same handler map.
pub struct EventChannel<T> {
    inner: Arc<ChannelInner<T>>,
}

struct ChannelInner<T> {
    name: &'static str,
    handlers: RwLock<HashMap<ComponentTag, Handler<T>>>,
    pool: WorkerPool,
    fail_safe: Option<FailSafe>,
}

impl<T> Clone for EventChannel<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T> fmt::Debug for EventChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventChannel")
            .field("name", &self.inner.name)
            .field(
                "subscribers",
                &self.inner.handlers.try_read().map(|h| h.len()).unwrap_or(0),
            )
            .finish_non_exhaustive()
    }
}

impl<T> EventChannel<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a channel dispatching on `pool`.
    ///
    /// `fail_safe` runs after any handler panics; the fail-safe channel itself
    /// is built without one so a panicking fail-safe handler is only logged.
    pub(crate) fn new(
        name: &'static str,
        pool: WorkerPool,
        capacity: usize,
        fail_safe: Option<FailSafe>,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                name,
                handlers: RwLock::new(HashMap::with_capacity(capacity)),
                pool,
                fail_safe,
            }),
        }
    }

    /// Channel name used in logs.
    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Installs `handler` for `tag`, replacing any previous handler for that tag.
    pub fn subscribe<F, Fut>(&self, tag: ComponentTag, handler: F)
    where
        F: Fn(Event<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: Handler<T> = Arc::new(move |event| handler(event).boxed());
        if self.write().insert(tag, handler).is_some() {
            debug!(channel = self.inner.name, subscriber = %tag, "Replaced event handler");
        } else {
            trace!(channel = self.inner.name, subscriber = %tag, "Subscribed event handler");
        }
    }

    /// Removes the handler for `tag`. Returns whether one was installed.
    pub fn unsubscribe(&self, tag: ComponentTag) -> bool {
        self.write().remove(&tag).is_some()
    }

    /// Whether `tag` currently has a handler.
    pub fn is_subscribed(&self, tag: ComponentTag) -> bool {
        self.read().contains_key(&tag)
    }

    /// Number of installed handlers.
    pub fn subscriber_count(&self) -> usize {
        self.read().len()
    }

    /// Delivers `event` to every handler installed right now.
    ///
    /// Different handlers run concurrently on the worker pool with no ordering
    /// between them. One handler receives events in the order they were
    /// published. Returns how many dispatches were submitted (zero once the
    /// pool is closed).
    pub fn publish(&self, event: Event<T>) -> usize {
        // Snapshot so the lock is not held while dispatching.
        let snapshot: Vec<(ComponentTag, Handler<T>)> =
            self.read().iter().map(|(tag, handler)| (*tag, Arc::clone(handler))).collect();

        let mut dispatched = 0;
        for (tag, handler) in snapshot {
            let event = event.clone();
            let name = self.inner.name;
            let fail_safe = self.inner.fail_safe.clone();

            let work = async move {
                let outcome = AssertUnwindSafe(async move { handler(event).await }).catch_unwind().await;
                if let Err(payload) = outcome {
                    error!(
                        channel = name,
                        subscriber = %tag,
                        panic = %panic_message(payload.as_ref()),
                        "Event handler panicked"
                    );
                    if let Some(fail_safe) = fail_safe {
                        fail_safe(name, tag);
                    }
                }
            };

            if self.inner.pool.submit(tag, work) {
                dispatched += 1;
            }
        }

        trace!(channel = self.inner.name, dispatched, "Published event");
        dispatched
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ComponentTag, Handler<T>>> {
        self.inner.handlers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ComponentTag, Handler<T>>> {
        self.inner.handlers.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
