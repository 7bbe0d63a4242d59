//! Informer: applies change events to a [`Cache`] and notifies handlers.
//!
//! Handlers see every event after the cache has been updated. Deletes carry the
//! object's final state, so handlers can resolve whatever it referenced even
//! though it is no longer cached. Handlers registered with a resync period
//! additionally receive every cached object as an update on that interval.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use metrics::counter;
use recon_core::Resource;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Cache, ObjectStore, StoreError};

/// Change notification from the watch layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Event<K> {
    Added(K),
    Updated(K),
    /// Carries the last known state of the deleted object.
    Deleted(K),
    /// Full relist; see [`Informer::replace`].
    Replaced(Vec<K>),
}

/// Receives cache changes. Calls happen on the delivering task; keep them cheap.
pub trait EventHandler<K>: Send + Sync {
    fn on_add(&self, obj: &K);
    fn on_update(&self, old: &K, new: &K);
    fn on_delete(&self, obj: &K);
}

struct Registration<K> {
    handler: Arc<dyn EventHandler<K>>,
    resync: Option<Duration>,
    next_resync: Mutex<Option<Instant>>,
}

impl<K> Registration<K> {
    fn next(&self) -> Option<Instant> {
        *self.next_resync.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct Informer<K> {
    cache: Arc<Cache<K>>,
    handlers: ArcSwap<Vec<Arc<Registration<K>>>>,
    registered: Notify,
}

impl<K: Resource> Default for Informer<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Resource> Informer<K> {
    pub fn new() -> Self {
        Self::with_cache(Arc::new(Cache::new()))
    }

    pub fn with_cache(cache: Arc<Cache<K>>) -> Self {
        Self { cache, handlers: ArcSwap::from_pointee(Vec::new()), registered: Notify::new() }
    }

    pub fn cache(&self) -> Arc<Cache<K>> {
        Arc::clone(&self.cache)
    }

    pub fn store(&self) -> Arc<dyn ObjectStore<K>> {
        self.cache.clone()
    }

    pub fn add_handler(&self, handler: Arc<dyn EventHandler<K>>) {
        self.register(handler, None);
    }

    /// Register `handler` and redeliver the whole cache to it every `period`.
    /// A zero period disables resync.
    pub fn add_handler_with_resync(&self, handler: Arc<dyn EventHandler<K>>, period: Duration) {
        self.register(handler, Some(period).filter(|p| !p.is_zero()));
    }

    fn register(&self, handler: Arc<dyn EventHandler<K>>, resync: Option<Duration>) {
        let next = resync.map(|p| Instant::now() + p);
        let reg = Arc::new(Registration { handler, resync, next_resync: Mutex::new(next) });
        self.handlers.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Arc::clone(&reg));
            next
        });
        // Replay after the swap: an event racing with registration may reach the
        // handler twice, never zero times.
        for obj in self.cache.all() {
            reg.handler.on_add(&obj);
        }
        self.registered.notify_one();
    }

    /// Apply one event to the cache, then notify every handler.
    pub fn apply(&self, event: Event<K>) -> Result<(), StoreError> {
        let handlers = self.handlers.load();
        match event {
            Event::Added(obj) | Event::Updated(obj) => {
                let (old, new) = self.cache.upsert(obj)?;
                match old {
                    Some(old) => {
                        counter!("informer_events_total", 1u64, "kind" => K::KIND, "type" => "update");
                        for reg in handlers.iter() {
                            reg.handler.on_update(&old, &new);
                        }
                    }
                    None => {
                        counter!("informer_events_total", 1u64, "kind" => K::KIND, "type" => "add");
                        for reg in handlers.iter() {
                            reg.handler.on_add(&new);
                        }
                    }
                }
            }
            Event::Deleted(obj) => {
                let key = obj.key()?;
                let last = self.cache.remove(&key).unwrap_or_else(|| Arc::new(obj));
                counter!("informer_events_total", 1u64, "kind" => K::KIND, "type" => "delete");
                for reg in handlers.iter() {
                    reg.handler.on_delete(&last);
                }
            }
            Event::Replaced(objs) => self.replace(objs)?,
        }
        Ok(())
    }

    /// Replace the cache contents with a fresh list (relist). Cached objects that
    /// are missing from `objs` are delivered as deletes with their cached state.
    pub fn replace(&self, objs: Vec<K>) -> Result<(), StoreError> {
        let mut seen = rustc_hash::FxHashSet::default();
        for obj in objs {
            seen.insert(obj.key()?);
            self.apply(Event::Updated(obj))?;
        }
        for key in self.cache.keys() {
            if seen.contains(&key) {
                continue;
            }
            if let Some(gone) = self.cache.get_by_key(&key)? {
                debug!(kind = K::KIND, key = %key, "object vanished during relist");
                self.apply(Event::Deleted((*gone).clone()))?;
            }
        }
        Ok(())
    }

    /// Deliver resync updates to every handler whose period has elapsed at `now`.
    pub fn resync_due(&self, now: Instant) {
        let handlers = self.handlers.load();
        let mut items = None;
        for reg in handlers.iter() {
            let Some(period) = reg.resync else { continue };
            {
                let mut next = reg.next_resync.lock().unwrap_or_else(PoisonError::into_inner);
                if next.map_or(true, |at| at > now) {
                    continue;
                }
                *next = Some(now + period);
            }
            let items = items.get_or_insert_with(|| self.cache.all());
            debug!(kind = K::KIND, count = items.len(), "resync");
            for obj in items.iter() {
                reg.handler.on_update(obj, obj);
            }
        }
    }

    fn next_resync_at(&self) -> Option<Instant> {
        self.handlers.load().iter().filter_map(|r| r.next()).min()
    }

    /// Consume events until `cancel` fires, resyncing handlers on schedule.
    /// Keeps resyncing after the event channel closes.
    pub async fn run(&self, mut events: mpsc::Receiver<Event<K>>, cancel: CancellationToken) {
        info!(kind = K::KIND, "informer started");
        let mut open = true;
        loop {
            let next = self.next_resync_at();
            tokio::select! {
                _ = cancel.cancelled() => break,
                maybe = events.recv(), if open => match maybe {
                    Some(ev) => {
                        if let Err(e) = self.apply(ev) {
                            warn!(kind = K::KIND, error = %e, "dropping event");
                        }
                    }
                    None => {
                        debug!(kind = K::KIND, "event channel closed");
                        open = false;
                    }
                },
                _ = sleep_until_opt(next) => self.resync_due(Instant::now()),
                _ = self.registered.notified() => {}
            }
        }
        info!(kind = K::KIND, "informer stopped");
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Forwards only events for objects accepted by `filter`. An update that moves
/// an object across the filter boundary is forwarded as an add or a delete.
pub struct FilteringHandler<K> {
    filter: Box<dyn Fn(&K) -> bool + Send + Sync>,
    inner: Arc<dyn EventHandler<K>>,
}

impl<K> FilteringHandler<K> {
    pub fn new(filter: impl Fn(&K) -> bool + Send + Sync + 'static, inner: Arc<dyn EventHandler<K>>) -> Self {
        Self { filter: Box::new(filter), inner }
    }
}

impl<K: Send + Sync> EventHandler<K> for FilteringHandler<K> {
    fn on_add(&self, obj: &K) {
        if (self.filter)(obj) {
            self.inner.on_add(obj);
        }
    }

    fn on_update(&self, old: &K, new: &K) {
        match ((self.filter)(old), (self.filter)(new)) {
            (true, true) => self.inner.on_update(old, new),
            (true, false) => self.inner.on_delete(old),
            (false, true) => self.inner.on_add(new),
            (false, false) => {}
        }
    }

    fn on_delete(&self, obj: &K) {
        if (self.filter)(obj) {
            self.inner.on_delete(obj);
        }
    }
}
