//! Recon controller: drives keys from a [`RateLimitingQueue`] through a
//! [`Reconciler`] until the observed object converges.
//!
//! Every add, update and delete of a watched object enqueues its key; workers
//! pop keys, read the current cached state, hand a private copy to the
//! reconciler, commit whatever changed and apply the retry policy. The queue
//! guarantees that no two workers ever process the same key concurrently.

#![forbid(unsafe_code)]

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use metrics::{counter, histogram};
use recon_commit::Commit;
use recon_core::{KeyError, ObjectKey, ObjectRef, Resource};
use recon_queue::RateLimitingQueue;
use recon_store::{EventHandler, Informer, ObjectStore, StoreError};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

pub mod cascade;
pub mod options;
pub mod tombstone;

pub use cascade::{Enqueue, IndexFanout, LookupFanout, TrackDeletes};
pub use options::{ControllerOptions, DEFAULT_MAX_REQUEUES};
pub use tombstone::{TombstoneTracker, DEFAULT_TOMBSTONE_TTL};

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("malformed key {key:?}: {source}")]
    MalformedKey { key: String, source: KeyError },
    #[error("giving up on {key} after {attempts} attempts: {source}")]
    RetriesExhausted { key: ObjectKey, attempts: u32, source: AggregateError },
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("config: {0}")]
    Config(String),
}

/// Every error raised while processing one key: reconcile, commit and
/// post-reconcile failures, in that order.
#[derive(Debug, Default)]
pub struct AggregateError {
    errors: Vec<anyhow::Error>,
}

impl AggregateError {
    pub fn push(&mut self, err: anyhow::Error) {
        self.errors.push(err);
    }

    pub fn errors(&self) -> &[anyhow::Error] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.as_slice() {
            [] => f.write_str("no errors"),
            [one] => write!(f, "{:#}", one),
            many => {
                write!(f, "{} errors: ", many.len())?;
                for (i, e) in many.iter().enumerate() {
                    if i > 0 {
                        f.write_str("; ")?;
                    }
                    write!(f, "{:#}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for AggregateError {}

/// Outcome of a successful reconcile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Converged; wait for the next change.
    pub fn done() -> Self {
        Self { requeue_after: None }
    }

    /// Process the key again right away without counting a failure.
    pub fn requeue() -> Self {
        Self { requeue_after: Some(Duration::ZERO) }
    }

    pub fn requeue_after(delay: Duration) -> Self {
        Self { requeue_after: Some(delay) }
    }

    pub fn requeue_delay(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Per-item data handed to reconcilers.
#[derive(Clone)]
pub struct ReconcileContext {
    pub controller: String,
    pub key: ObjectKey,
    pub target: ObjectRef,
    /// Failed attempts so far for this key.
    pub retries: u32,
    pub tombstones: Arc<TombstoneTracker>,
}

/// Business logic for one resource kind.
///
/// `reconcile` receives a private copy of the cached object (`None` if it is
/// gone) and may mutate it freely; the controller commits the difference.
#[async_trait]
pub trait Reconciler<K: Resource>: Send + Sync + 'static {
    async fn reconcile(&self, ctx: &ReconcileContext, obj: Option<&mut K>) -> anyhow::Result<Action>;

    /// Runs after every reconcile, with the errors collected so far.
    async fn post_reconcile(
        &self,
        _ctx: &ReconcileContext,
        _key: &ObjectKey,
        _prev: Option<&K>,
        _cur: Option<&K>,
        _err: Option<&AggregateError>,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Receives keys that exhausted their retries.
pub trait ErrorSink: Send + Sync {
    fn report(&self, controller: &str, err: &ControllerError);
}

/// Logs at error level and counts `reconcile_dropped_total`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn report(&self, controller: &str, err: &ControllerError) {
        counter!("reconcile_dropped_total", 1u64, "controller" => controller.to_string());
        error!(controller = %controller, error = %err, "dropping key");
    }
}

/// Cheap handle that turns objects into queued keys for one controller.
#[derive(Clone)]
pub struct Enqueuer {
    name: Arc<str>,
    queue: RateLimitingQueue,
}

impl Enqueuer {
    pub fn new(name: impl Into<Arc<str>>, queue: RateLimitingQueue) -> Self {
        Self { name: name.into(), queue }
    }

    pub fn queue(&self) -> &RateLimitingQueue {
        &self.queue
    }

    pub fn enqueue_key(&self, key: &ObjectKey, reason: &str) {
        debug!(controller = %self.name, key = %key, "queueing{}", reason);
        self.queue.add(key.as_str());
    }
}

impl<K: Resource> Enqueue<K> for Enqueuer {
    fn enqueue(&self, obj: &K, reason: &str) {
        match obj.key() {
            Ok(key) => self.enqueue_key(&key, reason),
            Err(e) => warn!(controller = %self.name, kind = K::KIND, error = %e, "cannot derive key"),
        }
    }
}

/// Level-triggered handler: add, update and delete all enqueue the object.
pub struct EnqueueHandler<E> {
    target: E,
}

impl<E> EnqueueHandler<E> {
    pub fn new(target: E) -> Self {
        Self { target }
    }
}

impl<K: Resource, E: Enqueue<K>> EventHandler<K> for EnqueueHandler<E> {
    fn on_add(&self, obj: &K) {
        self.target.enqueue(obj, "");
    }

    fn on_update(&self, _old: &K, new: &K) {
        self.target.enqueue(new, "");
    }

    fn on_delete(&self, obj: &K) {
        self.target.enqueue(obj, "");
    }
}

struct Shared<K: Resource> {
    name: String,
    opts: ControllerOptions,
    enqueuer: Enqueuer,
    store: Arc<dyn ObjectStore<K>>,
    reconciler: Arc<dyn Reconciler<K>>,
    committer: Option<Arc<dyn Commit<K>>>,
    sink: Arc<dyn ErrorSink>,
    tombstones: Arc<TombstoneTracker>,
}

pub struct ControllerBuilder<K: Resource> {
    opts: ControllerOptions,
    reconciler: Arc<dyn Reconciler<K>>,
    committer: Option<Arc<dyn Commit<K>>>,
    sink: Arc<dyn ErrorSink>,
    tombstones: Arc<TombstoneTracker>,
    queue: Option<RateLimitingQueue>,
}

impl<K: Resource> ControllerBuilder<K> {
    pub fn committer(mut self, committer: Arc<dyn Commit<K>>) -> Self {
        self.committer = Some(committer);
        self
    }

    pub fn error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn tombstones(mut self, tombstones: Arc<TombstoneTracker>) -> Self {
        self.tombstones = tombstones;
        self
    }

    /// Use `queue` instead of one built from the options' rate limiter config.
    pub fn queue(mut self, queue: RateLimitingQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Build the controller and subscribe it to `informer`, with the configured resync.
    pub fn build(self, informer: &Informer<K>) -> Controller<K> {
        let resync = self.opts.resync_period;
        let controller = self.build_with_store(informer.store());
        let handler = Arc::new(EnqueueHandler::new(controller.enqueuer()));
        match resync {
            Some(period) => informer.add_handler_with_resync(handler, period),
            None => informer.add_handler(handler),
        }
        controller
    }

    /// Build without subscribing; keys only arrive through [`Controller::enqueue`].
    pub fn build_with_store(self, store: Arc<dyn ObjectStore<K>>) -> Controller<K> {
        let name = self.opts.name.clone();
        let queue = self.queue.unwrap_or_else(|| RateLimitingQueue::new(name.clone(), self.opts.rate_limiter.build()));
        Controller {
            shared: Arc::new(Shared {
                enqueuer: Enqueuer::new(name.as_str(), queue),
                name,
                opts: self.opts,
                store,
                reconciler: self.reconciler,
                committer: self.committer,
                sink: self.sink,
                tombstones: self.tombstones,
            }),
        }
    }
}

/// Cloneable handle; clones drive the same queue.
pub struct Controller<K: Resource> {
    shared: Arc<Shared<K>>,
}

impl<K: Resource> Clone for Controller<K> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<K: Resource> Controller<K> {
    pub fn builder(opts: ControllerOptions, reconciler: impl Reconciler<K>) -> ControllerBuilder<K> {
        ControllerBuilder {
            opts,
            reconciler: Arc::new(reconciler),
            committer: None,
            sink: Arc::new(LogErrorSink),
            tombstones: Arc::new(TombstoneTracker::default()),
            queue: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn queue(&self) -> &RateLimitingQueue {
        self.shared.enqueuer.queue()
    }

    pub fn enqueuer(&self) -> Enqueuer {
        self.shared.enqueuer.clone()
    }

    pub fn tombstones(&self) -> Arc<TombstoneTracker> {
        Arc::clone(&self.shared.tombstones)
    }

    /// Queue `obj` for reconciliation; `reason` is appended to the log line.
    pub fn enqueue(&self, obj: &K, reason: &str) {
        Enqueue::<K>::enqueue(&self.shared.enqueuer, obj, reason);
    }

    /// Run `workers` workers until `cancel` fires, then shut the queue down and
    /// wait for in-flight items to finish.
    pub async fn start(&self, cancel: CancellationToken, workers: usize) {
        let workers = workers.max(1);
        info!(controller = %self.name(), workers, "starting controller");
        let mut set = JoinSet::new();
        for _ in 0..workers {
            let this = self.clone();
            set.spawn(async move { while this.process_next_item().await {} });
        }
        set.spawn(sweep_tombstones(Arc::clone(&self.shared.tombstones), cancel.clone()));
        cancel.cancelled().await;
        info!(controller = %self.name(), "shutting down controller");
        self.queue().shut_down();
        while let Some(res) = set.join_next().await {
            if let Err(e) = res {
                error!(controller = %self.name(), error = %e, "worker terminated abnormally");
            }
        }
        info!(controller = %self.name(), "controller stopped");
    }

    /// Process one key. Returns false once the queue has shut down.
    pub async fn process_next_item(&self) -> bool {
        let Some(raw) = self.queue().get().await else { return false };
        let span = tracing::info_span!("reconcile", controller = %self.name(), key = %raw);
        self.process(&raw).instrument(span).await;
        self.queue().done(&raw);
        true
    }

    async fn process(&self, raw: &str) {
        let queue = self.queue();
        let key = ObjectKey::from_raw(raw);
        let target = match key.parse() {
            Ok(target) => target,
            Err(source) => {
                let err = ControllerError::MalformedKey { key: raw.to_string(), source };
                warn!(error = %err, "dropping key");
                queue.forget(raw);
                return;
            }
        };
        debug!("processing");
        counter!("reconcile_total", 1u64, "controller" => self.shared.name.clone());
        let started = Instant::now();
        let result = match AssertUnwindSafe(self.reconcile_key(key.clone(), target)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let mut errs = AggregateError::default();
                errs.push(anyhow::anyhow!("worker panicked: {}", panic_message(&*payload)));
                Err(errs)
            }
        };
        histogram!(
            "reconcile_duration_ms",
            started.elapsed().as_secs_f64() * 1000.0,
            "controller" => self.shared.name.clone()
        );

        match result {
            Ok(action) => {
                queue.forget(raw);
                match action.requeue_delay() {
                    Some(delay) if delay.is_zero() => queue.add(raw),
                    Some(delay) => queue.add_after(raw, delay),
                    None => {}
                }
            }
            Err(errs) => self.handle_error(key, errs),
        }
    }

    async fn reconcile_key(&self, key: ObjectKey, target: ObjectRef) -> Result<Action, AggregateError> {
        let sh = &self.shared;
        let mut errs = AggregateError::default();
        let prev = match sh.store.get_by_key(&key) {
            Ok(prev) => sh.tombstones.mask(&key, prev),
            Err(e) => {
                errs.push(e.into());
                return Err(errs);
            }
        };
        if prev.is_none() {
            debug!("object not found, reconciling absence");
            sh.tombstones.forget(&key);
            if let Some(committer) = &sh.committer {
                committer.forget(&key);
            }
        }

        let ctx = ReconcileContext {
            controller: sh.name.clone(),
            key: key.clone(),
            target,
            retries: self.queue().num_requeues(key.as_str()),
            tombstones: Arc::clone(&sh.tombstones),
        };
        let mut cur: Option<K> = prev.as_deref().cloned();

        let mut action = Action::done();
        let mut panicked = false;
        match AssertUnwindSafe(sh.reconciler.reconcile(&ctx, cur.as_mut())).catch_unwind().await {
            Ok(Ok(a)) => action = a,
            Ok(Err(e)) => errs.push(e),
            Err(payload) => {
                panicked = true;
                errs.push(anyhow::anyhow!("reconcile panicked: {}", panic_message(&*payload)));
            }
        }

        if !panicked {
            if let (Some(committer), Some(old), Some(new)) = (&sh.committer, prev.as_deref(), cur.as_ref()) {
                match AssertUnwindSafe(committer.commit(old, new)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => errs.push(anyhow::Error::new(e).context("commit")),
                    Err(payload) => {
                        committer.forget(&key);
                        errs.push(anyhow::anyhow!("commit panicked: {}", panic_message(&*payload)));
                    }
                }
            }
        }

        let so_far = (!errs.is_empty()).then_some(&errs);
        let post = AssertUnwindSafe(sh.reconciler.post_reconcile(&ctx, &key, prev.as_deref(), cur.as_ref(), so_far))
            .catch_unwind()
            .await;
        match post {
            Ok(Ok(())) => {}
            Ok(Err(e)) => errs.push(e.context("post-reconcile")),
            Err(payload) => errs.push(anyhow::anyhow!("post-reconcile panicked: {}", panic_message(&*payload))),
        }

        if errs.is_empty() {
            Ok(action)
        } else {
            Err(errs)
        }
    }

    fn handle_error(&self, key: ObjectKey, errs: AggregateError) {
        let sh = &self.shared;
        let queue = self.queue();
        counter!("reconcile_errors_total", 1u64, "controller" => sh.name.clone());
        let retries = queue.num_requeues(key.as_str());
        if retries < sh.opts.max_requeues {
            info!(retries, error = %errs, "reconcile failed, retrying");
            queue.add_rate_limited(key.as_str());
            return;
        }
        queue.forget(key.as_str());
        warn!(retries, "retry budget exhausted");
        sh.sink.report(&sh.name, &ControllerError::RetriesExhausted { key, attempts: retries + 1, source: errs });
    }
}

/// Periodically drop expired tombstones until `cancel` fires.
async fn sweep_tombstones(tombstones: Arc<TombstoneTracker>, cancel: CancellationToken) {
    let mut tick = tokio::time::interval(tombstones.ttl().max(Duration::from_secs(1)));
    tick.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let pruned = tombstones.prune();
                if pruned > 0 {
                    debug!(pruned, "expired tombstones dropped");
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

pub mod prelude {
    pub use super::{
        Action, Controller, ControllerOptions, Enqueue, Enqueuer, ReconcileContext, Reconciler, TombstoneTracker,
    };
}
