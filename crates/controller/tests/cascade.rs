#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use recon_controller::{
    Action, Controller, ControllerOptions, Enqueue, Enqueuer, IndexFanout, LookupFanout, ReconcileContext, Reconciler,
    TombstoneTracker, TrackDeletes,
};
use recon_core::{ObjectKey, ObjectMeta, Resource};
use recon_queue::RateLimitingQueue;
use recon_store::{Cache, Event, Informer, ObjectStore};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

macro_rules! kind {
    ($name:ident) => {
        #[derive(Debug, Clone, Serialize)]
        struct $name {
            metadata: ObjectMeta,
            refs: Vec<String>,
            phase: String,
        }

        impl $name {
            fn new(name: &str, refs: &[&str]) -> Self {
                Self {
                    metadata: ObjectMeta::new("ws", None, name),
                    refs: refs.iter().map(|r| r.to_string()).collect(),
                    phase: String::new(),
                }
            }
        }

        impl Resource for $name {
            const KIND: &'static str = stringify!($name);

            fn meta(&self) -> &ObjectMeta {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

kind!(Crd);
kind!(Schema);
kind!(Export);
kind!(Binding);

fn crd(name: &str, schema: &str) -> Crd {
    let mut c = Crd::new(name, &[]);
    c.metadata.annotations.insert("schema".into(), schema.into());
    c
}

/// Forwards to a queue-backed enqueuer and counts deliveries per key.
struct Counting {
    inner: Enqueuer,
    seen: Mutex<BTreeMap<String, usize>>,
}

impl Enqueue<Binding> for Counting {
    fn enqueue(&self, obj: &Binding, reason: &str) {
        *self.seen.lock().unwrap().entry(obj.metadata.name.clone()).or_default() += 1;
        self.inner.enqueue(obj, reason);
    }
}

#[tokio::test]
async fn crd_change_reaches_every_binding_through_three_hops_once() {
    let schemas: Arc<Cache<Schema>> = Arc::new(Cache::new());
    schemas.upsert(Schema::new("s1", &[])).unwrap();

    let exports: Arc<Cache<Export>> = Arc::new(Cache::new());
    exports.add_index("by-schema", Arc::new(|e: &Export| e.refs.clone())).unwrap();
    exports.upsert(Export::new("e1", &["ws|s1"])).unwrap();
    exports.upsert(Export::new("e2", &["ws|s1"])).unwrap();

    let bindings: Arc<Cache<Binding>> = Arc::new(Cache::new());
    bindings.add_index("by-export", Arc::new(|b: &Binding| b.refs.clone())).unwrap();
    for (name, export) in [("b1", "ws|e1"), ("b2", "ws|e1"), ("b3", "ws|e2"), ("b4", "ws|other")] {
        bindings.upsert(Binding::new(name, &[export])).unwrap();
    }

    let queue = RateLimitingQueue::with_default_limiter("apibinding");
    let counting =
        Arc::new(Counting { inner: Enqueuer::new("apibinding", queue.clone()), seen: Mutex::new(BTreeMap::new()) });
    let to_bindings =
        Arc::new(IndexFanout::<Export, Binding>::new("export", bindings, counting.clone()).by_key_index("by-export"));
    let to_exports =
        Arc::new(IndexFanout::<Schema, Export>::new("schema", exports, to_bindings).by_key_index("by-schema"));
    let to_schema = LookupFanout::<Crd, Schema>::by_annotation("crd", schemas, "schema", to_exports);

    let crds: Informer<Crd> = Informer::new();
    crds.add_handler(Arc::new(to_schema));

    crds.apply(Event::Added(crd("c1", "s1"))).unwrap();
    assert_eq!(queue.len(), 3);

    // Two deliveries in the same tick: every binding is offered once per event,
    // and the queue still holds each key once.
    crds.apply(Event::Updated(crd("c1", "s1"))).unwrap();
    crds.apply(Event::Updated(crd("c1", "s1"))).unwrap();
    assert_eq!(queue.len(), 3);
    let seen = counting.seen.lock().unwrap().clone();
    assert_eq!(seen, BTreeMap::from([("b1".into(), 3), ("b2".into(), 3), ("b3".into(), 3)]));

    let mut keys = Vec::new();
    while !queue.is_empty() {
        let key = queue.get().await.unwrap();
        queue.done(&key);
        keys.push(key);
    }
    keys.sort();
    assert_eq!(keys, ["ws|b1", "ws|b2", "ws|b3"]);

    // Deletes take the same path.
    crds.apply(Event::Deleted(crd("c1", "s1"))).unwrap();
    assert_eq!(queue.len(), 3);
}

/// Marks a binding `Bound` while its CRD exists, `Lost` otherwise.
struct BindingReconciler {
    crds: Arc<dyn ObjectStore<Crd>>,
    phases: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Reconciler<Binding> for BindingReconciler {
    async fn reconcile(&self, ctx: &ReconcileContext, obj: Option<&mut Binding>) -> anyhow::Result<Action> {
        let Some(binding) = obj else { return Ok(Action::done()) };
        let crd_key = ObjectKey::from_parts(&binding.metadata.cluster, None, "c1")?;
        let crd = ctx.tombstones.mask(&crd_key, self.crds.get_by_key(&crd_key)?);
        binding.phase = if crd.is_some() { "Bound" } else { "Lost" }.to_string();
        self.phases.lock().unwrap().push(binding.phase.clone());
        Ok(Action::done())
    }
}

#[tokio::test]
async fn tombstone_masks_a_stale_cached_crd() {
    // The reconciler's lister lags behind the watch and still returns the CRD.
    let lagging: Arc<Cache<Crd>> = Arc::new(Cache::new());
    lagging.upsert(crd("c1", "s1")).unwrap();

    let bindings: Informer<Binding> = Informer::new();
    bindings.cache().add_index("by-crd", Arc::new(|_: &Binding| vec!["ws|c1".to_string()])).unwrap();
    bindings.apply(Event::Added(Binding::new("b1", &[]))).unwrap();

    let tombstones = Arc::new(TombstoneTracker::default());
    let phases = Arc::new(Mutex::new(Vec::new()));
    let controller = Controller::<Binding>::builder(
        ControllerOptions::new("apibinding"),
        BindingReconciler { crds: lagging, phases: phases.clone() },
    )
    .tombstones(tombstones.clone())
    .build_with_store(bindings.store());

    let to_bindings = Arc::new(
        IndexFanout::<Crd, Binding>::new("crd", bindings.store(), Arc::new(controller.enqueuer())).by_key_index("by-crd"),
    );
    let crds: Informer<Crd> = Informer::new();
    crds.add_handler(Arc::new(TrackDeletes::<Crd>::new(tombstones.clone(), to_bindings)));

    crds.apply(Event::Added(crd("c1", "s1"))).unwrap();
    assert!(controller.process_next_item().await);

    crds.apply(Event::Deleted(crd("c1", "s1"))).unwrap();
    assert_eq!(tombstones.len(), 1);
    assert!(controller.process_next_item().await);

    // Re-creating the CRD clears its tombstone.
    crds.apply(Event::Added(crd("c1", "s1"))).unwrap();
    assert!(tombstones.is_empty());
    assert!(controller.process_next_item().await);

    assert_eq!(*phases.lock().unwrap(), ["Bound", "Lost", "Bound"]);
}

#[tokio::test(start_paused = true)]
async fn running_controller_sweeps_tombstones_of_names_never_recreated() {
    let tombstones = Arc::new(TombstoneTracker::new(Duration::from_secs(60)));
    let bindings: Informer<Binding> = Informer::new();
    bindings.cache().add_index("by-crd", Arc::new(|_: &Binding| Vec::new())).unwrap();
    let controller = Controller::<Binding>::builder(
        ControllerOptions::new("apibinding"),
        BindingReconciler { crds: Arc::new(Cache::<Crd>::new()), phases: Arc::default() },
    )
    .tombstones(tombstones.clone())
    .build_with_store(bindings.store());

    let to_bindings = Arc::new(
        IndexFanout::<Crd, Binding>::new("crd", bindings.store(), Arc::new(controller.enqueuer())).by_key_index("by-crd"),
    );
    let crds: Informer<Crd> = Informer::new();
    crds.add_handler(Arc::new(TrackDeletes::<Crd>::new(tombstones.clone(), to_bindings)));
    for i in 0..1000 {
        let c = crd(&format!("c{i}"), "s1");
        crds.apply(Event::Added(c.clone())).unwrap();
        crds.apply(Event::Deleted(c)).unwrap();
    }
    assert_eq!(tombstones.len(), 1000);

    let cancel = CancellationToken::new();
    let run = tokio::spawn({
        let controller = controller.clone();
        let cancel = cancel.clone();
        async move { controller.start(cancel, 1).await }
    });
    tokio::time::sleep(Duration::from_secs(3600)).await;

    // Already swept by the controller: nothing left for a manual prune.
    assert_eq!(tombstones.prune(), 0);
    assert!(tombstones.is_empty());

    cancel.cancel();
    run.await.unwrap();
}
