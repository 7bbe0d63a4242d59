//! Cascading dependency fan-out.
//!
//! A change to a referenced object re-enqueues every object that depends on it.
//! Dependents are found through secondary indexes of the dependent kind
//! ([`IndexFanout`]) or by resolving a key carried on the changed object
//! ([`LookupFanout`]). Both stages are [`Enqueue`] targets themselves, so they
//! chain into multi-hop graphs that end in a controller's [`Enqueuer`](crate::Enqueuer):
//!
//! ```text
//! CRD --annotation--> schema --index--> export --index--> binding controller
//! ```

use std::sync::Arc;

use recon_core::{ObjectKey, Resource};
use recon_store::{EventHandler, ObjectStore};
use rustc_hash::FxHashSet;
use tracing::{debug, trace, warn};

use crate::TombstoneTracker;

/// Something that accepts objects for (eventual) reconciliation.
pub trait Enqueue<K>: Send + Sync {
    /// `reason` is appended verbatim to log lines; pass `""` for none.
    fn enqueue(&self, obj: &K, reason: &str);
}

impl<K, T: Enqueue<K> + ?Sized> Enqueue<K> for Arc<T> {
    fn enqueue(&self, obj: &K, reason: &str) {
        (**self).enqueue(obj, reason)
    }
}

type Filter<A> = Box<dyn Fn(&A) -> bool + Send + Sync>;
type ValuesFn<A> = Box<dyn Fn(&A) -> Vec<String> + Send + Sync>;

fn because<A: Resource>(obj: &A, reason: &str) -> String {
    format!(" because of {} {}{}", A::KIND, obj.object_ref(), reason)
}

/// Fans a change of `A` out to the `B`s filed under it in one of `B`'s indexes.
///
/// Lookups are tried in registration order and the first one that yields any
/// dependents wins, so later lookups act as fallbacks.
pub struct IndexFanout<A, B> {
    stage: String,
    store: Arc<dyn ObjectStore<B>>,
    lookups: Vec<(String, ValuesFn<A>)>,
    filter: Option<Filter<A>>,
    next: Arc<dyn Enqueue<B>>,
}

impl<A: Resource, B: Resource> IndexFanout<A, B> {
    pub fn new(stage: impl Into<String>, store: Arc<dyn ObjectStore<B>>, next: Arc<dyn Enqueue<B>>) -> Self {
        Self { stage: stage.into(), store, lookups: Vec::new(), filter: None, next }
    }

    /// Look dependents up in `index` under the changed object's key.
    pub fn by_key_index(self, index: impl Into<String>) -> Self {
        self.by_index(index, |a: &A| a.key().map(|k| vec![k.into_string()]).unwrap_or_default())
    }

    /// Look dependents up in `index` under each value `values` derives from the changed object.
    pub fn by_index(
        mut self,
        index: impl Into<String>,
        values: impl Fn(&A) -> Vec<String> + Send + Sync + 'static,
    ) -> Self {
        self.lookups.push((index.into(), Box::new(values)));
        self
    }

    /// Ignore changed objects rejected by `f` before any lookup happens.
    pub fn filter(mut self, f: impl Fn(&A) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Box::new(f));
        self
    }

    fn accepts(&self, obj: &A) -> bool {
        self.filter.as_ref().map_or(true, |f| f(obj))
    }

    fn dependents(&self, obj: &A, seen: &mut FxHashSet<ObjectKey>, out: &mut Vec<Arc<B>>) {
        for (index, values) in &self.lookups {
            let before = out.len();
            for value in values(obj) {
                match self.store.by_index(index, &value) {
                    Ok(found) => {
                        for dep in found {
                            if let Ok(key) = dep.key() {
                                if seen.insert(key) {
                                    out.push(dep);
                                }
                            }
                        }
                    }
                    Err(e) => warn!(stage = %self.stage, index = %index, error = %e, "index lookup failed"),
                }
            }
            if out.len() > before {
                return;
            }
        }
    }

    fn fan_out(&self, objs: &[&A], reason: &str) {
        let mut seen = FxHashSet::default();
        let mut deps = Vec::new();
        let mut src = None;
        for obj in objs.iter().copied().filter(|o| self.accepts(o)) {
            self.dependents(obj, &mut seen, &mut deps);
            src = Some(obj);
        }
        let Some(src) = src else { return };
        if deps.is_empty() {
            trace!(stage = %self.stage, kind = A::KIND, obj = %src.object_ref(), "no dependents");
            return;
        }
        debug!(stage = %self.stage, kind = A::KIND, obj = %src.object_ref(), dependents = deps.len(), "fanning out");
        let reason = because(src, reason);
        for dep in &deps {
            self.next.enqueue(dep, &reason);
        }
    }
}

impl<A: Resource, B: Resource> Enqueue<A> for IndexFanout<A, B> {
    fn enqueue(&self, obj: &A, reason: &str) {
        self.fan_out(&[obj], reason);
    }
}

impl<A: Resource, B: Resource> EventHandler<A> for IndexFanout<A, B> {
    fn on_add(&self, obj: &A) {
        self.fan_out(&[obj], "");
    }

    /// Dependents of both versions are notified, each once.
    fn on_update(&self, old: &A, new: &A) {
        self.fan_out(&[old, new], "");
    }

    fn on_delete(&self, obj: &A) {
        self.fan_out(&[obj], "");
    }
}

/// Fans a change of `A` out to the `B`s whose keys `A` itself names.
pub struct LookupFanout<A, B> {
    stage: String,
    store: Arc<dyn ObjectStore<B>>,
    resolve: Box<dyn Fn(&A) -> Vec<ObjectKey> + Send + Sync>,
    filter: Option<Filter<A>>,
    next: Arc<dyn Enqueue<B>>,
}

impl<A: Resource, B: Resource> LookupFanout<A, B> {
    pub fn new(
        stage: impl Into<String>,
        store: Arc<dyn ObjectStore<B>>,
        resolve: impl Fn(&A) -> Vec<ObjectKey> + Send + Sync + 'static,
        next: Arc<dyn Enqueue<B>>,
    ) -> Self {
        Self { stage: stage.into(), store, resolve: Box::new(resolve), filter: None, next }
    }

    /// Resolve the target from annotation `name`: either a full key, or a bare
    /// name of a cluster-scoped object in the changed object's cluster.
    pub fn by_annotation(
        stage: impl Into<String>,
        store: Arc<dyn ObjectStore<B>>,
        name: &str,
        next: Arc<dyn Enqueue<B>>,
    ) -> Self {
        let name = name.to_string();
        Self::new(stage, store, move |a: &A| annotation_key(a, &name).into_iter().collect(), next)
    }

    pub fn filter(mut self, f: impl Fn(&A) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Box::new(f));
        self
    }

    fn fan_out(&self, obj: &A, reason: &str) {
        if !self.filter.as_ref().map_or(true, |f| f(obj)) {
            return;
        }
        let keys = (self.resolve)(obj);
        if keys.is_empty() {
            return;
        }
        let reason = because(obj, reason);
        for key in keys {
            match self.store.get_by_key(&key) {
                Ok(Some(target)) => self.next.enqueue(&target, &reason),
                Ok(None) => debug!(stage = %self.stage, key = %key, "referenced object not cached"),
                Err(e) => warn!(stage = %self.stage, key = %key, error = %e, "lookup failed"),
            }
        }
    }
}

fn annotation_key<A: Resource>(obj: &A, annotation: &str) -> Option<ObjectKey> {
    let meta = obj.meta();
    let value = meta.annotation(annotation)?;
    let key = if value.contains('|') {
        let key = ObjectKey::from_raw(value);
        key.parse().ok().map(|_| key)
    } else {
        ObjectKey::from_parts(&meta.cluster, None, value).ok()
    };
    if key.is_none() {
        warn!(kind = A::KIND, obj = %obj.object_ref(), annotation, value, "unusable reference annotation");
    }
    key
}

impl<A: Resource, B: Resource> Enqueue<A> for LookupFanout<A, B> {
    fn enqueue(&self, obj: &A, reason: &str) {
        self.fan_out(obj, reason);
    }
}

impl<A: Resource, B: Resource> EventHandler<A> for LookupFanout<A, B> {
    fn on_add(&self, obj: &A) {
        self.fan_out(obj, "");
    }

    fn on_update(&self, _old: &A, new: &A) {
        self.fan_out(new, "");
    }

    fn on_delete(&self, obj: &A) {
        self.fan_out(obj, "");
    }
}

/// Records deletions in a [`TombstoneTracker`] before forwarding to `inner`.
/// Adding a key again clears its tombstone.
pub struct TrackDeletes<A> {
    tombstones: Arc<TombstoneTracker>,
    inner: Arc<dyn EventHandler<A>>,
}

impl<A> TrackDeletes<A> {
    pub fn new(tombstones: Arc<TombstoneTracker>, inner: Arc<dyn EventHandler<A>>) -> Self {
        Self { tombstones, inner }
    }
}

impl<A: Resource> EventHandler<A> for TrackDeletes<A> {
    fn on_add(&self, obj: &A) {
        if let Ok(key) = obj.key() {
            self.tombstones.forget(&key);
        }
        self.inner.on_add(obj);
    }

    fn on_update(&self, old: &A, new: &A) {
        self.inner.on_update(old, new);
    }

    fn on_delete(&self, obj: &A) {
        if let Ok(key) = obj.key() {
            self.tombstones.record(key);
        }
        self.inner.on_delete(obj);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recon_core::{DynamicObject, ObjectMeta};
    use recon_store::Cache;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Sink(Mutex<Vec<String>>);

    impl Enqueue<DynamicObject> for Sink {
        fn enqueue(&self, obj: &DynamicObject, reason: &str) {
            self.0.lock().unwrap().push(format!("{}{}", obj.object_ref(), reason));
        }
    }

    fn obj(name: &str, annotations: &[(&str, &str)]) -> DynamicObject {
        let mut meta = ObjectMeta::new("ws", None, name);
        for (k, v) in annotations {
            meta.annotations.insert(k.to_string(), v.to_string());
        }
        DynamicObject::new(meta)
    }

    #[test]
    fn fallback_index_is_used_only_when_primary_is_empty() {
        let store: Arc<Cache<DynamicObject>> = Arc::new(Cache::new());
        store
            .add_index("by-export", Arc::new(|o: &DynamicObject| o.metadata.annotation("export").map(str::to_string).into_iter().collect()))
            .unwrap();
        store
            .add_index("by-identity", Arc::new(|o: &DynamicObject| o.metadata.annotation("identity").map(str::to_string).into_iter().collect()))
            .unwrap();
        store.upsert(obj("b1", &[("identity", "id-1")])).unwrap();
        let sink = Arc::new(Sink::default());
        let fanout = IndexFanout::<DynamicObject, DynamicObject>::new("export->binding", store.clone(), sink.clone())
                .by_key_index("by-export")
                .by_index("by-identity", |e: &DynamicObject| e.metadata.annotation("id").map(str::to_string).into_iter().collect());

        let export = obj("e1", &[("id", "id-1")]);
        fanout.on_add(&export);
        assert_eq!(*sink.0.lock().unwrap(), ["ws|b1 because of DynamicObject ws|e1"]);

        store.upsert(obj("b2", &[("export", "ws|e1")])).unwrap();
        sink.0.lock().unwrap().clear();
        fanout.on_add(&export);
        assert_eq!(*sink.0.lock().unwrap(), ["ws|b2 because of DynamicObject ws|e1"]);
    }

    #[test]
    fn filter_runs_before_lookup() {
        let store: Arc<Cache<DynamicObject>> = Arc::new(Cache::new());
        let sink = Arc::new(Sink::default());
        // No index registered: a lookup would fail loudly, the filter must stop it first.
        let fanout = IndexFanout::<DynamicObject, DynamicObject>::new("x", store, sink.clone()).by_key_index("missing").filter(|_: &DynamicObject| false);
        fanout.on_delete(&obj("a", &[]));
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[test]
    fn update_reason_names_the_version_that_passed_the_filter() {
        let store: Arc<Cache<DynamicObject>> = Arc::new(Cache::new());
        store
            .add_index("by-export", Arc::new(|o: &DynamicObject| o.metadata.annotation("export").map(str::to_string).into_iter().collect()))
            .unwrap();
        store.upsert(obj("b1", &[("export", "ws|e-old")])).unwrap();
        let sink = Arc::new(Sink::default());
        let fanout = IndexFanout::<DynamicObject, DynamicObject>::new("export->binding", store, sink.clone())
            .by_key_index("by-export")
            .filter(|e: &DynamicObject| e.metadata.annotation("active").is_some());

        fanout.on_update(&obj("e-old", &[("active", "true")]), &obj("e-new", &[]));
        assert_eq!(*sink.0.lock().unwrap(), ["ws|b1 because of DynamicObject ws|e-old"]);
    }

    #[test]
    fn annotation_lookup_resolves_bare_names_and_full_keys() {
        let store: Arc<Cache<DynamicObject>> = Arc::new(Cache::new());
        store.upsert(obj("schema-a", &[])).unwrap();
        let mut other = obj("schema-b", &[]);
        other.metadata.cluster = "root".into();
        store.upsert(other).unwrap();
        let sink = Arc::new(Sink::default());
        let lookup =
            LookupFanout::<DynamicObject, DynamicObject>::by_annotation("crd->schema", store, "schema", sink.clone());

        lookup.on_add(&obj("crd-1", &[("schema", "schema-a")]));
        lookup.on_add(&obj("crd-2", &[("schema", "root|schema-b")]));
        lookup.on_add(&obj("crd-3", &[("schema", "missing")]));
        lookup.on_add(&obj("crd-4", &[]));
        assert_eq!(
            *sink.0.lock().unwrap(),
            ["ws|schema-a because of DynamicObject ws|crd-1", "root|schema-b because of DynamicObject ws|crd-2"]
        );
    }
}
