//! Recon store: in-RAM object cache keyed by [`ObjectKey`] with named secondary
//! indexes, plus an [`Informer`] that applies change events to the cache and
//! fans them out to registered handlers.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use recon_core::{ObjectKey, Resource};
use rustc_hash::{FxHashMap, FxHashSet};

pub mod informer;

pub use informer::{Event, EventHandler, FilteringHandler, Informer};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("index {0:?} does not exist")]
    IndexNotFound(String),
    #[error("index {0:?} already exists")]
    IndexExists(String),
    #[error("object key: {0}")]
    Key(#[from] recon_core::KeyError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Computes the index values an object is filed under.
pub type IndexFunc<K> = Arc<dyn Fn(&K) -> Vec<String> + Send + Sync>;

/// List filter. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    pub cluster: Option<String>,
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl Selector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn cluster(cluster: impl Into<String>) -> Self {
        Self { cluster: Some(cluster.into()), ..Default::default() }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn matches<K: Resource>(&self, obj: &K) -> bool {
        let meta = obj.meta();
        if self.cluster.as_deref().map_or(false, |c| c != meta.cluster) {
            return false;
        }
        if self.namespace.is_some() && self.namespace != meta.namespace {
            return false;
        }
        self.labels.iter().all(|(k, v)| meta.labels.get(k) == Some(v))
    }
}

/// Read side of the store boundary as seen by controllers and fan-out handlers.
pub trait ObjectStore<K>: Send + Sync {
    fn list(&self, selector: &Selector) -> Vec<Arc<K>>;
    fn get_by_key(&self, key: &ObjectKey) -> Result<Option<Arc<K>>, StoreError>;
    fn by_index(&self, index: &str, value: &str) -> Result<Vec<Arc<K>>, StoreError>;
    fn add_index(&self, name: &str, func: IndexFunc<K>) -> Result<(), StoreError>;
}

struct Index<K> {
    func: IndexFunc<K>,
    entries: FxHashMap<String, FxHashSet<ObjectKey>>,
}

impl<K> Index<K> {
    fn insert(&mut self, key: &ObjectKey, obj: &K) {
        for value in (self.func)(obj) {
            self.entries.entry(value).or_default().insert(key.clone());
        }
    }

    fn remove(&mut self, key: &ObjectKey, obj: &K) {
        for value in (self.func)(obj) {
            if let Some(set) = self.entries.get_mut(&value) {
                set.remove(key);
                if set.is_empty() {
                    self.entries.remove(&value);
                }
            }
        }
    }
}

struct CacheState<K> {
    items: FxHashMap<ObjectKey, Arc<K>>,
    indexes: FxHashMap<String, Index<K>>,
}

/// Thread-safe object cache. Items and indexes sit behind one lock so an index
/// never points at a key the item map does not hold.
pub struct Cache<K> {
    state: RwLock<CacheState<K>>,
}

impl<K: Resource> Default for Cache<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Resource> Cache<K> {
    pub fn new() -> Self {
        Self { state: RwLock::new(CacheState { items: FxHashMap::default(), indexes: FxHashMap::default() }) }
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState<K>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState<K>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace `obj`; returns the previous version, if any.
    pub fn upsert(&self, obj: K) -> Result<(Option<Arc<K>>, Arc<K>), StoreError> {
        let key = obj.key()?;
        let obj = Arc::new(obj);
        let mut st = self.write();
        let st = &mut *st;
        let old = st.items.insert(key.clone(), Arc::clone(&obj));
        for index in st.indexes.values_mut() {
            if let Some(old) = old.as_deref() {
                index.remove(&key, old);
            }
            index.insert(&key, &obj);
        }
        Ok((old, obj))
    }

    /// Remove the object stored under `key`, returning it.
    pub fn remove(&self, key: &ObjectKey) -> Option<Arc<K>> {
        let mut st = self.write();
        let st = &mut *st;
        let old = st.items.remove(key)?;
        for index in st.indexes.values_mut() {
            index.remove(key, &old);
        }
        Some(old)
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.read().items.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every cached object.
    pub fn all(&self) -> Vec<Arc<K>> {
        self.read().items.values().cloned().collect()
    }

    /// Keys filed under `value` in `index`, without resolving the objects.
    pub fn index_keys(&self, index: &str, value: &str) -> Result<Vec<ObjectKey>, StoreError> {
        let st = self.read();
        let idx = st.indexes.get(index).ok_or_else(|| StoreError::IndexNotFound(index.to_string()))?;
        Ok(idx.entries.get(value).map(|set| set.iter().cloned().collect()).unwrap_or_default())
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.read().indexes.contains_key(name)
    }

    /// Register `func` under `name` unless an index with that name exists already.
    pub fn add_index_if_absent(&self, name: &str, func: IndexFunc<K>) -> Result<(), StoreError> {
        match self.add_index(name, func) {
            Err(StoreError::IndexExists(_)) => Ok(()),
            other => other,
        }
    }
}

impl<K: Resource> ObjectStore<K> for Cache<K> {
    fn list(&self, selector: &Selector) -> Vec<Arc<K>> {
        self.read().items.values().filter(|o| selector.matches::<K>(o)).cloned().collect()
    }

    fn get_by_key(&self, key: &ObjectKey) -> Result<Option<Arc<K>>, StoreError> {
        Ok(self.read().items.get(key).cloned())
    }

    fn by_index(&self, index: &str, value: &str) -> Result<Vec<Arc<K>>, StoreError> {
        let st = self.read();
        let idx = st.indexes.get(index).ok_or_else(|| StoreError::IndexNotFound(index.to_string()))?;
        let Some(keys) = idx.entries.get(value) else { return Ok(Vec::new()) };
        let mut out: Vec<Arc<K>> = keys.iter().filter_map(|k| st.items.get(k).cloned()).collect();
        out.sort_by(|a, b| a.meta().name.cmp(&b.meta().name));
        Ok(out)
    }

    /// Indexes added after objects were cached are backfilled immediately.
    fn add_index(&self, name: &str, func: IndexFunc<K>) -> Result<(), StoreError> {
        let mut st = self.write();
        if st.indexes.contains_key(name) {
            return Err(StoreError::IndexExists(name.to_string()));
        }
        let mut index = Index { func, entries: FxHashMap::default() };
        for (key, obj) in st.items.iter() {
            index.insert(key, obj);
        }
        st.indexes.insert(name.to_string(), index);
        Ok(())
    }
}

/// Index name for [`index_by_cluster`].
pub const BY_CLUSTER: &str = "by-cluster";

/// Files every object under its logical cluster.
pub fn index_by_cluster<K: Resource>() -> IndexFunc<K> {
    Arc::new(|obj: &K| vec![obj.meta().cluster.clone()])
}
