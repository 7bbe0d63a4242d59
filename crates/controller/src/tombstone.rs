//! Recently deleted keys, used to mask cache reads that have not caught up yet.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use recon_core::ObjectKey;
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_TOMBSTONE_TTL: Duration = Duration::from_secs(600);

/// Set of keys observed as deleted. An entry lives until it is forgotten (by a
/// reconciler, or because the key was added again) or its TTL runs out.
pub struct TombstoneTracker {
    ttl: Duration,
    state: Mutex<State>,
}

struct State {
    entries: FxHashMap<ObjectKey, Instant>,
    last_sweep: Instant,
}

impl State {
    fn sweep(&mut self, ttl: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, at| at.elapsed() < ttl);
        self.last_sweep = Instant::now();
        before - self.entries.len()
    }
}

impl Default for TombstoneTracker {
    fn default() -> Self {
        Self::new(DEFAULT_TOMBSTONE_TTL)
    }
}

impl TombstoneTracker {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, state: Mutex::new(State { entries: FxHashMap::default(), last_sweep: Instant::now() }) }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track `key` as deleted. Expired entries are swept at most once per TTL.
    pub fn record(&self, key: ObjectKey) {
        debug!(key = %key, "tombstone recorded");
        let mut st = self.state();
        if st.last_sweep.elapsed() >= self.ttl {
            st.sweep(self.ttl);
        }
        st.entries.insert(key, Instant::now());
    }

    /// Returns true if `key` was tracked.
    pub fn forget(&self, key: &ObjectKey) -> bool {
        self.state().entries.remove(key).is_some()
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        let mut st = self.state();
        match st.entries.get(key) {
            Some(at) if at.elapsed() < self.ttl => true,
            Some(_) => {
                st.entries.remove(key);
                false
            }
            None => false,
        }
    }

    /// `None` when `key` is tombstoned, `obj` otherwise.
    pub fn mask<T>(&self, key: &ObjectKey, obj: Option<T>) -> Option<T> {
        if obj.is_some() && self.contains(key) {
            debug!(key = %key, "cached object masked by tombstone");
            return None;
        }
        obj
    }

    /// Drop expired entries; returns how many were removed.
    pub fn prune(&self) -> usize {
        self.state().sweep(self.ttl)
    }

    /// Number of live (unexpired) tombstones.
    pub fn len(&self) -> usize {
        let ttl = self.ttl;
        self.state().entries.values().filter(|at| at.elapsed() < ttl).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::from_parts("ws", None, name).unwrap()
    }

    #[test]
    fn mask_hides_tombstoned_objects_until_forgotten() {
        let t = TombstoneTracker::default();
        t.record(key("crd-a"));
        assert_eq!(t.mask(&key("crd-a"), Some(1)), None);
        assert_eq!(t.mask(&key("crd-b"), Some(2)), Some(2));
        assert!(t.forget(&key("crd-a")));
        assert!(!t.forget(&key("crd-a")));
        assert_eq!(t.mask(&key("crd-a"), Some(1)), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let t = TombstoneTracker::new(Duration::from_secs(60));
        t.record(key("a"));
        tokio::time::advance(Duration::from_secs(30)).await;
        t.record(key("b"));
        assert!(t.contains(&key("a")));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(t.prune(), 1);
        assert!(!t.contains(&key("a")));
        assert!(t.contains(&key("b")));
        assert_eq!(t.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_names_do_not_accumulate() {
        let t = TombstoneTracker::new(Duration::from_secs(60));
        for i in 0..1000 {
            t.record(key(&format!("gone-{i}")));
        }
        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(t.len(), 0);

        // The next record sweeps the stale entries out of the map.
        t.record(key("fresh"));
        assert_eq!(t.state().entries.len(), 1);
        assert!(t.contains(&key("fresh")));
    }
}
