//! Recon commit: persist what a reconciler changed, and nothing else.
//!
//! The [`Committer`] serialises the pre-reconcile snapshot and the mutated copy,
//! computes a JSON merge patch between them and, only when the patch is not
//! empty, sends it through a [`Writer`]. Changes under `status` go to the
//! status subresource in a second request; everything else goes to the main
//! endpoint. Each request carries `resourceVersion` and `uid` as
//! preconditions, so a concurrent external write surfaces as
//! [`WriteError::Conflict`] instead of being overwritten.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use metrics::counter;
use recon_core::{ObjectKey, ObjectRef, Resource};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tracing::{debug, warn};

pub mod diff;

pub use diff::{apply_merge_patch, diff_summary, merge_patch, strip_noisy, DiffSummary};

#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WriteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, WriteError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, WriteError::Conflict(_))
    }
}

/// Write side of the store boundary.
#[async_trait]
pub trait Writer<K>: Send + Sync {
    async fn create(&self, obj: &K) -> Result<K, WriteError>;
    /// Apply a JSON merge patch to the object identified by `target`.
    async fn patch(&self, target: &ObjectRef, patch: &Json) -> Result<K, WriteError>;

    /// Apply a merge patch to the `status` subresource. Stores without one
    /// accept status edits through `patch`.
    async fn patch_status(&self, target: &ObjectRef, patch: &Json) -> Result<K, WriteError> {
        self.patch(target, patch).await
    }
}

/// What a controller needs from a committer.
#[async_trait]
pub trait Commit<K>: Send + Sync {
    async fn commit(&self, old: &K, new: &K) -> Result<(), WriteError>;

    /// Drop any state kept for `key`, e.g. once the object is gone.
    fn forget(&self, _key: &ObjectKey) {}
}

/// One commit, split by endpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patches {
    /// Everything except `status`.
    pub main: Option<Json>,
    /// `{"status": ...}` only.
    pub status: Option<Json>,
}

impl Patches {
    pub fn is_empty(&self) -> bool {
        self.main.is_none() && self.status.is_none()
    }
}

#[derive(PartialEq)]
struct Applied {
    base_rv: Option<String>,
    patches: Patches,
}

/// Merge-patch committer over a [`Writer`].
pub struct Committer<W> {
    writer: W,
    preconditions: bool,
    statusless: bool,
    applied: Mutex<FxHashMap<ObjectKey, Applied>>,
}

impl<W> Committer<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, preconditions: true, statusless: false, applied: Mutex::new(FxHashMap::default()) }
    }

    /// Committer that never writes `status`: status edits made by the
    /// reconciler are dropped.
    pub fn statusless(writer: W) -> Self {
        Self { statusless: true, ..Self::new(writer) }
    }

    /// Send patches without `resourceVersion`/`uid` preconditions (last writer wins).
    pub fn without_preconditions(mut self) -> Self {
        self.preconditions = false;
        self
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    fn applied(&self) -> MutexGuard<'_, FxHashMap<ObjectKey, Applied>> {
        self.applied.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn set_preconditions(patch: &mut Json, rv: Option<&str>, uid: &str) {
    let Some(obj) = patch.as_object_mut() else { return };
    let entry = obj.entry("metadata").or_insert_with(|| Json::Object(Default::default()));
    if let Some(m) = entry.as_object_mut() {
        if let Some(rv) = rv {
            m.insert("resourceVersion".into(), Json::String(rv.to_string()));
        }
        if !uid.is_empty() {
            m.insert("uid".into(), Json::String(uid.to_string()));
        }
    }
}

/// Compute the patches `commit` would send, including preconditions.
pub fn compute_patches<K: Resource>(old: &K, new: &K, preconditions: bool) -> Result<Patches, WriteError> {
    let encode = |o: &K| {
        serde_json::to_value(o).map(strip_noisy).map_err(|e| WriteError::Invalid(format!("encoding {}: {}", K::KIND, e)))
    };
    let Some(mut patch) = merge_patch(&encode(old)?, &encode(new)?) else { return Ok(Patches::default()) };
    let status = patch.as_object_mut().and_then(|o| o.remove("status"));
    let mut patches = Patches {
        main: Some(patch).filter(|p| p.as_object().map_or(true, |o| !o.is_empty())),
        status: status.map(|s| serde_json::json!({ "status": s })),
    };
    if preconditions {
        let meta = old.meta();
        for p in patches.main.iter_mut().chain(patches.status.iter_mut()) {
            set_preconditions(p, meta.resource_version.as_deref(), &meta.uid);
        }
    }
    Ok(patches)
}

#[async_trait]
impl<K, W> Commit<K> for Committer<W>
where
    K: Resource,
    W: Writer<K>,
{
    async fn commit(&self, old: &K, new: &K) -> Result<(), WriteError> {
        let mut patches = compute_patches(old, new, self.preconditions)?;
        if self.statusless && patches.status.take().is_some() {
            debug!(kind = K::KIND, obj = %old.object_ref(), "status change dropped by statusless committer");
        }
        if patches.is_empty() {
            return Ok(());
        }
        let key = old.key().map_err(|e| WriteError::Invalid(e.to_string()))?;
        let this = Applied { base_rv: old.meta().resource_version.clone(), patches };
        if self.applied().get(&key) == Some(&this) {
            counter!("commit_skipped_total", 1u64, "kind" => K::KIND);
            debug!(kind = K::KIND, key = %key, "identical patch already committed");
            return Ok(());
        }

        if tracing::enabled!(tracing::Level::DEBUG) {
            let summary = match (serde_json::to_value(new), serde_json::to_value(old)) {
                (Ok(n), Ok(o)) => diff_summary(&strip_noisy(n), &strip_noisy(o)),
                _ => DiffSummary::default(),
            };
            debug!(
                kind = K::KIND,
                key = %key,
                adds = summary.adds,
                updates = summary.updates,
                removes = summary.removes,
                "committing patch"
            );
        }

        let target = old.object_ref();
        let written = async {
            let mut rv = None;
            if let Some(main) = &this.patches.main {
                let updated = self.writer.patch(&target, main).await?;
                counter!("commit_patches_total", 1u64, "kind" => K::KIND, "part" => "main");
                rv = updated.meta().resource_version.clone();
            }
            if let Some(status) = &this.patches.status {
                let mut status = status.clone();
                // The main write bumped the version; the status write must expect the new one.
                if let (true, Some(rv)) = (self.preconditions, rv.as_deref()) {
                    set_preconditions(&mut status, Some(rv), &old.meta().uid);
                }
                self.writer.patch_status(&target, &status).await?;
                counter!("commit_patches_total", 1u64, "kind" => K::KIND, "part" => "status");
            }
            Ok::<(), WriteError>(())
        };
        match written.await {
            Ok(()) => {
                self.applied().insert(key, this);
                Ok(())
            }
            Err(e) => {
                counter!("commit_errors_total", 1u64, "kind" => K::KIND);
                warn!(kind = K::KIND, key = %key, error = %e, "commit failed");
                self.applied().remove(&key);
                Err(e)
            }
        }
    }

    fn forget(&self, key: &ObjectKey) {
        self.applied().remove(key);
    }
}
