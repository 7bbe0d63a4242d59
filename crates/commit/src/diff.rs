//! JSON merge-patch (RFC 7386) generation and application, plus a humanised
//! change summary for log lines.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

/// Smallest merge patch turning `old` into `new`, or `None` when they are equal.
/// Removed keys become `null`; arrays and scalars are replaced wholesale.
pub fn merge_patch(old: &Json, new: &Json) -> Option<Json> {
    match (old, new) {
        (Json::Object(o), Json::Object(n)) => {
            let mut out = Map::new();
            for (k, nv) in n.iter() {
                match o.get(k) {
                    Some(ov) if ov == nv => {}
                    Some(ov) => {
                        if let Some(p) = merge_patch(ov, nv) {
                            out.insert(k.clone(), p);
                        }
                    }
                    None => {
                        out.insert(k.clone(), nv.clone());
                    }
                }
            }
            for k in o.keys() {
                if !n.contains_key(k) {
                    out.insert(k.clone(), Json::Null);
                }
            }
            if out.is_empty() {
                None
            } else {
                Some(Json::Object(out))
            }
        }
        (o, n) if o == n => None,
        (_, n) => Some(n.clone()),
    }
}

/// Apply a merge patch to `target` in place.
pub fn apply_merge_patch(target: &mut Json, patch: &Json) {
    let Json::Object(p) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Json::Object(Map::new());
    }
    if let Json::Object(t) = target {
        for (k, pv) in p.iter() {
            if pv.is_null() {
                t.remove(k);
            } else {
                apply_merge_patch(t.entry(k.clone()).or_insert(Json::Null), pv);
            }
        }
    }
}

/// Drop fields the server owns so they never show up as reconciler changes.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("uid");
        meta.remove("generation");
        meta.remove("creationTimestamp");
    }
    v
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool {
        self.adds == 0 && self.updates == 0 && self.removes == 0
    }
}

/// Count leaf-level adds/updates/removes going from `base` to `target`.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                s.updates += aa.iter().zip(bb.iter()).filter(|(x, y)| x != y).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => {
                if av != bv {
                    s.updates += 1;
                }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}
