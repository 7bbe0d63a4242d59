//! Object keys: `cluster|namespace/name`, `cluster|name` for cluster-scoped
//! objects, and the `cluster|` prefix dropped when no cluster is set.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ObjectMeta;

const CLUSTER_SEP: char = '|';
const NS_SEP: char = '/';

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("object has an empty name")]
    EmptyName,
    #[error("invalid character {ch:?} in {field} {value:?}")]
    InvalidChar { field: &'static str, value: String, ch: char },
    #[error("malformed key {0:?}")]
    Malformed(String),
}

/// Parsed identity of an object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub cluster: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn new(cluster: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self { cluster: cluster.into(), namespace: namespace.map(str::to_string), name: name.into() }
    }

    pub fn from_meta(meta: &ObjectMeta) -> Self {
        Self { cluster: meta.cluster.clone(), namespace: meta.namespace.clone(), name: meta.name.clone() }
    }

    pub fn key(&self) -> Result<ObjectKey, KeyError> {
        ObjectKey::from_parts(&self.cluster, self.namespace.as_deref(), &self.name)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.cluster.is_empty() {
            write!(f, "{}{}", self.cluster, CLUSTER_SEP)?;
        }
        match self.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => write!(f, "{}{}{}", ns, NS_SEP, self.name),
            _ => f.write_str(&self.name),
        }
    }
}

/// Deterministic string identity used for queue deduplication and store lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn for_meta(meta: &ObjectMeta) -> Result<Self, KeyError> {
        Self::from_parts(&meta.cluster, meta.namespace.as_deref(), &meta.name)
    }

    pub fn from_parts(cluster: &str, namespace: Option<&str>, name: &str) -> Result<Self, KeyError> {
        if name.is_empty() {
            return Err(KeyError::EmptyName);
        }
        check("cluster", cluster, &[CLUSTER_SEP])?;
        check("name", name, &[CLUSTER_SEP, NS_SEP])?;
        if let Some(ns) = namespace {
            check("namespace", ns, &[CLUSTER_SEP, NS_SEP])?;
        }
        Ok(Self(ObjectRef::new(cluster, namespace, name).to_string()))
    }

    /// Wrap an already-encoded key without validating it. Keys received from
    /// the queue are checked with [`ObjectKey::parse`] before use.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn parse(&self) -> Result<ObjectRef, KeyError> {
        parse_key(&self.0)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ObjectKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn check(field: &'static str, value: &str, forbidden: &[char]) -> Result<(), KeyError> {
    match value.chars().find(|c| forbidden.contains(c)) {
        Some(ch) => Err(KeyError::InvalidChar { field, value: value.to_string(), ch }),
        None => Ok(()),
    }
}

/// Split a key back into its identity. Inverse of [`ObjectKey::from_parts`].
pub fn parse_key(key: &str) -> Result<ObjectRef, KeyError> {
    let malformed = || KeyError::Malformed(key.to_string());
    let (cluster, rest) = match key.split_once(CLUSTER_SEP) {
        Some((c, r)) => {
            if c.is_empty() || r.contains(CLUSTER_SEP) {
                return Err(malformed());
            }
            (c, r)
        }
        None => ("", key),
    };
    let parts: Vec<&str> = rest.split(NS_SEP).collect();
    match parts.as_slice() {
        [name] if !name.is_empty() => Ok(ObjectRef::new(cluster, None, *name)),
        [ns, name] if !ns.is_empty() && !name.is_empty() => Ok(ObjectRef::new(cluster, Some(ns), *name)),
        _ => Err(malformed()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_encode_every_scope() {
        assert_eq!(ObjectKey::from_parts("ws", Some("default"), "foo").unwrap().as_str(), "ws|default/foo");
        assert_eq!(ObjectKey::from_parts("ws", None, "crd-1").unwrap().as_str(), "ws|crd-1");
        assert_eq!(ObjectKey::from_parts("", Some("ns"), "a").unwrap().as_str(), "ns/a");
        assert_eq!(ObjectKey::from_parts("", None, "node-1").unwrap().as_str(), "node-1");
    }

    #[test]
    fn parse_inverts_encoding() {
        for r in [
            ObjectRef::new("root:org:ws", Some("default"), "foo"),
            ObjectRef::new("root", None, "bar"),
            ObjectRef::new("", Some("kube-system"), "cm"),
            ObjectRef::new("", None, "n"),
        ] {
            let key = r.key().unwrap();
            assert_eq!(key.parse().unwrap(), r, "key={}", key);
        }
    }

    #[test]
    fn identical_identity_yields_identical_key() {
        let mut a = ObjectMeta::new("ws", Some("default"), "foo");
        let b = a.clone();
        a.resource_version = Some("7".into());
        a.annotations.insert("x".into(), "y".into());
        assert_eq!(ObjectKey::for_meta(&a).unwrap(), ObjectKey::for_meta(&b).unwrap());
    }

    #[test]
    fn invalid_identities_are_rejected() {
        assert_eq!(ObjectKey::from_parts("ws", None, ""), Err(KeyError::EmptyName));
        assert!(matches!(
            ObjectKey::from_parts("a|b", None, "x"),
            Err(KeyError::InvalidChar { field: "cluster", ch: '|', .. })
        ));
        assert!(matches!(
            ObjectKey::from_parts("ws", Some("ns"), "a/b"),
            Err(KeyError::InvalidChar { field: "name", ch: '/', .. })
        ));
    }

    #[test]
    fn malformed_keys_fail_to_parse() {
        for bad in ["", "|ns/a", "ws|", "ws|ns/", "a/b/c", "ws|a|b", "/a"] {
            assert!(parse_key(bad).is_err(), "expected {:?} to be rejected", bad);
        }
    }
}
