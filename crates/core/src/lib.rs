//! Recon core types: object metadata, the `Resource` capability trait and
//! deterministic object keys shared by the queue, the store and controllers.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod key;

pub use key::{KeyError, ObjectKey, ObjectRef};

/// Reference from a dependent object to the object that owns it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<bool>,
}

/// Identity and bookkeeping fields carried by every object.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Logical cluster (workspace) the object lives in; empty for single-cluster setups.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "SmallVec::is_empty")]
    pub owner_references: SmallVec<[OwnerReference; 2]>,
}

impl ObjectMeta {
    pub fn new(cluster: impl Into<String>, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            namespace: namespace.map(str::to_string),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Capability set the engine needs from a reconciled kind: identity access and
/// value copies. `Clone` is the deep copy handed to reconcilers; `Serialize`
/// feeds the committer's diff.
pub trait Resource: Clone + Serialize + Send + Sync + 'static {
    /// Human-readable kind used in log lines and metric labels.
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;

    /// Derive the object's queue/store key.
    fn key(&self) -> Result<ObjectKey, KeyError> {
        ObjectKey::for_meta(self.meta())
    }

    fn object_ref(&self) -> ObjectRef {
        ObjectRef::from_meta(self.meta())
    }
}

/// Schemaless object: metadata plus arbitrary JSON body (spec, status, data, ...).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DynamicObject {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(flatten)]
    pub data: serde_json::Map<String, serde_json::Value>,
}

impl DynamicObject {
    pub fn new(metadata: ObjectMeta) -> Self {
        Self { metadata, ..Default::default() }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        if let serde_json::Value::Object(map) = data {
            self.data = map;
        }
        self
    }
}

impl Resource for DynamicObject {
    const KIND: &'static str = "DynamicObject";

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

pub mod prelude {
    pub use super::{DynamicObject, KeyError, ObjectKey, ObjectMeta, ObjectRef, OwnerReference, Resource};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_object_round_trips_through_json() {
        let mut meta = ObjectMeta::new("root:org", Some("default"), "cm-a");
        meta.resource_version = Some("42".into());
        meta.annotations.insert("a".into(), "b".into());
        let obj = DynamicObject::new(meta).with_data(serde_json::json!({"data": {"k": "v"}}));

        let v = serde_json::to_value(&obj).unwrap();
        assert_eq!(v["metadata"]["resourceVersion"], "42");
        assert_eq!(v["metadata"]["cluster"], "root:org");
        assert_eq!(v["data"]["k"], "v");
        assert!(v["metadata"].get("labels").is_none());

        let back: DynamicObject = serde_json::from_value(v).unwrap();
        assert_eq!(back, obj);
    }

    #[test]
    fn resource_key_uses_metadata() {
        let obj = DynamicObject::new(ObjectMeta::new("ws", Some("default"), "foo"));
        assert_eq!(obj.key().unwrap().as_str(), "ws|default/foo");
        assert_eq!(obj.object_ref().name, "foo");
    }
}
