//! Recon kubehub: kube-rs integration for the store and write boundaries.
//!
//! [`watch`] turns a list+watch stream into informer [`Event`]s and
//! [`KubeWriter`] applies committer patches as JSON merge patches.

#![forbid(unsafe_code)]

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject as KubeObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::{watcher, WatchStreamExt},
    Client,
};
use metrics::counter;
use recon_commit::{WriteError, Writer};
use recon_core::{DynamicObject, ObjectMeta, ObjectRef, OwnerReference};
use recon_store::Event;
use serde_json::{Map, Value as Json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Parse `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] => Ok(GroupVersionKind::gvk(group, version, kind)),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// Resolve `gvk` against the server's discovery data; returns the resource and
/// whether it is namespaced.
pub async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// Convert a kube object into the engine's schemaless object, placing it in `cluster`.
pub fn from_kube(obj: &KubeObject, cluster: &str) -> Result<DynamicObject> {
    let m = &obj.metadata;
    let name = m.name.clone().ok_or_else(|| anyhow!("object missing metadata.name"))?;
    let mut meta = ObjectMeta::new(cluster, m.namespace.as_deref(), name);
    meta.uid = m.uid.clone().unwrap_or_default();
    meta.resource_version = m.resource_version.clone();
    meta.labels = m.labels.clone().unwrap_or_default();
    meta.annotations = m.annotations.clone().unwrap_or_default();
    meta.owner_references = m
        .owner_references
        .iter()
        .flatten()
        .map(|o| OwnerReference {
            api_version: o.api_version.clone(),
            kind: o.kind.clone(),
            name: o.name.clone(),
            uid: o.uid.clone(),
            controller: o.controller,
        })
        .collect();
    let data = match &obj.data {
        Json::Object(map) => map.clone(),
        Json::Null => Map::new(),
        other => bail!("unexpected object body: {}", other),
    };
    let (api_version, kind) =
        obj.types.as_ref().map(|t| (t.api_version.clone(), t.kind.clone())).unwrap_or_default();
    Ok(DynamicObject { api_version, kind, metadata: meta, data })
}

fn non_empty<T>(v: T, empty: bool) -> Option<T> {
    (!empty).then_some(v)
}

/// Inverse of [`from_kube`]; the cluster is dropped.
pub fn to_kube(obj: &DynamicObject, ar: &ApiResource) -> KubeObject {
    let m = &obj.metadata;
    let mut out = KubeObject::new(&m.name, ar).data(Json::Object(obj.data.clone()));
    out.metadata = metav1::ObjectMeta {
        name: Some(m.name.clone()),
        namespace: m.namespace.clone(),
        uid: non_empty(m.uid.clone(), m.uid.is_empty()),
        resource_version: m.resource_version.clone(),
        labels: non_empty(m.labels.clone(), m.labels.is_empty()),
        annotations: non_empty(m.annotations.clone(), m.annotations.is_empty()),
        owner_references: non_empty(
            m.owner_references
                .iter()
                .map(|o| metav1::OwnerReference {
                    api_version: o.api_version.clone(),
                    kind: o.kind.clone(),
                    name: o.name.clone(),
                    uid: o.uid.clone(),
                    controller: o.controller,
                    block_owner_deletion: None,
                })
                .collect(),
            m.owner_references.is_empty(),
        ),
        ..Default::default()
    };
    out
}

/// Map one watcher event to an informer event. Objects that cannot be
/// converted are skipped with a warning.
pub fn translate(ev: watcher::Event<KubeObject>, cluster: &str) -> Option<Event<DynamicObject>> {
    let convert = |o: &KubeObject| match from_kube(o, cluster) {
        Ok(obj) => Some(obj),
        Err(e) => {
            warn!(error = %e, "skipping unconvertible object");
            None
        }
    };
    match ev {
        watcher::Event::Applied(o) => convert(&o).map(Event::Updated),
        watcher::Event::Deleted(o) => convert(&o).map(Event::Deleted),
        watcher::Event::Restarted(list) => {
            debug!(count = list.len(), "watch restart");
            Some(Event::Replaced(list.iter().filter_map(convert).collect()))
        }
    }
}

/// List+watch `api` and forward translated events into `tx` until `cancel`
/// fires or the receiver goes away. Stream errors are retried with backoff.
pub async fn watch(
    api: Api<KubeObject>,
    cluster: String,
    tx: mpsc::Sender<Event<DynamicObject>>,
    cancel: CancellationToken,
) -> Result<()> {
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(cluster = %cluster, "watcher started");
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };
        let ev = match next {
            Some(Ok(ev)) => ev,
            Some(Err(e)) => {
                counter!("kube_watch_errors_total", 1u64);
                warn!(error = %e, "watch error");
                continue;
            }
            None => {
                warn!("watcher stream ended");
                break;
            }
        };
        counter!("kube_watch_events_total", 1u64);
        if let Some(ev) = translate(ev, &cluster) {
            if tx.send(ev).await.is_err() {
                debug!("informer gone, stopping watch");
                break;
            }
        }
    }
    Ok(())
}

/// Build an `Api` for `ar`, scoped to `namespace` when the resource is namespaced.
pub fn dynamic_api(client: Client, ar: &ApiResource, namespaced: bool, namespace: Option<&str>) -> Api<KubeObject> {
    match (namespaced, namespace) {
        (true, Some(ns)) => Api::namespaced_with(client, ns, ar),
        _ => Api::all_with(client, ar),
    }
}

/// Map API status codes onto write errors.
pub fn map_kube_error(err: kube::Error) -> WriteError {
    if let kube::Error::Api(resp) = &err {
        match resp.code {
            404 => return WriteError::NotFound(resp.message.clone()),
            409 => return WriteError::Conflict(resp.message.clone()),
            422 => return WriteError::Invalid(resp.message.clone()),
            _ => {}
        }
    }
    WriteError::Other(anyhow::Error::new(err))
}

/// [`Writer`] over one API resource of a live cluster.
#[derive(Clone)]
pub struct KubeWriter {
    client: Client,
    resource: ApiResource,
    namespaced: bool,
    field_manager: String,
}

impl KubeWriter {
    pub fn new(client: Client, resource: ApiResource, namespaced: bool) -> Self {
        Self { client, resource, namespaced, field_manager: "reconctl".into() }
    }

    pub fn with_field_manager(mut self, name: impl Into<String>) -> Self {
        self.field_manager = name.into();
        self
    }

    fn api(&self, namespace: Option<&str>) -> Api<KubeObject> {
        dynamic_api(self.client.clone(), &self.resource, self.namespaced, namespace)
    }
}

#[async_trait]
impl Writer<DynamicObject> for KubeWriter {
    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, WriteError> {
        let api = self.api(obj.metadata.namespace.as_deref());
        let pp = PostParams { field_manager: Some(self.field_manager.clone()), ..Default::default() };
        let created = api.create(&pp, &to_kube(obj, &self.resource)).await.map_err(map_kube_error)?;
        Ok(from_kube(&created, &obj.metadata.cluster).context("decoding created object")?)
    }

    async fn patch(&self, target: &ObjectRef, patch: &Json) -> Result<DynamicObject, WriteError> {
        let api = self.api(target.namespace.as_deref());
        let pp = PatchParams { field_manager: Some(self.field_manager.clone()), ..Default::default() };
        let patched = api.patch(&target.name, &pp, &Patch::Merge(patch)).await.map_err(map_kube_error)?;
        debug!(obj = %target, "patched");
        Ok(from_kube(&patched, &target.cluster).context("decoding patched object")?)
    }

    async fn patch_status(&self, target: &ObjectRef, patch: &Json) -> Result<DynamicObject, WriteError> {
        let api = self.api(target.namespace.as_deref());
        let pp = PatchParams { field_manager: Some(self.field_manager.clone()), ..Default::default() };
        let patched = api.patch_status(&target.name, &pp, &Patch::Merge(patch)).await.map_err(map_kube_error)?;
        debug!(obj = %target, "status patched");
        Ok(from_kube(&patched, &target.cluster).context("decoding patched status")?)
    }
}
