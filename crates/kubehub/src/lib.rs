//! Mirra kubehub – resolves a GVK against the cluster and serves it as a [`Source`]

#![forbid(unsafe_code)]

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use kube::{
    api::{Api, ListParams, WatchParams},
    core::{DynamicObject, ErrorResponse, GroupVersionKind, WatchEvent as KubeEvent},
    discovery::{Discovery, Scope},
    Client,
};
use mirra_core::{LabelSelector, Labels, Object, ObjectList, Source, SourceError, WatchEvent, WatchStream};
use tracing::{debug, info, warn};

/// Server-side watch timeout; the server closes the stream after this and the reflector relists.
const WATCH_TIMEOUT_SECS: u32 = 290;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("invalid gvk key: {0} (expect v1/Kind or group/v1/Kind)")]
    InvalidGvk(String),
    #[error("GVK not found: {0}")]
    NotFound(String),
    #[error("kube client: {0}")]
    Client(#[from] kube::Error),
}

/// List/watch access to one kind, optionally scoped to a namespace and label selector.
#[derive(Clone)]
pub struct KubeSource {
    api: Api<DynamicObject>,
    gvk_key: String,
    namespaced: bool,
    list_params: ListParams,
    watch_params: WatchParams,
}

impl KubeSource {
    /// Resolve `gvk_key` via discovery and build the API handle.
    ///
    /// `namespace` is ignored for cluster-scoped kinds.
    pub async fn connect(
        gvk_key: &str,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Self, ConnectError> {
        let client = Client::try_default().await?;
        let gvk = parse_gvk_key(gvk_key)?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;

        let api: Api<DynamicObject> = match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(client, ns, &ar),
            _ => Api::all_with(client, &ar),
        };
        if !namespaced && namespace.is_some() {
            debug!(gvk = %gvk_key, "kind is cluster-scoped; namespace ignored");
        }

        let mut list_params = ListParams::default();
        let mut watch_params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        if !selector.is_everything() {
            let sel = selector.to_string();
            list_params = list_params.labels(&sel);
            watch_params = watch_params.labels(&sel);
        }
        info!(gvk = %gvk_key, ns = ?namespace, namespaced, selector = %selector, "source resolved");
        Ok(Self { api, gvk_key: gvk_key.to_string(), namespaced, list_params, watch_params })
    }

    pub fn gvk_key(&self) -> &str {
        &self.gvk_key
    }

    pub fn is_namespaced(&self) -> bool {
        self.namespaced
    }
}

#[async_trait]
impl Source for KubeSource {
    type Object = Object;

    async fn list(&self) -> Result<ObjectList<Object>, SourceError> {
        let list = self.api.list(&self.list_params).await.map_err(classify)?;
        let resource_version = list.metadata.resource_version.clone().unwrap_or_default();
        let items: Vec<Object> = list.items.into_iter().map(object_from).collect();
        debug!(gvk = %self.gvk_key, items = items.len(), rv = %resource_version, "list");
        Ok(ObjectList { items, resource_version })
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<Object>, SourceError> {
        let stream = self.api.watch(&self.watch_params, resource_version).await.map_err(classify)?;
        debug!(gvk = %self.gvk_key, rv = %resource_version, "watch");
        Ok(stream.map_err(classify).and_then(|ev| futures::future::ready(translate(ev))).boxed())
    }
}

fn parse_gvk_key(key: &str) -> Result<GroupVersionKind, ConnectError> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() })
        }
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(ConnectError::InvalidGvk(key.to_string())),
    }
}

async fn find_api_resource(
    client: Client,
    gvk: &GroupVersionKind,
) -> Result<(kube::core::ApiResource, bool), ConnectError> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(ConnectError::NotFound(format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)))
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn object_from(o: DynamicObject) -> Object {
    let mut raw = match serde_json::to_value(&o) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "serializing DynamicObject");
            serde_json::Value::Null
        }
    };
    strip_managed_fields(&mut raw);

    let meta = o.metadata;
    // BTreeMap iteration keeps labels sorted
    let labels: Labels = meta.labels.unwrap_or_default().into_iter().collect();
    Object {
        namespace: meta.namespace,
        name: meta.name.unwrap_or_default(),
        resource_version: meta.resource_version.unwrap_or_default(),
        creation_ts: meta.creation_timestamp.map(|t| t.0.timestamp()).unwrap_or(0),
        labels,
        raw,
    }
}

fn is_gone(resp: &ErrorResponse) -> bool {
    resp.code == 410 || resp.reason == "Expired" || resp.reason == "Gone"
}

fn status_error(resp: ErrorResponse) -> SourceError {
    if is_gone(&resp) {
        SourceError::StaleVersion(resp.message)
    } else {
        SourceError::Transient(format!("{} ({}): {}", resp.reason, resp.code, resp.message))
    }
}

fn classify(err: kube::Error) -> SourceError {
    match err {
        kube::Error::Api(resp) => status_error(resp),
        other => SourceError::Transient(other.to_string()),
    }
}

fn translate(ev: KubeEvent<DynamicObject>) -> Result<WatchEvent<Object>, SourceError> {
    match ev {
        KubeEvent::Added(o) => Ok(WatchEvent::Added(object_from(o))),
        KubeEvent::Modified(o) => Ok(WatchEvent::Modified(object_from(o))),
        KubeEvent::Deleted(o) => Ok(WatchEvent::Deleted(object_from(o))),
        KubeEvent::Bookmark(b) => Ok(WatchEvent::Bookmark(b.metadata.resource_version)),
        KubeEvent::Error(resp) => Err(status_error(resp)),
    }
}
