//! Yoke kubehub: the cluster contract the reconciler and capabilities consume,
//! backed by kube-rs (`KubeCluster`) or by memory (`MemoryCluster`).

#![forbid(unsafe_code)]

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{verbs, Discovery, Scope},
    Client, Config,
};
use metrics::counter;
use tokio::sync::RwLock;
use tracing::debug;
use yoke_core::{ReleaseRef, ResourceDocument, ResourceIdentifier, MANAGED_BY_LABEL, MANAGED_BY_VALUE, RELEASE_LABEL, RELEASE_NAMESPACE_LABEL};

mod memory;

pub use memory::{ClusterOp, MemoryCluster};

/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "yoke";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("transport: {0}")]
    Transport(String),
}

impl From<ClusterError> for yoke_core::Error {
    fn from(e: ClusterError) -> Self {
        yoke_core::Error::Cluster(e.to_string())
    }
}

/// Abstract resource store keyed by `ResourceIdentifier`.
#[async_trait]
pub trait Cluster: Send + Sync {
    async fn get(&self, id: &ResourceIdentifier) -> Result<ResourceDocument, ClusterError>;
    /// Every live object carrying `release`'s ownership labels.
    async fn list_owned(&self, release: &ReleaseRef) -> Result<Vec<ResourceDocument>, ClusterError>;
    async fn create(&self, doc: &ResourceDocument) -> Result<ResourceDocument, ClusterError>;
    async fn update(&self, doc: &ResourceDocument) -> Result<ResourceDocument, ClusterError>;
    async fn delete(&self, id: &ResourceIdentifier) -> Result<(), ClusterError>;
}

/// Label selector matching `release`'s ownership labels.
pub fn owner_selector(release: &ReleaseRef) -> String {
    format!(
        "{}={},{}={},{}={}",
        MANAGED_BY_LABEL, MANAGED_BY_VALUE, RELEASE_LABEL, release.name, RELEASE_NAMESPACE_LABEL, release.namespace
    )
}

/// kube-rs backed cluster. Discovery is cached and refreshed once on a miss,
/// so kinds registered by CRDs earlier in the same run resolve.
pub struct KubeCluster {
    client: Client,
    discovery: RwLock<Option<Arc<Discovery>>>,
}

impl KubeCluster {
    /// Connect using an explicit kubeconfig, or the default inference chain.
    pub async fn connect(kubeconfig: Option<&Path>) -> anyhow::Result<Self> {
        let client = match kubeconfig {
            Some(path) => {
                let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
                let cfg = Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default()).await.context("loading kubeconfig")?;
                Client::try_from(cfg).context("building kube client")?
            }
            None => Client::try_default().await.context("inferring kube client config")?,
        };
        Ok(Self::from_client(client))
    }

    pub fn from_client(client: Client) -> Self {
        Self { client, discovery: RwLock::new(None) }
    }

    async fn discovery(&self, refresh: bool) -> Result<Arc<Discovery>, ClusterError> {
        if !refresh {
            if let Some(d) = self.discovery.read().await.as_ref() {
                return Ok(d.clone());
            }
        }
        let d = Arc::new(Discovery::new(self.client.clone()).run().await.map_err(map_kube_err)?);
        *self.discovery.write().await = Some(d.clone());
        Ok(d)
    }

    async fn resolve(&self, id: &ResourceIdentifier) -> Result<(ApiResource, bool), ClusterError> {
        let (group, version) = id.group_version();
        let gvk = GroupVersionKind::gvk(group, version, id.kind());
        for refresh in [false, true] {
            let discovery = self.discovery(refresh).await?;
            if let Some((ar, caps)) = discovery.resolve_gvk(&gvk) {
                return Ok((ar, matches!(caps.scope, Scope::Namespaced)));
            }
        }
        Err(ClusterError::Invalid(format!("unknown resource kind {}/{}", id.api_version(), id.kind())))
    }

    async fn api_for(&self, id: &ResourceIdentifier) -> Result<Api<DynamicObject>, ClusterError> {
        let (ar, namespaced) = self.resolve(id).await?;
        if namespaced {
            match id.namespace_opt() {
                Some(ns) => Ok(Api::namespaced_with(self.client.clone(), ns, &ar)),
                None => Err(ClusterError::Invalid(format!("namespace required for namespaced kind {}", id.kind()))),
            }
        } else {
            Ok(Api::all_with(self.client.clone(), &ar))
        }
    }
}

fn map_kube_err(e: kube::Error) -> ClusterError {
    match e {
        kube::Error::Api(resp) => match resp.code {
            401 => ClusterError::Unauthenticated(resp.message),
            403 => ClusterError::Forbidden(resp.message),
            404 => ClusterError::NotFound(resp.message),
            409 if resp.reason == "AlreadyExists" => ClusterError::AlreadyExists(resp.message),
            409 => ClusterError::Conflict(resp.message),
            400 | 422 => ClusterError::Invalid(resp.message),
            code => ClusterError::Transport(format!("{} ({})", resp.message, code)),
        },
        kube::Error::Auth(e) => ClusterError::Unauthenticated(e.to_string()),
        other => ClusterError::Transport(other.to_string()),
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn to_document(obj: &DynamicObject) -> Result<ResourceDocument, ClusterError> {
    let mut raw = serde_json::to_value(obj).map_err(|e| ClusterError::Transport(format!("serializing DynamicObject: {e}")))?;
    strip_managed_fields(&mut raw);
    ResourceDocument::from_json(raw).map_err(|e| ClusterError::Transport(format!("decoding live object: {e}")))
}

fn to_object(doc: &ResourceDocument) -> Result<DynamicObject, ClusterError> {
    serde_json::from_value(doc.payload.clone()).map_err(|e| ClusterError::Invalid(format!("{}: {e}", doc.id)))
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn get(&self, id: &ResourceIdentifier) -> Result<ResourceDocument, ClusterError> {
        counter!("cluster_calls_total", 1, "op" => "get");
        let api = self.api_for(id).await?;
        let obj = api.get(id.name()).await.map_err(map_kube_err)?;
        to_document(&obj)
    }

    async fn list_owned(&self, release: &ReleaseRef) -> Result<Vec<ResourceDocument>, ClusterError> {
        counter!("cluster_calls_total", 1, "op" => "list");
        let discovery = self.discovery(false).await?;
        let lp = ListParams::default().labels(&owner_selector(release));
        let mut out = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if !caps.supports_operation(verbs::LIST) {
                    continue;
                }
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                let all: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
                let listed = match all.list(&lp).await.map_err(map_kube_err) {
                    // No cluster-wide list permission: fall back to the release namespace.
                    Err(ClusterError::Forbidden(_)) if namespaced => {
                        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), &release.namespace, &ar);
                        api.list(&lp).await.map_err(map_kube_err)
                    }
                    other => other,
                };
                match listed {
                    Ok(list) => {
                        for obj in list.items.iter() {
                            out.push(to_document(obj)?);
                        }
                    }
                    Err(ClusterError::Forbidden(msg)) | Err(ClusterError::NotFound(msg)) => {
                        debug!(kind = %ar.kind, group = %ar.group, reason = %msg, "skipping unlistable kind");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(out)
    }

    async fn create(&self, doc: &ResourceDocument) -> Result<ResourceDocument, ClusterError> {
        counter!("cluster_calls_total", 1, "op" => "create");
        let api = self.api_for(&doc.id).await?;
        let pp = PostParams { field_manager: Some(FIELD_MANAGER.to_string()), ..Default::default() };
        let obj = api.create(&pp, &to_object(doc)?).await.map_err(map_kube_err)?;
        to_document(&obj)
    }

    async fn update(&self, doc: &ResourceDocument) -> Result<ResourceDocument, ClusterError> {
        counter!("cluster_calls_total", 1, "op" => "update");
        let api = self.api_for(&doc.id).await?;
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        let obj = api.patch(doc.id.name(), &pp, &Patch::Apply(&doc.payload)).await.map_err(map_kube_err)?;
        to_document(&obj)
    }

    async fn delete(&self, id: &ResourceIdentifier) -> Result<(), ClusterError> {
        counter!("cluster_calls_total", 1, "op" => "delete");
        let api = self.api_for(id).await?;
        api.delete(id.name(), &DeleteParams::background()).await.map_err(map_kube_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_names_all_ownership_labels() {
        let s = owner_selector(&ReleaseRef::new("web", "prod"));
        assert_eq!(s, "app.kubernetes.io/managed-by=yoke,yoke.cd/release=web,yoke.cd/release-namespace=prod");
    }

    #[test]
    fn api_errors_map_to_cluster_outcomes() {
        let resp = |code: u16, reason: &str| {
            kube::Error::Api(kube::core::ErrorResponse { status: "Failure".into(), message: "m".into(), reason: reason.into(), code })
        };
        assert_eq!(map_kube_err(resp(403, "Forbidden")), ClusterError::Forbidden("m".into()));
        assert_eq!(map_kube_err(resp(404, "NotFound")), ClusterError::NotFound("m".into()));
        assert_eq!(map_kube_err(resp(401, "Unauthorized")), ClusterError::Unauthenticated("m".into()));
        assert_eq!(map_kube_err(resp(409, "AlreadyExists")), ClusterError::AlreadyExists("m".into()));
        assert_eq!(map_kube_err(resp(409, "Conflict")), ClusterError::Conflict("m".into()));
        assert!(matches!(map_kube_err(resp(500, "InternalError")), ClusterError::Transport(_)));
    }
}
