//! In-memory cluster: same contract as `KubeCluster`, with RBAC, session and
//! failure injection so reconcile and capability paths can be exercised
//! without an API server.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as Json;
use yoke_core::{ReleaseRef, ResourceDocument, ResourceIdentifier};

use crate::{Cluster, ClusterError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterOp {
    Get,
    List,
    Create,
    Update,
    Delete,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ResourceIdentifier, Json>,
    /// `(kind, namespace)`; `None` namespace forbids the kind everywhere.
    forbidden: HashSet<(String, Option<String>)>,
    unauthenticated: bool,
    failures: HashMap<(ResourceIdentifier, ClusterOp), String>,
    calls: Vec<(ClusterOp, Option<ResourceIdentifier>)>,
    next_rv: u64,
}

#[derive(Default)]
pub struct MemoryCluster {
    inner: Mutex<Inner>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryCluster {
    pub fn new() -> Self { Self::default() }

    /// Every mutating call sleeps this long, so concurrency is observable.
    pub fn with_latency(latency: Duration) -> Self {
        Self { latency: Some(latency), ..Self::default() }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, ClusterError> {
        self.inner.lock().map_err(|_| ClusterError::Transport("memory cluster lock poisoned".into()))
    }

    /// Write an object directly, bypassing RBAC and failure injection.
    pub fn insert(&self, payload: Json) {
        if let (Ok(doc), Ok(mut inner)) = (ResourceDocument::from_json(payload), self.inner.lock()) {
            inner.objects.insert(doc.id, doc.payload);
        }
    }

    /// Remove an object directly (simulates out-of-band deletion).
    pub fn remove(&self, id: &ResourceIdentifier) -> Option<Json> {
        self.inner.lock().ok().and_then(|mut i| i.objects.remove(id))
    }

    /// Current raw object, ignoring RBAC.
    pub fn object(&self, id: &ResourceIdentifier) -> Option<Json> {
        self.inner.lock().ok().and_then(|i| i.objects.get(id).cloned())
    }

    pub fn ids(&self) -> Vec<ResourceIdentifier> {
        self.inner.lock().map(|i| i.objects.keys().cloned().collect()).unwrap_or_default()
    }

    pub fn forbid(&self, kind: &str, namespace: Option<&str>) {
        if let Ok(mut i) = self.inner.lock() {
            i.forbidden.insert((kind.to_string(), namespace.map(str::to_string)));
        }
    }

    pub fn set_unauthenticated(&self, on: bool) {
        if let Ok(mut i) = self.inner.lock() {
            i.unauthenticated = on;
        }
    }

    /// Make `op` on `id` fail with a transport error.
    pub fn fail(&self, id: &ResourceIdentifier, op: ClusterOp, message: &str) {
        if let Ok(mut i) = self.inner.lock() {
            i.failures.insert((id.clone(), op), message.to_string());
        }
    }

    pub fn calls(&self) -> Vec<(ClusterOp, Option<ResourceIdentifier>)> {
        self.inner.lock().map(|i| i.calls.clone()).unwrap_or_default()
    }

    /// Count of mutating calls (create/update/delete) seen so far.
    pub fn mutation_count(&self) -> usize {
        self.calls().iter().filter(|(op, _)| matches!(op, ClusterOp::Create | ClusterOp::Update | ClusterOp::Delete)).count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn admit(&self, op: ClusterOp, id: Option<&ResourceIdentifier>) -> Result<(), ClusterError> {
        let mut inner = self.lock()?;
        inner.calls.push((op, id.cloned()));
        if inner.unauthenticated {
            return Err(ClusterError::Unauthenticated("session expired".into()));
        }
        if let Some(id) = id {
            let kind = id.kind().to_string();
            let everywhere = inner.forbidden.contains(&(kind.clone(), None));
            let here = inner.forbidden.contains(&(kind, Some(id.namespace().to_string())));
            if everywhere || here {
                return Err(ClusterError::Forbidden(format!("cannot {op:?} {}", id)));
            }
            if let Some(msg) = inner.failures.get(&(id.clone(), op)) {
                return Err(ClusterError::Transport(msg.clone()));
            }
        }
        Ok(())
    }

    async fn mutate<T>(&self, f: impl FnOnce(&mut Inner) -> Result<T, ClusterError>) -> Result<T, ClusterError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(d) = self.latency {
            tokio::time::sleep(d).await;
        }
        let res = self.lock().and_then(|mut inner| f(&mut inner));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        res
    }
}

fn server_fields(payload: &mut Json, rv: u64, keep_from: Option<&Json>) {
    let Some(meta) = payload.get_mut("metadata").and_then(Json::as_object_mut) else { return };
    let prev = keep_from.and_then(|p| p.get("metadata"));
    let uid = prev.and_then(|m| m.get("uid")).cloned().unwrap_or_else(|| Json::String(uuid::Uuid::new_v4().to_string()));
    let created = prev
        .and_then(|m| m.get("creationTimestamp"))
        .cloned()
        .unwrap_or_else(|| Json::String(chrono::Utc::now().to_rfc3339()));
    meta.insert("uid".into(), uid);
    meta.insert("creationTimestamp".into(), created);
    meta.insert("resourceVersion".into(), Json::String(rv.to_string()));
}

#[async_trait]
impl Cluster for MemoryCluster {
    async fn get(&self, id: &ResourceIdentifier) -> Result<ResourceDocument, ClusterError> {
        self.admit(ClusterOp::Get, Some(id))?;
        let inner = self.lock()?;
        match inner.objects.get(id) {
            Some(payload) => Ok(ResourceDocument { id: id.clone(), payload: payload.clone() }),
            None => Err(ClusterError::NotFound(id.to_string())),
        }
    }

    async fn list_owned(&self, release: &ReleaseRef) -> Result<Vec<ResourceDocument>, ClusterError> {
        self.admit(ClusterOp::List, None)?;
        let inner = self.lock()?;
        let visible = |id: &ResourceIdentifier| {
            !inner.forbidden.contains(&(id.kind().to_string(), None))
                && !inner.forbidden.contains(&(id.kind().to_string(), Some(id.namespace().to_string())))
        };
        Ok(inner
            .objects
            .iter()
            .filter(|(id, _)| visible(id))
            .map(|(id, payload)| ResourceDocument { id: id.clone(), payload: payload.clone() })
            .filter(|doc| doc.is_owned_by(release))
            .collect())
    }

    async fn create(&self, doc: &ResourceDocument) -> Result<ResourceDocument, ClusterError> {
        self.admit(ClusterOp::Create, Some(&doc.id))?;
        let doc = doc.clone();
        self.mutate(move |inner| {
            if inner.objects.contains_key(&doc.id) {
                return Err(ClusterError::AlreadyExists(doc.id.to_string()));
            }
            inner.next_rv += 1;
            let mut payload = doc.payload;
            server_fields(&mut payload, inner.next_rv, None);
            inner.objects.insert(doc.id.clone(), payload.clone());
            Ok(ResourceDocument { id: doc.id, payload })
        })
        .await
    }

    async fn update(&self, doc: &ResourceDocument) -> Result<ResourceDocument, ClusterError> {
        self.admit(ClusterOp::Update, Some(&doc.id))?;
        let doc = doc.clone();
        self.mutate(move |inner| {
            let Some(prev) = inner.objects.get(&doc.id).cloned() else {
                return Err(ClusterError::NotFound(doc.id.to_string()));
            };
            inner.next_rv += 1;
            let mut payload = doc.payload;
            server_fields(&mut payload, inner.next_rv, Some(&prev));
            inner.objects.insert(doc.id.clone(), payload.clone());
            Ok(ResourceDocument { id: doc.id, payload })
        })
        .await
    }

    async fn delete(&self, id: &ResourceIdentifier) -> Result<(), ClusterError> {
        self.admit(ClusterOp::Delete, Some(id))?;
        let id = id.clone();
        self.mutate(move |inner| match inner.objects.remove(&id) {
            Some(_) => Ok(()),
            None => Err(ClusterError::NotFound(id.to_string())),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cm(name: &str) -> ResourceDocument {
        ResourceDocument::from_json(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": "ns" },
            "data": { "k": "v" }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn create_get_update_delete() {
        let c = MemoryCluster::new();
        let doc = cm("a");
        let created = c.create(&doc).await.unwrap();
        let uid = created.payload["metadata"]["uid"].clone();
        assert_eq!(created.normalized(), doc.normalized());
        assert!(matches!(c.create(&doc).await, Err(ClusterError::AlreadyExists(_))));

        let mut changed = doc.clone();
        changed.payload["data"]["k"] = json!("w");
        let updated = c.update(&changed).await.unwrap();
        assert_eq!(updated.payload["metadata"]["uid"], uid);
        assert_eq!(c.get(&doc.id).await.unwrap().payload["data"]["k"], "w");

        c.delete(&doc.id).await.unwrap();
        assert!(matches!(c.get(&doc.id).await, Err(ClusterError::NotFound(_))));
        assert!(matches!(c.delete(&doc.id).await, Err(ClusterError::NotFound(_))));
    }

    #[tokio::test]
    async fn rbac_and_session_are_distinct_from_absence() {
        let c = MemoryCluster::new();
        c.insert(cm("a").payload);
        c.forbid("ConfigMap", Some("ns"));
        assert!(matches!(c.get(&cm("a").id).await, Err(ClusterError::Forbidden(_))));
        assert!(matches!(c.get(&cm("missing").id).await, Err(ClusterError::Forbidden(_))));
        c.set_unauthenticated(true);
        assert!(matches!(c.get(&cm("a").id).await, Err(ClusterError::Unauthenticated(_))));
    }

    #[tokio::test]
    async fn list_owned_filters_by_labels() {
        let c = MemoryCluster::new();
        let release = ReleaseRef::new("r", "ns");
        c.create(&cm("mine").stamped(&release, 1)).await.unwrap();
        c.create(&cm("theirs").stamped(&ReleaseRef::new("other", "ns"), 1)).await.unwrap();
        c.create(&cm("unlabeled")).await.unwrap();
        let owned = c.list_owned(&release).await.unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].id.name(), "mine");
    }
}
