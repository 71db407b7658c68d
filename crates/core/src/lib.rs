//! Yoke core types: resource identity, resource sets, releases and revisions.

#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod abi;
pub mod config;
pub mod error;
pub mod normalize;
pub mod report;

pub use config::Settings;
pub use error::{Error, Result};
pub use report::{OperationKind, ReconcileReport, ResourceOutcome, ResourceResult};

/// Label every managed object carries.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "yoke";
pub const RELEASE_LABEL: &str = "yoke.cd/release";
pub const RELEASE_NAMESPACE_LABEL: &str = "yoke.cd/release-namespace";
pub const REVISION_ANNOTATION: &str = "yoke.cd/revision";

/// Addresses one cluster object. Fields are fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceIdentifier {
    name: String,
    namespace: String,
    kind: String,
    api_version: String,
}

impl ResourceIdentifier {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, kind: impl Into<String>, api_version: impl Into<String>) -> Self {
        Self { name: name.into(), namespace: namespace.into(), kind: kind.into(), api_version: api_version.into() }
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn namespace(&self) -> &str { &self.namespace }
    pub fn kind(&self) -> &str { &self.kind }
    pub fn api_version(&self) -> &str { &self.api_version }

    /// Empty for cluster-scoped objects.
    pub fn namespace_opt(&self) -> Option<&str> {
        if self.namespace.is_empty() { None } else { Some(&self.namespace) }
    }

    /// `(group, version)` split of `apiVersion`; core group is empty.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", self.api_version.as_str()),
        }
    }

    /// Version-independent key: the same object served under two versions of
    /// one group matches.
    pub fn object_key(&self) -> ObjectKey {
        ObjectKey {
            group: self.group_version().0.to_string(),
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ResourceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}:{}/{}", self.api_version, self.kind, self.name)
        } else {
            write!(f, "{}:{}/{}/{}", self.api_version, self.kind, self.namespace, self.name)
        }
    }
}

/// A resource manifest with its identity split out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDocument {
    pub id: ResourceIdentifier,
    pub payload: Json,
}

impl ResourceDocument {
    /// Build from a raw manifest. Requires apiVersion, kind and metadata.name.
    pub fn from_json(payload: Json) -> Result<Self> {
        let id = normalize::identify(&payload)?;
        Ok(Self { id, payload })
    }

    /// Payload with server-managed fields and ownership stamps removed.
    pub fn normalized(&self) -> Json {
        normalize::strip_server_fields(&self.payload)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.payload.get("metadata").and_then(|m| m.get("labels")).and_then(|l| l.get(key)).and_then(Json::as_str)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.payload.get("metadata").and_then(|m| m.get("annotations")).and_then(|a| a.get(key)).and_then(Json::as_str)
    }

    /// True when the ownership labels point at `release`.
    pub fn is_owned_by(&self, release: &ReleaseRef) -> bool {
        self.label(MANAGED_BY_LABEL) == Some(MANAGED_BY_VALUE)
            && self.label(RELEASE_LABEL) == Some(release.name.as_str())
            && self.label(RELEASE_NAMESPACE_LABEL) == Some(release.namespace.as_str())
    }

    /// Copy of this document carrying the ownership labels and revision annotation.
    pub fn stamped(&self, release: &ReleaseRef, sequence: u64) -> Self {
        let mut payload = self.payload.clone();
        if let Some(obj) = payload.as_object_mut() {
            let meta = obj.entry("metadata").or_insert_with(|| Json::Object(Default::default()));
            if let Some(meta) = meta.as_object_mut() {
                let labels = meta.entry("labels").or_insert_with(|| Json::Object(Default::default()));
                if let Some(labels) = labels.as_object_mut() {
                    labels.insert(MANAGED_BY_LABEL.into(), Json::String(MANAGED_BY_VALUE.into()));
                    labels.insert(RELEASE_LABEL.into(), Json::String(release.name.clone()));
                    labels.insert(RELEASE_NAMESPACE_LABEL.into(), Json::String(release.namespace.clone()));
                }
                let annos = meta.entry("annotations").or_insert_with(|| Json::Object(Default::default()));
                if let Some(annos) = annos.as_object_mut() {
                    annos.insert(REVISION_ANNOTATION.into(), Json::String(sequence.to_string()));
                }
            }
        }
        Self { id: self.id.clone(), payload }
    }
}

/// Ordered, identifier-unique sequence of documents in apply order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<ResourceDocument>", into = "Vec<ResourceDocument>")]
pub struct ResourceSet {
    docs: Vec<ResourceDocument>,
    index: HashMap<ResourceIdentifier, usize>,
}

impl ResourceSet {
    pub fn new() -> Self { Self::default() }

    /// Keeps the given order. Two documents naming the same cluster object,
    /// even under different API versions, are an `AmbiguousResource` error.
    pub fn from_documents(docs: Vec<ResourceDocument>) -> Result<Self> {
        let mut index = HashMap::with_capacity(docs.len());
        let mut objects = HashSet::with_capacity(docs.len());
        for (i, d) in docs.iter().enumerate() {
            if !objects.insert(d.id.object_key()) || index.insert(d.id.clone(), i).is_some() {
                return Err(Error::AmbiguousResource(d.id.clone()));
            }
        }
        Ok(Self { docs, index })
    }

    pub fn len(&self) -> usize { self.docs.len() }
    pub fn is_empty(&self) -> bool { self.docs.is_empty() }
    pub fn iter(&self) -> std::slice::Iter<'_, ResourceDocument> { self.docs.iter() }
    pub fn ids(&self) -> impl Iterator<Item = &ResourceIdentifier> { self.docs.iter().map(|d| &d.id) }
    pub fn contains(&self, id: &ResourceIdentifier) -> bool { self.index.contains_key(id) }
    pub fn get(&self, id: &ResourceIdentifier) -> Option<&ResourceDocument> { self.index.get(id).map(|&i| &self.docs[i]) }

    /// Same identifiers in the same order with equal normalized payloads.
    pub fn same_content(&self, other: &ResourceSet) -> bool {
        self.docs.len() == other.docs.len()
            && self.docs.iter().zip(other.docs.iter()).all(|(a, b)| a.id == b.id && a.normalized() == b.normalized())
    }
}

impl TryFrom<Vec<ResourceDocument>> for ResourceSet {
    type Error = Error;
    fn try_from(docs: Vec<ResourceDocument>) -> Result<Self> { Self::from_documents(docs) }
}

impl From<ResourceSet> for Vec<ResourceDocument> {
    fn from(set: ResourceSet) -> Self { set.docs }
}

impl<'a> IntoIterator for &'a ResourceSet {
    type Item = &'a ResourceDocument;
    type IntoIter = std::slice::Iter<'a, ResourceDocument>;
    fn into_iter(self) -> Self::IntoIter { self.docs.iter() }
}

/// A named, namespace-scoped release.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReleaseRef {
    pub name: String,
    pub namespace: String,
}

impl ReleaseRef {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { name: name.into(), namespace: namespace.into() }
    }
}

impl fmt::Display for ReleaseRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Flight,
    Manifest,
}

/// Where a revision's resources came from and with which inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub kind: SourceKind,
    /// Module path or manifest path.
    pub reference: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub values: Json,
}

impl SourceDescriptor {
    pub fn flight(reference: impl Into<String>) -> Self {
        Self { kind: SourceKind::Flight, reference: reference.into(), args: Vec::new(), values: Json::Null }
    }

    pub fn manifest(reference: impl Into<String>) -> Self {
        Self { kind: SourceKind::Manifest, reference: reference.into(), args: Vec::new(), values: Json::Null }
    }
}

/// One historical snapshot of a release's desired resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub release: ReleaseRef,
    pub sequence: u64,
    pub resources: ResourceSet,
    /// Seconds since epoch.
    pub created_at: i64,
    pub source: SourceDescriptor,
    pub active: bool,
}

impl Revision {
    pub fn meta(&self) -> RevisionMeta {
        RevisionMeta {
            sequence: self.sequence,
            created_at: self.created_at,
            source: self.source.clone(),
            active: self.active,
            resource_count: self.resources.len(),
        }
    }
}

/// Revision without resource bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionMeta {
    pub sequence: u64,
    pub created_at: i64,
    pub source: SourceDescriptor,
    pub active: bool,
    pub resource_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationKind {
    Append,
    Reactivate,
}

/// Entry of the activation log: which sequence became active, when and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activation {
    pub sequence: u64,
    pub at: i64,
    pub kind: ActivationKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseHistory {
    pub release: ReleaseRef,
    pub revisions: Vec<RevisionMeta>,
    pub activations: Vec<Activation>,
}

impl ReleaseHistory {
    pub fn active(&self) -> Option<&RevisionMeta> {
        self.revisions.iter().find(|r| r.active)
    }
}

pub mod prelude {
    pub use super::{
        Activation, ActivationKind, Error, ReleaseHistory, ReleaseRef, ResourceDocument, ResourceIdentifier, ResourceSet, Result,
        Revision, RevisionMeta, SourceDescriptor, SourceKind,
    };
}
