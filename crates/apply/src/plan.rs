//! Planning: classify desired and live-owned resources into create, update,
//! unchanged and prune. Matching is by group, kind, namespace and name, so an
//! object served under a different version of the same group still matches.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use yoke_core::normalize::apply_rank;
use yoke_core::{ObjectKey, OperationKind, ReleaseRef, ResourceDocument, ResourceIdentifier, ResourceSet};

use crate::diff::{diff_documents, FieldChange};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Action {
    Create,
    Update { changes: Vec<FieldChange> },
    Unchanged,
    Prune,
}

impl Action {
    pub fn operation(&self) -> Option<OperationKind> {
        match self {
            Action::Create => Some(OperationKind::Create),
            Action::Update { .. } => Some(OperationKind::Update),
            Action::Unchanged => None,
            Action::Prune => Some(OperationKind::Prune),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Step {
    pub id: ResourceIdentifier,
    #[serde(flatten)]
    pub action: Action,
}

/// Desired resources in apply order, then prunes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub release: ReleaseRef,
    pub steps: Vec<Step>,
    #[serde(skip)]
    pub(crate) desired: ResourceSet,
}

impl Plan {
    /// Steps for `desired` against `live_owned`. `previous` feeds the dropped-field check.
    pub fn compute(release: &ReleaseRef, desired: &ResourceSet, previous: Option<&ResourceSet>, live_owned: &[ResourceDocument]) -> Self {
        let live: HashMap<ObjectKey, &ResourceDocument> = live_owned.iter().map(|d| (d.id.object_key(), d)).collect();
        let prev: HashMap<ObjectKey, &ResourceDocument> =
            previous.map(|p| p.iter().map(|d| (d.id.object_key(), d)).collect()).unwrap_or_default();

        let mut steps = Vec::with_capacity(desired.len() + live_owned.len());
        let mut wanted = HashSet::with_capacity(desired.len());
        for doc in desired {
            let key = doc.id.object_key();
            let action = match live.get(&key) {
                None => Action::Create,
                Some(l) => {
                    let changes = diff_documents(doc, l, prev.get(&key).copied());
                    if changes.is_empty() { Action::Unchanged } else { Action::Update { changes } }
                }
            };
            steps.push(Step { id: doc.id.clone(), action });
            wanted.insert(key);
        }

        // Dependents go before the namespaces and CRDs they live in.
        let mut prunes: Vec<&ResourceDocument> = live_owned.iter().filter(|d| !wanted.contains(&d.id.object_key())).collect();
        prunes.sort_by(|a, b| apply_rank(b.id.kind()).cmp(&apply_rank(a.id.kind())).then_with(|| a.id.cmp(&b.id)));
        steps.extend(prunes.into_iter().map(|d| Step { id: d.id.clone(), action: Action::Prune }));

        Plan { release: release.clone(), steps, desired: desired.clone() }
    }

    fn with(&self, f: impl Fn(&Action) -> bool) -> Vec<&ResourceIdentifier> {
        self.steps.iter().filter(|s| f(&s.action)).map(|s| &s.id).collect()
    }

    pub fn creates(&self) -> Vec<&ResourceIdentifier> { self.with(|a| matches!(a, Action::Create)) }
    pub fn updates(&self) -> Vec<&ResourceIdentifier> { self.with(|a| matches!(a, Action::Update { .. })) }
    pub fn unchanged(&self) -> Vec<&ResourceIdentifier> { self.with(|a| matches!(a, Action::Unchanged)) }
    pub fn prunes(&self) -> Vec<&ResourceIdentifier> { self.with(|a| matches!(a, Action::Prune)) }

    /// Nothing to create, update or prune.
    pub fn is_noop(&self) -> bool {
        self.steps.iter().all(|s| s.action == Action::Unchanged)
    }

    pub fn desired(&self) -> &ResourceSet { &self.desired }
}
