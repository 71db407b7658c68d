//! Per-resource outcome of one reconcile pass.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{ReleaseRef, ResourceIdentifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Prune,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Prune => "prune",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum ResourceOutcome {
    Created,
    Updated,
    Unchanged,
    Pruned,
    Failed { op: OperationKind, message: String },
    /// Never dispatched (fail-fast, cancellation, or prune aborted).
    Skipped { op: OperationKind },
    /// In flight when cancellation arrived; the mutation may or may not have landed.
    Cancelled { op: OperationKind },
}

impl ResourceOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, ResourceOutcome::Failed { .. } | ResourceOutcome::Skipped { .. } | ResourceOutcome::Cancelled { .. })
    }
}

impl fmt::Display for ResourceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceOutcome::Created => f.write_str("created"),
            ResourceOutcome::Updated => f.write_str("updated"),
            ResourceOutcome::Unchanged => f.write_str("unchanged"),
            ResourceOutcome::Pruned => f.write_str("pruned"),
            ResourceOutcome::Failed { op, message } => write!(f, "{op} failed: {message}"),
            ResourceOutcome::Skipped { op } => write!(f, "{op} skipped"),
            ResourceOutcome::Cancelled { op } => write!(f, "{op} cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceResult {
    pub id: ResourceIdentifier,
    #[serde(flatten)]
    pub outcome: ResourceOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub release: ReleaseRef,
    /// Sequence stamped onto touched resources.
    pub revision: u64,
    pub results: Vec<ResourceResult>,
    /// False when nothing changed and no new revision was recorded.
    pub revision_recorded: bool,
}

impl ReconcileReport {
    pub fn new(release: ReleaseRef, revision: u64) -> Self {
        Self { release, revision, results: Vec::new(), revision_recorded: false }
    }

    pub fn push(&mut self, id: ResourceIdentifier, outcome: ResourceOutcome) {
        self.results.push(ResourceResult { id, outcome });
    }

    pub fn is_success(&self) -> bool {
        self.results.iter().all(|r| !r.outcome.is_failure())
    }

    pub fn failed(&self) -> impl Iterator<Item = &ResourceResult> {
        self.results.iter().filter(|r| r.outcome.is_failure())
    }

    pub fn with_outcome<'a>(&'a self, outcome: &'a ResourceOutcome) -> impl Iterator<Item = &'a ResourceIdentifier> + 'a {
        self.results.iter().filter(move |r| &r.outcome == outcome).map(|r| &r.id)
    }

    pub fn created(&self) -> Vec<&ResourceIdentifier> { self.with_outcome(&ResourceOutcome::Created).collect() }
    pub fn updated(&self) -> Vec<&ResourceIdentifier> { self.with_outcome(&ResourceOutcome::Updated).collect() }
    pub fn unchanged(&self) -> Vec<&ResourceIdentifier> { self.with_outcome(&ResourceOutcome::Unchanged).collect() }
    pub fn pruned(&self) -> Vec<&ResourceIdentifier> { self.with_outcome(&ResourceOutcome::Pruned).collect() }

    /// True when no resource was created, updated or pruned.
    pub fn is_noop(&self) -> bool {
        self.results.iter().all(|r| r.outcome == ResourceOutcome::Unchanged)
    }

    pub fn outcome_of(&self, id: &ResourceIdentifier) -> Option<&ResourceOutcome> {
        self.results.iter().find(|r| &r.id == id).map(|r| &r.outcome)
    }
}
