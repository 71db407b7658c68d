//! Blackbox: read-only views of a release's stored history.

use serde::Serialize;
use yoke_core::{ReleaseHistory, ReleaseRef, ResourceIdentifier, Result, Revision};

use crate::diff::{exact_diff, FieldChange};
use crate::pilot::Pilot;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Inspection {
    pub history: ReleaseHistory,
    pub revision: Revision,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "change", rename_all = "lowercase")]
pub enum RevisionChange {
    Added,
    Removed,
    Changed { changes: Vec<FieldChange> },
    Same,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RevisionDiffEntry {
    pub id: ResourceIdentifier,
    #[serde(flatten)]
    pub change: RevisionChange,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RevisionDiff {
    pub release: ReleaseRef,
    pub from: u64,
    pub to: u64,
    pub entries: Vec<RevisionDiffEntry>,
}

impl Pilot {
    /// History plus the body of `sequence`, or of the active revision.
    pub fn blackbox(&self, release: &ReleaseRef, sequence: Option<u64>) -> Result<Inspection> {
        let history = self.store.history(release)?;
        let revision = match sequence {
            Some(seq) => self.store.get_by_sequence(release, seq)?,
            None => self.store.get_active(release)?,
        };
        Ok(Inspection { history, revision })
    }

    /// Per-resource differences between two stored revisions.
    pub fn compare(&self, release: &ReleaseRef, from: u64, to: u64) -> Result<RevisionDiff> {
        let a = self.store.get_by_sequence(release, from)?;
        let b = self.store.get_by_sequence(release, to)?;
        let mut entries = Vec::new();
        for doc in &b.resources {
            let change = match a.resources.iter().find(|d| d.id.object_key() == doc.id.object_key()) {
                None => RevisionChange::Added,
                Some(old) => {
                    let changes = exact_diff(&old.normalized(), &doc.normalized());
                    if changes.is_empty() { RevisionChange::Same } else { RevisionChange::Changed { changes } }
                }
            };
            entries.push(RevisionDiffEntry { id: doc.id.clone(), change });
        }
        for doc in &a.resources {
            if !b.resources.iter().any(|d| d.id.object_key() == doc.id.object_key()) {
                entries.push(RevisionDiffEntry { id: doc.id.clone(), change: RevisionChange::Removed });
            }
        }
        Ok(RevisionDiff { release: release.clone(), from, to, entries })
    }
}
