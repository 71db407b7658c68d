//! Turbulence: compare live state with the active revision, read-only.

use serde::Serialize;
use yoke_core::{ReleaseRef, ResourceIdentifier, Result};

use crate::diff::FieldChange;
use crate::pilot::Pilot;
use crate::plan::{Action, Plan};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DriftState {
    /// Desired but absent live.
    Missing,
    Modified { changes: Vec<FieldChange> },
    /// Owned live but not desired; an apply would prune it.
    UnmanagedExtra,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftEntry {
    pub id: ResourceIdentifier,
    #[serde(flatten)]
    pub state: DriftState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftReport {
    pub release: ReleaseRef,
    pub revision: u64,
    pub entries: Vec<DriftEntry>,
    pub no_drift: bool,
}

impl DriftReport {
    fn from_plan(plan: Plan, revision: u64) -> Self {
        let entries: Vec<DriftEntry> = plan
            .steps
            .into_iter()
            .map(|s| DriftEntry {
                id: s.id,
                state: match s.action {
                    Action::Create => DriftState::Missing,
                    Action::Update { changes } => DriftState::Modified { changes },
                    Action::Prune => DriftState::UnmanagedExtra,
                    Action::Unchanged => DriftState::Unchanged,
                },
            })
            .collect();
        let no_drift = entries.iter().all(|e| e.state == DriftState::Unchanged);
        Self { release: plan.release, revision, entries, no_drift }
    }

    pub fn drifted(&self) -> impl Iterator<Item = &DriftEntry> {
        self.entries.iter().filter(|e| e.state != DriftState::Unchanged)
    }
}

impl Pilot {
    /// Drift of `release` against its active revision. Never mutates.
    pub async fn turbulence(&self, release: &ReleaseRef) -> Result<DriftReport> {
        let active = self.store.get_active(release)?;
        let live = self.observe(release, Some(&active.resources)).await?;
        let plan = Plan::compute(release, &active.resources, None, &live);
        let report = DriftReport::from_plan(plan, active.sequence);
        tracing::debug!(release = %release, revision = active.sequence, drifted = report.drifted().count(), "turbulence");
        Ok(report)
    }
}
