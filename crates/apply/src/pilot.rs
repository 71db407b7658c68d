//! Release lifecycle: takeoff (apply), descent (rollback), mayday (delete).
//!
//! Each mutating command holds the release lock for its whole pass, reads the
//! active revision, observes the live-owned set, plans, executes and records
//! the outcome in the store only when every operation succeeded.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;
use yoke_core::{Error, ReconcileReport, ReleaseRef, ResourceDocument, ResourceSet, Result, Revision, Settings, SourceDescriptor};
use yoke_kubehub::{Cluster, ClusterError};
use yoke_persist::RevisionStore;

use crate::exec::{execute, ExecOptions};
use crate::locks::ReleaseLocks;
use crate::plan::Plan;

pub struct Pilot {
    pub(crate) cluster: Arc<dyn Cluster>,
    pub(crate) store: Arc<dyn RevisionStore>,
    locks: Arc<ReleaseLocks>,
    opts: ExecOptions,
}

/// `Ok(None)` when the release has no history.
pub(crate) fn active_revision(store: &dyn RevisionStore, release: &ReleaseRef) -> Result<Option<Revision>> {
    match store.get_active(release) {
        Ok(r) => Ok(Some(r)),
        Err(Error::NotFoundRelease(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

fn finish(report: ReconcileReport) -> Result<ReconcileReport> {
    if report.is_success() { Ok(report) } else { Err(Error::ReconcileFailure(Box::new(report))) }
}

impl Pilot {
    pub fn new(cluster: Arc<dyn Cluster>, store: Arc<dyn RevisionStore>, opts: ExecOptions) -> Self {
        Self { cluster, store, locks: Arc::new(ReleaseLocks::new()), opts }
    }

    pub fn from_settings(cluster: Arc<dyn Cluster>, store: Arc<dyn RevisionStore>, settings: &Settings) -> Self {
        Self::new(cluster, store, ExecOptions::from(settings))
    }

    /// Share a lock registry with other pilots in this process.
    pub fn with_locks(mut self, locks: Arc<ReleaseLocks>) -> Self {
        self.locks = locks;
        self
    }

    /// Live objects owned by `release`. Members of `previous` that lost their
    /// ownership labels but still exist are included so they get pruned.
    pub(crate) async fn observe(&self, release: &ReleaseRef, previous: Option<&ResourceSet>) -> Result<Vec<ResourceDocument>> {
        let mut live = self.cluster.list_owned(release).await?;
        if let Some(prev) = previous {
            for doc in prev {
                let key = doc.id.object_key();
                if live.iter().any(|l| l.id.object_key() == key) {
                    continue;
                }
                match self.cluster.get(&doc.id).await {
                    Ok(found) => live.push(found),
                    Err(ClusterError::NotFound(_) | ClusterError::Forbidden(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(live)
    }

    /// What a takeoff of `desired` would do, without touching anything.
    pub async fn plan(&self, release: &ReleaseRef, desired: &ResourceSet) -> Result<Plan> {
        let active = active_revision(self.store.as_ref(), release)?;
        let previous = active.as_ref().map(|r| &r.resources);
        let live = self.observe(release, previous).await?;
        Ok(Plan::compute(release, desired, previous, &live))
    }

    fn next_sequence(&self, release: &ReleaseRef) -> Result<u64> {
        match self.store.history(release) {
            Ok(h) => Ok(h.revisions.last().map_or(1, |r| r.sequence + 1)),
            Err(Error::NotFoundRelease(_)) => Ok(1),
            Err(e) => Err(e),
        }
    }

    /// Apply `desired` and record it as the next revision.
    pub async fn takeoff(
        &self,
        release: &ReleaseRef,
        desired: ResourceSet,
        source: SourceDescriptor,
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport> {
        let _guard = self.locks.acquire(release).await;
        let active = active_revision(self.store.as_ref(), release)?;
        let previous = active.as_ref().map(|r| &r.resources);
        let live = self.observe(release, previous).await?;
        let plan = Plan::compute(release, &desired, previous, &live);

        if plan.is_noop() && previous.is_some_and(|p| p.same_content(&desired)) {
            return Err(Error::Warning("resources are the same as previous revision: skipping takeoff".into()));
        }

        let sequence = self.next_sequence(release)?;
        debug!(release = %release, revision = sequence, steps = plan.steps.len(), "takeoff");
        let mut report = finish(execute(&self.cluster, &plan, sequence, self.opts, cancel).await)?;
        let recorded = self.store.append(release, &desired, &source, active.as_ref().map(|r| r.sequence))?;
        report.revision = recorded.sequence;
        report.revision_recorded = true;
        Ok(report)
    }

    /// Return the release to an earlier revision. History is kept.
    pub async fn descent(&self, release: &ReleaseRef, sequence: u64, cancel: &CancellationToken) -> Result<ReconcileReport> {
        let _guard = self.locks.acquire(release).await;
        let active = self.store.get_active(release)?;
        if active.sequence == sequence {
            return Err(Error::Warning(format!("revision {sequence} is already active: nothing to do")));
        }
        let target = self.store.get_by_sequence(release, sequence)?;
        let live = self.observe(release, Some(&active.resources)).await?;
        let plan = Plan::compute(release, &target.resources, Some(&active.resources), &live);

        debug!(release = %release, from = active.sequence, to = sequence, "descent");
        let mut report = finish(execute(&self.cluster, &plan, sequence, self.opts, cancel).await)?;
        self.store.reactivate(release, sequence, Some(active.sequence))?;
        report.revision_recorded = true;
        Ok(report)
    }

    /// Delete every live resource of the release, then its history.
    pub async fn mayday(&self, release: &ReleaseRef, cancel: &CancellationToken) -> Result<ReconcileReport> {
        let _guard = self.locks.acquire(release).await;
        let active = self.store.get_active(release)?;
        let live = self.observe(release, Some(&active.resources)).await?;
        let plan = Plan::compute(release, &ResourceSet::new(), Some(&active.resources), &live);

        debug!(release = %release, prunes = plan.steps.len(), "mayday");
        let report = finish(execute(&self.cluster, &plan, active.sequence, self.opts, cancel).await)?;
        self.store.remove(release)?;
        Ok(report)
    }

    /// Re-apply the active revision over drifted live state. No revision is recorded.
    pub async fn fix(&self, release: &ReleaseRef, cancel: &CancellationToken) -> Result<ReconcileReport> {
        let _guard = self.locks.acquire(release).await;
        let active = self.store.get_active(release)?;
        let live = self.observe(release, Some(&active.resources)).await?;
        let plan = Plan::compute(release, &active.resources, None, &live);
        debug!(release = %release, revision = active.sequence, "fixing drift");
        finish(execute(&self.cluster, &plan, active.sequence, self.opts, cancel).await)
    }
}
