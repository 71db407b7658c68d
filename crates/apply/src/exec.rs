//! Plan execution with bounded parallelism.
//!
//! Creates and updates run in apply-rank waves, prunes afterwards in reverse
//! rank order. Within a wave up to `max_parallel` calls are in flight. Once
//! `fail_fast` failures are seen nothing new is dispatched, but calls already
//! running finish so the report is exact.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::{stream, StreamExt};
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use yoke_core::normalize::apply_rank;
use yoke_core::{OperationKind, ReconcileReport, ReleaseRef, ResourceDocument, ResourceIdentifier, ResourceOutcome, Settings};
use yoke_kubehub::{Cluster, ClusterError};

use crate::plan::{Action, Plan};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecOptions {
    pub max_parallel: usize,
    /// Failures after which dispatch stops.
    pub fail_fast: usize,
}

impl Default for ExecOptions {
    fn default() -> Self { Self::from(&Settings::default()) }
}

impl From<&Settings> for ExecOptions {
    fn from(s: &Settings) -> Self {
        Self { max_parallel: s.max_parallel.max(1), fail_fast: s.fail_fast.max(1) }
    }
}

struct Op {
    index: usize,
    id: ResourceIdentifier,
    kind: OperationKind,
    /// Stamped payload for create/update.
    doc: Option<ResourceDocument>,
}

struct Dispatch<'a> {
    cluster: &'a dyn Cluster,
    release: &'a ReleaseRef,
    revision: u64,
    opts: ExecOptions,
    failures: AtomicUsize,
    cancel: &'a CancellationToken,
}

impl Dispatch<'_> {
    fn halted(&self) -> bool {
        self.cancel.is_cancelled() || self.failures.load(Ordering::SeqCst) >= self.opts.fail_fast
    }

    async fn wave(&self, ops: Vec<Op>, outcomes: &mut [Option<ResourceOutcome>]) {
        let done: Vec<(usize, ResourceOutcome)> =
            stream::iter(ops).map(|op| self.run(op)).buffer_unordered(self.opts.max_parallel).collect().await;
        for (i, outcome) in done {
            outcomes[i] = Some(outcome);
        }
    }

    async fn run(&self, op: Op) -> (usize, ResourceOutcome) {
        if self.halted() {
            return (op.index, ResourceOutcome::Skipped { op: op.kind });
        }
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => ResourceOutcome::Cancelled { op: op.kind },
            o = self.call(&op) => o,
        };
        if outcome.is_failure() {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
        let label = match &outcome {
            ResourceOutcome::Failed { .. } => "failed",
            ResourceOutcome::Cancelled { .. } => "cancelled",
            _ => "ok",
        };
        counter!("reconcile_ops_total", 1u64, "op" => op.kind.to_string(), "outcome" => label);
        debug!(release = %self.release, revision = self.revision, resource = %op.id, op = %op.kind, outcome = %outcome, "reconcile op");
        (op.index, outcome)
    }

    async fn call(&self, op: &Op) -> ResourceOutcome {
        let failed = |e: ClusterError| ResourceOutcome::Failed { op: op.kind, message: e.to_string() };
        match (op.kind, &op.doc) {
            (OperationKind::Create, Some(doc)) => match self.cluster.create(doc).await {
                Ok(_) => ResourceOutcome::Created,
                // Exists without our labels: take it over.
                Err(ClusterError::AlreadyExists(_)) => match self.cluster.update(doc).await {
                    Ok(_) => ResourceOutcome::Updated,
                    Err(e) => failed(e),
                },
                Err(e) => failed(e),
            },
            (OperationKind::Update, Some(doc)) => match self.cluster.update(doc).await {
                Ok(_) => ResourceOutcome::Updated,
                Err(ClusterError::NotFound(_)) => match self.cluster.create(doc).await {
                    Ok(_) => ResourceOutcome::Created,
                    Err(e) => failed(e),
                },
                Err(e) => failed(e),
            },
            (OperationKind::Prune, _) => match self.cluster.delete(&op.id).await {
                Ok(()) | Err(ClusterError::NotFound(_)) => ResourceOutcome::Pruned,
                Err(e) => failed(e),
            },
            (kind, None) => ResourceOutcome::Failed { op: kind, message: "no payload to apply".into() },
        }
    }
}

fn by_rank(ops: Vec<Op>, descending: bool) -> Vec<Vec<Op>> {
    let mut waves: BTreeMap<u8, Vec<Op>> = BTreeMap::new();
    for op in ops {
        waves.entry(apply_rank(op.id.kind())).or_default().push(op);
    }
    let mut waves: Vec<Vec<Op>> = waves.into_values().collect();
    if descending {
        waves.reverse();
    }
    waves
}

/// Carry out `plan`, stamping touched resources with `revision`.
pub async fn execute(
    cluster: &Arc<dyn Cluster>,
    plan: &Plan,
    revision: u64,
    opts: ExecOptions,
    cancel: &CancellationToken,
) -> ReconcileReport {
    let t0 = Instant::now();
    let release = &plan.release;
    let mut outcomes: Vec<Option<ResourceOutcome>> = vec![None; plan.steps.len()];
    let mut applies = Vec::new();
    let mut prunes = Vec::new();
    for (index, step) in plan.steps.iter().enumerate() {
        let Some(kind) = step.action.operation() else {
            outcomes[index] = Some(ResourceOutcome::Unchanged);
            continue;
        };
        let doc = plan.desired.get(&step.id).map(|d| d.stamped(release, revision));
        let op = Op { index, id: step.id.clone(), kind, doc };
        if matches!(step.action, Action::Prune) { prunes.push(op) } else { applies.push(op) }
    }

    let dispatch = Dispatch { cluster: cluster.as_ref(), release, revision, opts, failures: AtomicUsize::new(0), cancel };
    for wave in by_rank(applies, false) {
        dispatch.wave(wave, &mut outcomes).await;
    }
    // Prune only once everything desired is in place.
    if dispatch.failures.load(Ordering::SeqCst) == 0 && !cancel.is_cancelled() {
        for wave in by_rank(prunes, true) {
            dispatch.wave(wave, &mut outcomes).await;
        }
    } else {
        for op in prunes {
            outcomes[op.index] = Some(ResourceOutcome::Skipped { op: op.kind });
        }
    }

    let mut report = ReconcileReport::new(release.clone(), revision);
    for (step, outcome) in plan.steps.iter().zip(outcomes) {
        let outcome = outcome.unwrap_or(ResourceOutcome::Skipped { op: step.action.operation().unwrap_or(OperationKind::Update) });
        report.push(step.id.clone(), outcome);
    }
    histogram!("reconcile_ms", t0.elapsed().as_secs_f64() * 1000.0);
    debug!(
        release = %release, revision, created = report.created().len(), updated = report.updated().len(),
        pruned = report.pruned().len(), failed = report.failed().count(), "reconcile finished"
    );
    report
}
