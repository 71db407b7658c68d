#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value as Json};
use tokio_util::sync::CancellationToken;
use yoke_apply::{DriftState, ExecOptions, Pilot, RevisionChange};
use yoke_core::normalize::normalize;
use yoke_core::{ActivationKind, Error, ReleaseRef, ResourceIdentifier, ResourceOutcome, ResourceSet, SourceDescriptor};
use yoke_kubehub::{Cluster, ClusterOp, MemoryCluster};
use yoke_persist::{RevisionStore, SqliteStore};

fn release() -> ReleaseRef { ReleaseRef::new("app", "ns-a") }

fn namespace(name: &str) -> Json { json!({"apiVersion": "v1", "kind": "Namespace", "metadata": {"name": name}}) }

fn cm(name: &str, value: &str) -> Json {
    json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name, "namespace": "ns-a"}, "data": {"k": value}})
}

fn cm_id(name: &str) -> ResourceIdentifier { ResourceIdentifier::new(name, "ns-a", "ConfigMap", "v1") }

fn set(docs: Vec<Json>) -> ResourceSet { normalize(docs, "ns-a").unwrap() }

fn names(ids: Vec<&ResourceIdentifier>) -> Vec<String> { ids.into_iter().map(|i| i.name().to_string()).collect() }

struct Harness {
    cluster: Arc<MemoryCluster>,
    store: Arc<SqliteStore>,
    pilot: Pilot,
}

fn harness_with(cluster: MemoryCluster, opts: ExecOptions) -> Harness {
    let cluster = Arc::new(cluster);
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let pilot = Pilot::new(cluster.clone() as Arc<dyn Cluster>, store.clone() as Arc<dyn RevisionStore>, opts);
    Harness { cluster, store, pilot }
}

fn harness() -> Harness { harness_with(MemoryCluster::new(), ExecOptions::default()) }

impl Harness {
    async fn takeoff(&self, docs: Vec<Json>) -> yoke_core::Result<yoke_core::ReconcileReport> {
        self.pilot.takeoff(&release(), set(docs), SourceDescriptor::flight("app.wasm"), &CancellationToken::new()).await
    }
}

#[tokio::test]
async fn namespace_and_configmap_scenario() {
    let h = harness();

    let first = h.takeoff(vec![namespace("ns-a"), cm("cfg", "1")]).await.unwrap();
    assert_eq!(names(first.created()), vec!["ns-a", "cfg"]);
    assert!(first.updated().is_empty() && first.pruned().is_empty());
    assert_eq!(first.revision, 1);

    let second = h.takeoff(vec![namespace("ns-a"), cm("cfg", "2")]).await.unwrap();
    assert_eq!(names(second.updated()), vec!["cfg"]);
    assert_eq!(names(second.unchanged()), vec!["ns-a"]);
    assert!(second.created().is_empty() && second.pruned().is_empty());
    assert_eq!(h.cluster.object(&cm_id("cfg")).unwrap()["data"]["k"], "2");

    let third = h.takeoff(vec![namespace("ns-a")]).await.unwrap();
    assert_eq!(names(third.pruned()), vec!["cfg"]);
    assert_eq!(names(third.unchanged()), vec!["ns-a"]);
    assert!(h.cluster.object(&cm_id("cfg")).is_none());
    assert!(h.cluster.object(&ResourceIdentifier::new("ns-a", "", "Namespace", "v1")).is_some());
    assert_eq!(h.store.get_active(&release()).unwrap().sequence, 3);
}

#[tokio::test]
async fn second_identical_takeoff_is_a_warning_without_mutation() {
    let h = harness();
    h.takeoff(vec![namespace("ns-a"), cm("cfg", "1")]).await.unwrap();
    let mutations = h.cluster.mutation_count();

    let plan = h.pilot.plan(&release(), &set(vec![namespace("ns-a"), cm("cfg", "1")])).await.unwrap();
    assert!(plan.is_noop());

    let err = h.takeoff(vec![namespace("ns-a"), cm("cfg", "1")]).await.unwrap_err();
    assert!(err.is_warning(), "err={err}");
    assert_eq!(h.cluster.mutation_count(), mutations);
    assert_eq!(h.store.history(&release()).unwrap().revisions.len(), 1);
}

#[tokio::test]
async fn plan_groups_complement_each_other() {
    let h = harness();
    h.takeoff(vec![cm("a", "1"), cm("b", "1"), cm("c", "1")]).await.unwrap();
    let desired = set(vec![cm("b", "1"), cm("c", "2"), cm("d", "1")]);
    let plan = h.pilot.plan(&release(), &desired).await.unwrap();

    assert_eq!(names(plan.creates()), vec!["d"]);
    assert_eq!(names(plan.updates()), vec!["c"]);
    assert_eq!(names(plan.unchanged()), vec!["b"]);
    assert_eq!(names(plan.prunes()), vec!["a"]);
    assert_eq!(plan.creates().len() + plan.updates().len() + plan.unchanged().len(), desired.len());
    // Planning is read-only.
    assert!(h.cluster.object(&cm_id("a")).is_some());
    assert!(h.cluster.object(&cm_id("d")).is_none());
}

#[tokio::test]
async fn rollback_round_trip() {
    let h = harness();
    h.takeoff(vec![cm("cfg", "a"), cm("only-a", "x")]).await.unwrap();
    h.takeoff(vec![cm("cfg", "b"), cm("only-b", "y")]).await.unwrap();

    let back = h.pilot.descent(&release(), 1, &CancellationToken::new()).await.unwrap();
    assert_eq!(names(back.created()), vec!["only-a"]);
    assert_eq!(names(back.updated()), vec!["cfg"]);
    assert_eq!(names(back.pruned()), vec!["only-b"]);

    let drift = h.pilot.turbulence(&release()).await.unwrap();
    assert!(drift.no_drift, "{drift:?}");
    assert_eq!(drift.revision, 1);

    let history = h.store.history(&release()).unwrap();
    assert_eq!(history.revisions.iter().map(|r| r.sequence).collect::<Vec<_>>(), vec![1, 2]);
    let log: Vec<_> = history.activations.iter().map(|a| (a.sequence, a.kind)).collect();
    assert_eq!(log, vec![(1, ActivationKind::Append), (2, ActivationKind::Append), (1, ActivationKind::Reactivate)]);

    let again = h.pilot.descent(&release(), 1, &CancellationToken::new()).await.unwrap_err();
    assert!(again.is_warning(), "err={again}");
    let missing = h.pilot.descent(&release(), 7, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(missing, Error::NotFoundRevision { sequence: 7, .. }), "err={missing}");

    // A takeoff after a rollback takes the next free sequence.
    let next = h.takeoff(vec![cm("cfg", "c")]).await.unwrap();
    assert_eq!(next.revision, 3);
}

#[tokio::test]
async fn mayday_removes_everything() {
    let h = harness();
    h.takeoff(vec![namespace("ns-a"), cm("cfg", "1"), cm("other", "1")]).await.unwrap();
    // Someone else's object in the same namespace stays.
    h.cluster.insert(cm("bystander", "1"));

    let report = h.pilot.mayday(&release(), &CancellationToken::new()).await.unwrap();
    assert_eq!(report.pruned().len(), 3);
    // ConfigMaps go before their namespace.
    assert_eq!(report.results.last().map(|r| r.id.kind()), Some("Namespace"));
    assert!(h.cluster.list_owned(&release()).await.unwrap().is_empty());
    assert!(h.cluster.object(&cm_id("bystander")).is_some());

    assert!(matches!(h.pilot.blackbox(&release(), None), Err(Error::NotFoundRelease(_))));
    assert!(matches!(h.pilot.turbulence(&release()).await, Err(Error::NotFoundRelease(_))));
    assert!(matches!(h.pilot.mayday(&release(), &CancellationToken::new()).await, Err(Error::NotFoundRelease(_))));
}

#[tokio::test]
async fn failed_mayday_keeps_history() {
    let h = harness();
    h.takeoff(vec![cm("cfg", "1")]).await.unwrap();
    h.cluster.fail(&cm_id("cfg"), ClusterOp::Delete, "etcd unavailable");
    let err = h.pilot.mayday(&release(), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::ReconcileFailure(_)), "err={err}");
    assert!(h.pilot.blackbox(&release(), None).is_ok());
}

#[tokio::test]
async fn partial_failure_keeps_previous_revision_and_skips_prune() {
    let h = harness();
    h.takeoff(vec![cm("x", "1"), cm("y", "1")]).await.unwrap();
    h.cluster.fail(&cm_id("z"), ClusterOp::Create, "admission webhook denied");

    let err = h.takeoff(vec![cm("x", "2"), cm("z", "1")]).await.unwrap_err();
    let Error::ReconcileFailure(report) = err else { panic!("expected reconcile failure") };
    assert!(matches!(report.outcome_of(&cm_id("z")), Some(ResourceOutcome::Failed { message, .. }) if message.contains("webhook")));
    assert!(matches!(report.outcome_of(&cm_id("y")), Some(ResourceOutcome::Skipped { .. })));
    assert!(!report.revision_recorded);
    assert!(report.failed().count() >= 2);

    assert_eq!(h.store.get_active(&release()).unwrap().sequence, 1);
    assert!(h.cluster.object(&cm_id("y")).is_some());
    assert!(h.cluster.object(&cm_id("z")).is_none());
    assert_eq!(h.store.history(&release()).unwrap().revisions.len(), 1);
}

#[tokio::test]
async fn operations_run_with_bounded_parallelism() {
    let h = harness_with(MemoryCluster::with_latency(Duration::from_millis(20)), ExecOptions { max_parallel: 3, fail_fast: 1 });
    let docs: Vec<Json> = (0..12).map(|i| cm(&format!("cm-{i}"), "1")).collect();
    let report = h.takeoff(docs).await.unwrap();
    assert_eq!(report.created().len(), 12);
    let peak = h.cluster.max_in_flight();
    assert!(peak <= 3, "peak={peak}");
    assert!(peak >= 2, "peak={peak}");
}

#[tokio::test]
async fn fail_fast_stops_dispatch() {
    let h = harness_with(MemoryCluster::new(), ExecOptions { max_parallel: 1, fail_fast: 1 });
    h.cluster.fail(&cm_id("a"), ClusterOp::Create, "boom");
    let err = h.takeoff(vec![cm("a", "1"), cm("b", "1"), cm("c", "1")]).await.unwrap_err();
    let Error::ReconcileFailure(report) = err else { panic!("expected reconcile failure") };
    assert!(matches!(report.outcome_of(&cm_id("a")), Some(ResourceOutcome::Failed { .. })));
    assert!(matches!(report.outcome_of(&cm_id("b")), Some(ResourceOutcome::Skipped { .. })));
    assert!(matches!(report.outcome_of(&cm_id("c")), Some(ResourceOutcome::Skipped { .. })));
    assert!(h.cluster.object(&cm_id("b")).is_none());
    assert!(matches!(h.store.get_active(&release()), Err(Error::NotFoundRelease(_))));
}

#[tokio::test]
async fn cancelled_takeoff_records_nothing() {
    let h = harness();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = h.pilot.takeoff(&release(), set(vec![cm("a", "1")]), SourceDescriptor::flight("f"), &cancel).await.unwrap_err();
    let Error::ReconcileFailure(report) = err else { panic!("expected reconcile failure") };
    assert!(matches!(report.outcome_of(&cm_id("a")), Some(ResourceOutcome::Skipped { .. })));
    assert_eq!(h.cluster.mutation_count(), 0);
    assert!(matches!(h.store.get_active(&release()), Err(Error::NotFoundRelease(_))));
}

#[tokio::test]
async fn turbulence_reports_each_kind_of_drift_and_fix_repairs_it() {
    let h = harness();
    h.takeoff(vec![cm("edited", "1"), cm("deleted", "1"), cm("kept", "1")]).await.unwrap();
    assert!(h.pilot.turbulence(&release()).await.unwrap().no_drift);

    let mut edited = h.cluster.object(&cm_id("edited")).unwrap();
    edited["data"]["k"] = json!("tampered");
    h.cluster.insert(edited);
    h.cluster.remove(&cm_id("deleted"));
    let mut extra = cm("extra", "1");
    extra["metadata"]["labels"] =
        json!({"app.kubernetes.io/managed-by": "yoke", "yoke.cd/release": "app", "yoke.cd/release-namespace": "ns-a"});
    h.cluster.insert(extra);
    let mutations = h.cluster.mutation_count();

    let drift = h.pilot.turbulence(&release()).await.unwrap();
    assert!(!drift.no_drift);
    let state = |name: &str| drift.entries.iter().find(|e| e.id.name() == name).map(|e| e.state.clone());
    match state("edited") {
        Some(DriftState::Modified { changes }) => {
            assert_eq!(changes.len(), 1);
            assert_eq!(changes[0].path, "/data/k");
            assert_eq!(changes[0].desired, Some(json!("1")));
            assert_eq!(changes[0].live, Some(json!("tampered")));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(state("deleted"), Some(DriftState::Missing));
    assert_eq!(state("extra"), Some(DriftState::UnmanagedExtra));
    assert_eq!(state("kept"), Some(DriftState::Unchanged));
    assert_eq!(drift.drifted().count(), 3);
    assert_eq!(h.cluster.mutation_count(), mutations);

    let fixed = h.pilot.fix(&release(), &CancellationToken::new()).await.unwrap();
    assert_eq!(names(fixed.created()), vec!["deleted"]);
    assert_eq!(names(fixed.updated()), vec!["edited"]);
    assert_eq!(names(fixed.pruned()), vec!["extra"]);
    assert!(h.pilot.turbulence(&release()).await.unwrap().no_drift);
    assert_eq!(h.store.history(&release()).unwrap().revisions.len(), 1);
}

#[tokio::test]
async fn blackbox_shows_history_and_compares_revisions() {
    let h = harness();
    h.takeoff(vec![cm("cfg", "1"), cm("gone", "1")]).await.unwrap();
    h.takeoff(vec![cm("cfg", "2"), cm("new", "1")]).await.unwrap();

    let inspection = h.pilot.blackbox(&release(), None).unwrap();
    assert_eq!(inspection.revision.sequence, 2);
    assert_eq!(inspection.history.revisions.len(), 2);
    let first = h.pilot.blackbox(&release(), Some(1)).unwrap();
    assert!(first.revision.resources.contains(&cm_id("gone")));
    assert!(matches!(h.pilot.blackbox(&release(), Some(5)), Err(Error::NotFoundRevision { .. })));

    let diff = h.pilot.compare(&release(), 1, 2).unwrap();
    let change = |name: &str| diff.entries.iter().find(|e| e.id.name() == name).map(|e| e.change.clone());
    assert!(matches!(change("cfg"), Some(RevisionChange::Changed { changes }) if changes[0].path == "/data/k"));
    assert_eq!(change("new"), Some(RevisionChange::Added));
    assert_eq!(change("gone"), Some(RevisionChange::Removed));
}

#[tokio::test]
async fn concurrent_takeoffs_on_one_release_serialize() {
    let h = harness_with(MemoryCluster::with_latency(Duration::from_millis(10)), ExecOptions::default());
    let a = h.takeoff(vec![cm("a", "1")]);
    let b = h.takeoff(vec![cm("b", "1")]);
    let (ra, rb) = tokio::join!(a, b);
    let mut seqs = vec![ra.unwrap().revision, rb.unwrap().revision];
    seqs.sort();
    assert_eq!(seqs, vec![1, 2]);
    let history = h.store.history(&release()).unwrap();
    assert_eq!(history.revisions.len(), 2);
    assert_eq!(history.revisions.iter().filter(|r| r.active).count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn flight_render_feeds_takeoff() {
    use yoke_flight::{FlightProducer, FlightRuntime, Producer};

    let out = r#"[{"apiVersion":"v1","kind":"Namespace","metadata":{"name":"ns-a"}},{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"cfg"},"data":{"k":"1"}}]"#;
    let wat = format!(
        r#"(module
  (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (data (i32.const 64) "{}")
  (func (export "_start")
    (i32.store (i32.const 0) (i32.const 64))
    (i32.store (i32.const 4) (i32.const {}))
    (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8)))))"#,
        out.replace('"', "\\\""),
        out.len()
    );
    let h = harness();
    let producer = FlightProducer::from_bytes("demo.wat", wat.into_bytes(), FlightRuntime::default(), h.cluster.clone() as Arc<dyn Cluster>);
    let rendered = producer.render(&release(), &Json::Null, &CancellationToken::new()).await.unwrap();
    let report = h.pilot.takeoff(&release(), rendered.resources, rendered.source, &CancellationToken::new()).await.unwrap();
    assert_eq!(names(report.created()), vec!["ns-a", "cfg"]);
    assert_eq!(h.pilot.blackbox(&release(), None).unwrap().revision.source.reference, "demo.wat");
}

fn pod(container: Json) -> Json {
    json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "web", "namespace": "ns-a"}, "spec": {"containers": [container]}})
}

#[tokio::test]
async fn field_removed_inside_a_list_element_is_applied() {
    let h = harness();
    let pod_id = ResourceIdentifier::new("web", "ns-a", "Pod", "v1");
    h.takeoff(vec![pod(json!({"name": "app", "image": "x", "resources": {"limits": {"cpu": "1"}}}))]).await.unwrap();

    let second = h.takeoff(vec![pod(json!({"name": "app", "image": "x"}))]).await.unwrap();
    assert_eq!(second.outcome_of(&pod_id), Some(&ResourceOutcome::Updated));
    let live = h.cluster.object(&pod_id).unwrap();
    assert_eq!(live["spec"]["containers"], json!([{"name": "app", "image": "x"}]));

    assert!(h.pilot.turbulence(&release()).await.unwrap().no_drift);
    let diff = h.pilot.compare(&release(), 1, 2).unwrap();
    match &diff.entries[0].change {
        RevisionChange::Changed { changes } => assert_eq!(changes[0].path, "/spec/containers/0/resources"),
        other => panic!("unexpected {other:?}"),
    }
}
