use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use keel_core::status::{DEPLOYMENTS_AVAILABLE, INSTALL_SUCCEEDED, READY};
use keel_core::{Error, Installation, InstallationSpec, Phase, ResourceRef};
use keel_manifest::{FileTemplate, Manifest, StaticTemplate, TemplateSource};
use keel_reconcile::{Extension, Platforms, Reconciler};
use keel_store::{deployment, MemoryCluster, MemoryRecordStore, Op, RecordingEvents};

const NS: &str = "knative-serving";
const KEY: &str = "knative-serving/ks";
const VERSION: &str = "0.4.0";

struct Harness {
    records: Arc<MemoryRecordStore>,
    cluster: Arc<MemoryCluster>,
    events: Arc<RecordingEvents>,
    reconciler: Reconciler,
}

fn template(names: &[&str]) -> Manifest {
    let mut resources: Vec<_> = names.iter().map(|n| deployment(NS, n, false)).collect();
    // manifests carry no status
    for r in resources.iter_mut() {
        if let Some(body) = r.data.as_object_mut() {
            body.remove("status");
        }
    }
    Manifest::new(resources).unwrap()
}

fn record() -> Installation {
    let mut r = Installation::new("ks", InstallationSpec::default());
    r.metadata.namespace = Some(NS.into());
    r
}

fn harness(names: &[&str], platforms: Platforms) -> Harness {
    let records = Arc::new(MemoryRecordStore::new());
    let cluster = Arc::new(MemoryCluster::new());
    let events = Arc::new(RecordingEvents::new());
    records.insert(record());
    let reconciler = Reconciler::new(
        records.clone(),
        cluster.clone(),
        Arc::new(StaticTemplate::new(template(names))),
        VERSION,
    )
    .with_events(events.clone())
    .with_platforms(platforms);
    Harness { records, cluster, events, reconciler }
}

fn status(h: &Harness) -> keel_core::InstallationStatus {
    h.records.current(NS, "ks").unwrap().status_or_default()
}

/// Marks the named deployments available the way the deployment controller would.
fn make_available(h: &Harness, names: &[&str]) {
    for n in names {
        h.cluster.insert(deployment(NS, n, true)).unwrap();
    }
}

#[tokio::test]
async fn first_pass_installs_and_reports_not_ready() {
    let h = harness(&["d1"], Platforms::new());
    h.reconciler.reconcile(KEY).await.unwrap();

    let s = status(&h);
    assert!(s.get_condition(INSTALL_SUCCEEDED).unwrap().is_true());
    assert!(s.get_condition(DEPLOYMENTS_AVAILABLE).unwrap().is_false());
    assert!(s.get_condition(READY).unwrap().is_false());
    assert_eq!(s.phase(), Phase::DeploymentsNotReady);
    assert_eq!(s.version.as_deref(), Some(VERSION));
    assert_eq!(s.observed_generation, Some(1));

    // post-init, post-install, post-check
    assert_eq!(h.records.status_writes().len(), 3);
    assert_eq!(h.cluster.count(Op::Apply), 1);
    assert_eq!(h.cluster.count(Op::Delete), 4);
    assert_eq!(h.events.reasons(), vec!["InstallSucceeded"]);

    let d1 = h.cluster.object(&ResourceRef::new("apps/v1", "Deployment", Some(NS), "d1")).unwrap();
    let owners = d1.metadata.owner_references.unwrap();
    assert_eq!(owners[0].name, "ks");
}

#[tokio::test]
async fn converged_record_is_left_alone() {
    let h = harness(&["d1", "d2"], Platforms::new());
    h.reconciler.reconcile(KEY).await.unwrap();
    make_available(&h, &["d1", "d2"]);
    h.reconciler.reconcile(KEY).await.unwrap();
    assert!(status(&h).is_ready());

    let writes = h.records.status_writes().len();
    h.cluster.reset_calls();
    h.reconciler.reconcile(KEY).await.unwrap();
    h.reconciler.reconcile(KEY).await.unwrap();

    assert_eq!(h.records.status_writes().len(), writes);
    assert_eq!(h.cluster.count(Op::Apply), 0);
    assert!(h.records.upgrades().is_empty());
}

#[tokio::test]
async fn install_is_not_repeated_after_success() {
    let h = harness(&["d1"], Platforms::new());
    h.reconciler.reconcile(KEY).await.unwrap();
    h.cluster.fail(Op::Apply, "d1", 500);
    h.cluster.reset_calls();

    h.reconciler.reconcile(KEY).await.unwrap();
    assert_eq!(h.cluster.count(Op::Apply), 0);
    assert!(status(&h).get_condition(INSTALL_SUCCEEDED).unwrap().is_true());
}

#[tokio::test]
async fn deleted_deployment_marks_not_ready_without_error() {
    let h = harness(&["d1"], Platforms::new());
    h.reconciler.reconcile(KEY).await.unwrap();
    make_available(&h, &["d1"]);
    h.reconciler.reconcile(KEY).await.unwrap();
    assert!(status(&h).is_ready());

    let d1 = ResourceRef::new("apps/v1", "Deployment", Some(NS), "d1");
    keel_manifest::delete(h.cluster.as_ref(), &d1).await.unwrap();
    h.reconciler.reconcile(KEY).await.unwrap();

    let s = status(&h);
    assert!(s.get_condition(DEPLOYMENTS_AVAILABLE).unwrap().is_false());
    assert!(!s.is_ready());
}

#[tokio::test]
async fn availability_scan_stops_at_first_unavailable() {
    let h = harness(&["d1", "d2", "d3"], Platforms::new());
    h.reconciler.reconcile(KEY).await.unwrap();
    make_available(&h, &["d1", "d3"]);
    h.cluster.reset_calls();

    h.reconciler.reconcile(KEY).await.unwrap();
    let reads: Vec<_> = h
        .cluster
        .calls()
        .into_iter()
        .filter(|c| c.op == Op::Get)
        .map(|c| c.resource.name)
        .collect();
    assert_eq!(reads, vec!["d1", "d2"]);
}

#[tokio::test]
async fn spec_only_change_signals_upgrade_without_status_write() {
    let h = harness(&["d1"], Platforms::new());
    h.reconciler.reconcile(KEY).await.unwrap();
    make_available(&h, &["d1"]);
    h.reconciler.reconcile(KEY).await.unwrap();
    let writes = h.records.status_writes().len();

    let mut edited = h.records.current(NS, "ks").unwrap();
    edited.spec.config.insert(
        "config-logging".into(),
        BTreeMap::from([("loglevel.controller".to_string(), "debug".to_string())]),
    );
    h.records.insert(edited);

    h.reconciler.reconcile(KEY).await.unwrap();
    assert_eq!(h.records.status_writes().len(), writes);
    let upgrades = h.records.upgrades();
    assert_eq!(upgrades.len(), 1);
    assert!(upgrades[0].config.contains_key("logging"));
    assert!(!upgrades[0].config.contains_key("config-logging"));
}

#[tokio::test]
async fn new_generation_triggers_reinstall() {
    let h = harness(&["d1"], Platforms::new());
    h.reconciler.reconcile(KEY).await.unwrap();
    make_available(&h, &["d1"]);
    h.reconciler.reconcile(KEY).await.unwrap();

    let mut edited = h.records.current(NS, "ks").unwrap();
    edited.spec.registry = Some(keel_core::Registry {
        default: Some("mirror.local/${NAME}:v2".into()),
        ..Default::default()
    });
    edited.metadata.generation = Some(2);
    h.records.insert(edited);
    h.cluster.reset_calls();

    h.reconciler.reconcile(KEY).await.unwrap();
    assert_eq!(h.cluster.count(Op::Apply), 1);
    let s = status(&h);
    assert_eq!(s.observed_generation, Some(2));
    assert!(s.get_condition(INSTALL_SUCCEEDED).unwrap().is_true());
}

#[tokio::test]
async fn legacy_configmap_is_swept_when_gateway_is_gone() {
    let h = harness(&["d1"], Platforms::new());
    let legacy = ResourceRef::new("v1", "ConfigMap", Some(NS), "config-controller");
    h.cluster.insert(legacy.to_object()).unwrap();

    h.reconciler.reconcile(KEY).await.unwrap();
    assert!(!h.cluster.contains(&legacy));
}

#[tokio::test]
async fn failed_install_is_reported_and_retried() {
    let h = harness(&["d1"], Platforms::new());
    h.cluster.fail(Op::Apply, "d1", 500);

    let err = h.reconciler.reconcile(KEY).await.unwrap_err();
    assert!(matches!(err, Error::Apply { .. }), "err={err}");
    let s = status(&h);
    let install = s.get_condition(INSTALL_SUCCEEDED).unwrap();
    assert!(install.is_false());
    assert!(install.message.contains("d1"), "message={}", install.message);
    assert_eq!(s.phase(), Phase::InstallFailed);
    assert_eq!(h.events.reasons(), vec!["InternalError"]);
    assert_eq!(h.cluster.count(Op::Delete), 0);

    h.cluster.clear_failures();
    h.reconciler.reconcile(KEY).await.unwrap();
    assert!(status(&h).get_condition(INSTALL_SUCCEEDED).unwrap().is_true());
}

#[tokio::test]
async fn repeated_install_failure_writes_status_once() {
    let h = harness(&["d1"], Platforms::new());
    h.cluster.fail(Op::Apply, "d1", 500);

    h.reconciler.reconcile(KEY).await.unwrap_err();
    let writes = h.records.status_writes().len();
    let failed_at = status(&h).get_condition(INSTALL_SUCCEEDED).unwrap().last_transition_time;
    h.cluster.reset_calls();

    h.reconciler.reconcile(KEY).await.unwrap_err();
    h.reconciler.reconcile(KEY).await.unwrap_err();

    // retried each pass, but the status already says so
    assert_eq!(h.cluster.count(Op::Apply), 2);
    assert_eq!(h.records.status_writes().len(), writes);
    let s = status(&h);
    assert_eq!(s.phase(), Phase::InstallFailed);
    assert_eq!(s.get_condition(INSTALL_SUCCEEDED).unwrap().last_transition_time, failed_at);
}

#[tokio::test]
async fn failed_stage_with_failed_status_write_reports_update_failed() {
    let h = harness(&["d1"], Platforms::new());
    h.cluster.fail(Op::Apply, "d1", 500);
    h.reconciler.reconcile(KEY).await.unwrap_err();
    let stored = status(&h);

    // a different failure changes the install message; the write is refused
    h.cluster.fail(Op::Apply, "d1", 503);
    h.records.fail_status_writes(Some(500));
    let err = h.reconciler.reconcile(KEY).await.unwrap_err();

    assert!(matches!(err, Error::StatusPersist { .. }), "err={err}");
    assert_eq!(h.events.reasons(), vec!["InternalError", "UpdateFailed"]);
    assert_eq!(status(&h), stored);
}

fn write_manifest(path: &std::path::Path, names: &[&str]) {
    let yaml = template(names).to_yaml().unwrap();
    std::fs::write(path, yaml).unwrap();
}

#[tokio::test]
async fn reloaded_manifest_is_installed() {
    let path = std::env::temp_dir().join(format!("keel-reconcile-{}-reload.yaml", std::process::id()));
    write_manifest(&path, &["d1"]);
    let file = Arc::new(FileTemplate::load(&path).unwrap());

    let records = Arc::new(MemoryRecordStore::new());
    let cluster = Arc::new(MemoryCluster::new());
    records.insert(record());
    let reconciler = Reconciler::new(records.clone(), cluster.clone(), file.clone(), VERSION);

    reconciler.reconcile(KEY).await.unwrap();
    let first = records.current(NS, "ks").unwrap().status_or_default();
    assert_eq!(first.manifest_digest, Some(file.manifest().digest()));

    write_manifest(&path, &["d1", "d2"]);
    assert_eq!(file.reload().unwrap(), 2);
    reconciler.reconcile(KEY).await.unwrap();

    let d2 = ResourceRef::new("apps/v1", "Deployment", Some(NS), "d2");
    assert!(cluster.contains(&d2));
    let s = records.current(NS, "ks").unwrap().status_or_default();
    assert!(s.get_condition(INSTALL_SUCCEEDED).unwrap().is_true());
    assert_eq!(s.manifest_digest, Some(file.manifest().digest()));
    assert_ne!(s.manifest_digest, first.manifest_digest);

    // settled: no further installs
    cluster.reset_calls();
    reconciler.reconcile(KEY).await.unwrap();
    assert_eq!(cluster.count(Op::Apply), 0);
    let _ = std::fs::remove_file(&path);
}

#[tokio::test]
async fn status_write_failure_emits_update_failed() {
    let h = harness(&["d1"], Platforms::new());
    h.records.fail_status_writes(Some(500));

    let err = h.reconciler.reconcile(KEY).await.unwrap_err();
    assert!(matches!(err, Error::StatusPersist { .. }), "err={err}");
    assert!(h.events.reasons().contains(&"UpdateFailed".to_string()));
    assert!(h.records.current(NS, "ks").unwrap().status.is_none());
}

#[tokio::test]
async fn unknown_keys_and_missing_records_are_not_errors() {
    let h = harness(&["d1"], Platforms::new());
    h.reconciler.reconcile("a/b/c").await.unwrap();
    h.reconciler.reconcile("ks").await.unwrap();
    h.reconciler.reconcile("knative-serving/missing").await.unwrap();
    assert!(h.records.status_writes().is_empty());
    assert!(h.cluster.calls().is_empty());
}

#[derive(Default)]
struct Hooks {
    pre: AtomicUsize,
    post: AtomicUsize,
    fail_pre: bool,
}

struct HookPlatform(Arc<Hooks>);

#[async_trait]
impl Extension for HookPlatform {
    fn name(&self) -> &str {
        "hooks"
    }

    async fn pre_install(&self, _record: &Installation) -> Result<(), Error> {
        self.0.pre.fetch_add(1, Ordering::SeqCst);
        if self.0.fail_pre {
            return Err(Error::hook("pre-install", "cluster not prepared"));
        }
        Ok(())
    }

    async fn post_install(&self, _record: &Installation) -> Result<(), Error> {
        self.0.post.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn hooks_run_around_apply_once_per_install() {
    let hooks = Arc::new(Hooks::default());
    let h = harness(&["d1"], Platforms::new().with(HookPlatform(hooks.clone())));
    h.reconciler.reconcile(KEY).await.unwrap();
    h.reconciler.reconcile(KEY).await.unwrap();
    assert_eq!(hooks.pre.load(Ordering::SeqCst), 1);
    assert_eq!(hooks.post.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failing_pre_install_hook_fails_install_before_apply() {
    let hooks = Arc::new(Hooks { fail_pre: true, ..Default::default() });
    let h = harness(&["d1"], Platforms::new().with(HookPlatform(hooks.clone())));
    let err = h.reconciler.reconcile(KEY).await.unwrap_err();
    assert_eq!(err.kind(), "hook");
    assert_eq!(h.cluster.count(Op::Apply), 0);
    assert_eq!(hooks.post.load(Ordering::SeqCst), 0);
    assert_eq!(status(&h).phase(), Phase::InstallFailed);
}
