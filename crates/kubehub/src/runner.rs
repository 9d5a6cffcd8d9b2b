//! Work queue: `kube::runtime::Controller` feeding keys to the reconciler.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use keel_core::{Error, Installation, ObjectKey};
use keel_reconcile::Reconciler;
use kube::{
    api::Api,
    runtime::{controller::Action, watcher, Controller},
    Client,
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Watch a single namespace; all namespaces when `None`.
    pub namespace: Option<String>,
    /// Requeue delay after a successful pass.
    pub resync: Duration,
    /// Requeue delay after a failed pass.
    pub error_requeue: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self { namespace: None, resync: Duration::from_secs(300), error_requeue: Duration::from_secs(15) }
    }
}

struct Context {
    reconciler: Arc<Reconciler>,
    config: RunnerConfig,
}

async fn reconcile(record: Arc<Installation>, ctx: Arc<Context>) -> Result<Action, Error> {
    let key = ObjectKey::from_resource(record.as_ref()).to_string();
    ctx.reconciler.reconcile(&key).await?;
    Ok(Action::requeue(ctx.config.resync))
}

fn error_policy(record: Arc<Installation>, err: &Error, ctx: Arc<Context>) -> Action {
    let key = ObjectKey::from_resource(record.as_ref());
    warn!(record = %key, error = %err, kind = err.kind(), "requeueing after failure");
    Action::requeue(ctx.config.error_requeue)
}

fn scoped<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as kube::Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Runs until SIGINT/SIGTERM. Installations and the Deployments they own
/// both trigger passes.
pub async fn run_controller(client: Client, reconciler: Arc<Reconciler>, config: RunnerConfig) {
    let records: Api<Installation> = scoped(&client, config.namespace.as_deref());
    let deployments: Api<Deployment> = scoped(&client, config.namespace.as_deref());
    info!(
        namespace = ?config.namespace,
        version = %reconciler.version(),
        resync_secs = config.resync.as_secs(),
        "controller starting"
    );
    let ctx = Arc::new(Context { reconciler, config });
    Controller::new(records, watcher::Config::default())
        .owns(deployments, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(record = %obj, "reconciled"),
                Err(e) => warn!(error = %e, "controller error"),
            }
        })
        .await;
    info!("controller stopped");
}
