//! Readiness of the workloads an overlay installs.

use k8s_openapi::api::apps::v1::Deployment;
use keel_core::{ClientError, ClusterClient, Error, InstallationStatus, ResourceRef};
use keel_manifest::Manifest;
use tracing::{debug, info};

const WORKLOAD_KIND: &str = "Deployment";

fn is_available(deployment: &Deployment) -> bool {
    deployment
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| conds.iter().any(|c| c.type_ == "Available" && c.status == "True"))
        .unwrap_or(false)
}

/// Marks `status` available when every Deployment in `overlay` reports
/// `Available=True`.
///
/// The scan stops at the first Deployment that is missing or unavailable. A
/// missing Deployment is still converging and is not an error.
pub async fn check_deployments(
    cluster: &dyn ClusterClient,
    overlay: &Manifest,
    status: &mut InstallationStatus,
) -> Result<(), Error> {
    for obj in overlay.of_kind(WORKLOAD_KIND) {
        let r = ResourceRef::of(obj)?;
        let live = match cluster.get(&r).await {
            Ok(live) => live,
            Err(e) if e.is_not_found() => {
                debug!(resource = %r, "deployment not found yet");
                status.mark_deployments_not_ready();
                return Ok(());
            }
            Err(source) => {
                status.mark_deployments_not_ready();
                return Err(Error::Read { resource: r.to_string(), source });
            }
        };
        let deployment: Deployment = serde_json::to_value(&live)
            .and_then(serde_json::from_value)
            .map_err(|e| {
                status.mark_deployments_not_ready();
                Error::Read { resource: r.to_string(), source: ClientError::from(e) }
            })?;
        if !is_available(&deployment) {
            info!(resource = %r, "deployment not available");
            status.mark_deployments_not_ready();
            return Ok(());
        }
    }
    status.mark_deployments_available();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::status::DEPLOYMENTS_AVAILABLE;
    use keel_store::{deployment, MemoryCluster, Op};

    fn overlay(names: &[&str]) -> Manifest {
        Manifest::new(names.iter().map(|n| deployment("ns", n, false)).collect()).unwrap()
    }

    fn initialized() -> InstallationStatus {
        let mut s = InstallationStatus::default();
        s.initialize_conditions();
        s
    }

    fn gets(cluster: &MemoryCluster) -> Vec<String> {
        cluster.calls().into_iter().filter(|c| c.op == Op::Get).map(|c| c.resource.name).collect()
    }

    #[tokio::test]
    async fn all_available_marks_available() {
        let cluster = MemoryCluster::new();
        cluster.insert(deployment("ns", "a", true)).unwrap();
        cluster.insert(deployment("ns", "b", true)).unwrap();
        let mut status = initialized();
        check_deployments(&cluster, &overlay(&["a", "b"]), &mut status).await.unwrap();
        assert!(status.get_condition(DEPLOYMENTS_AVAILABLE).unwrap().is_true());
    }

    #[tokio::test]
    async fn not_found_is_tolerated() {
        let cluster = MemoryCluster::new();
        let mut status = initialized();
        check_deployments(&cluster, &overlay(&["missing"]), &mut status).await.unwrap();
        assert!(status.get_condition(DEPLOYMENTS_AVAILABLE).unwrap().is_false());
    }

    #[tokio::test]
    async fn stops_at_first_unavailable_deployment() {
        let cluster = MemoryCluster::new();
        cluster.insert(deployment("ns", "d1", true)).unwrap();
        cluster.insert(deployment("ns", "d2", false)).unwrap();
        cluster.insert(deployment("ns", "d3", true)).unwrap();
        let mut status = initialized();
        check_deployments(&cluster, &overlay(&["d1", "d2", "d3"]), &mut status).await.unwrap();
        assert!(status.get_condition(DEPLOYMENTS_AVAILABLE).unwrap().is_false());
        assert_eq!(gets(&cluster), vec!["d1", "d2"]);
    }

    #[tokio::test]
    async fn read_errors_propagate() {
        let cluster = MemoryCluster::new();
        cluster.fail(Op::Get, "d1", 500);
        let mut status = initialized();
        let err = check_deployments(&cluster, &overlay(&["d1"]), &mut status).await.unwrap_err();
        assert_eq!(err.kind(), "read");
        assert!(status.get_condition(DEPLOYMENTS_AVAILABLE).unwrap().is_false());
    }

    #[tokio::test]
    async fn overlay_without_workloads_is_available() {
        let cluster = MemoryCluster::new();
        let cm = Manifest::parse("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: c\n").unwrap();
        let mut status = initialized();
        check_deployments(&cluster, &cm, &mut status).await.unwrap();
        assert!(status.get_condition(DEPLOYMENTS_AVAILABLE).unwrap().is_true());
        assert!(cluster.calls().is_empty());
    }
}
