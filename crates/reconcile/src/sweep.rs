//! Removal of resources earlier releases installed and this one does not.

use keel_core::{ClusterClient, Error, ResourceRef};
use tracing::debug;

const LEGACY_NAMESPACE: &str = "istio-system";
const LEGACY_GATEWAY: &str = "knative-ingressgateway";

/// Obsolete resources in deletion order. The legacy controller ConfigMap
/// lives in the record's namespace.
pub fn obsolete_resources(namespace: &str) -> [ResourceRef; 4] {
    [
        ResourceRef::new("v1", "Service", Some(LEGACY_NAMESPACE), LEGACY_GATEWAY),
        ResourceRef::new("apps/v1", "Deployment", Some(LEGACY_NAMESPACE), LEGACY_GATEWAY),
        ResourceRef::new("autoscaling/v1", "HorizontalPodAutoscaler", Some(LEGACY_NAMESPACE), LEGACY_GATEWAY),
        ResourceRef::new("v1", "ConfigMap", Some(namespace), "config-controller"),
    ]
}

/// Deletes every obsolete resource; absent ones are skipped, the first
/// failed deletion aborts the sweep.
pub async fn delete_obsolete(cluster: &dyn ClusterClient, namespace: &str) -> Result<(), Error> {
    for r in obsolete_resources(namespace).iter() {
        keel_manifest::delete(cluster, r).await?;
    }
    debug!(namespace, "obsolete resources swept");
    Ok(())
}
