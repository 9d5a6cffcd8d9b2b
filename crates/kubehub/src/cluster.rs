//! `ClusterClient` over the kube API with discovery-backed resolution.

use async_trait::async_trait;
use keel_core::{ClientError, ClusterClient, ResourceRef};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Field manager for every server-side apply.
pub const FIELD_MANAGER: &str = "keel-operator";

/// Maps kube errors onto the client error kinds the reconciler branches on.
pub(crate) fn client_error(e: kube::Error, what: impl Into<String>) -> ClientError {
    match e {
        kube::Error::Api(resp) if resp.code == 404 => ClientError::NotFound(what.into()),
        kube::Error::Api(resp) if resp.code == 409 => ClientError::Conflict(what.into()),
        kube::Error::Api(resp) => ClientError::Api { code: resp.code, message: resp.message },
        kube::Error::SerdeError(e) => ClientError::Serialization(e),
        other => ClientError::Transport(other.to_string()),
    }
}

fn gvk_key(group: &str, version: &str, kind: &str) -> String {
    if group.is_empty() {
        format!("{}/{}", version, kind)
    } else {
        format!("{}/{}/{}", group, version, kind)
    }
}

#[derive(Clone)]
struct Served {
    resource: ApiResource,
    namespaced: bool,
}

/// Cluster access for arbitrary kinds. Served kinds are cached and the
/// cache is rebuilt when a kind is missing, so CRDs installed after start
/// resolve on first use.
pub struct KubeCluster {
    client: Client,
    served: RwLock<FxHashMap<String, Served>>,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client, served: RwLock::new(FxHashMap::default()) }
    }

    async fn refresh(&self) -> Result<(), ClientError> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| client_error(e, "discovery"))?;
        let mut served = FxHashMap::default();
        for group in discovery.groups() {
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    let key = gvk_key(&ar.group, &ar.version, &ar.kind);
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    served.insert(key, Served { resource: ar, namespaced });
                }
            }
        }
        info!(kinds = served.len(), "discovery refreshed");
        *self.served.write().await = served;
        Ok(())
    }

    async fn resolve(&self, r: &ResourceRef) -> Result<Served, ClientError> {
        let (group, version) = r.group_version();
        let key = gvk_key(group, version, &r.kind);
        if let Some(hit) = self.served.read().await.get(&key) {
            return Ok(hit.clone());
        }
        debug!(gvk = %key, "kind not cached; running discovery");
        self.refresh().await?;
        self.served
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or(ClientError::UnknownKind(key))
    }

    async fn api_for(&self, r: &ResourceRef) -> Result<Api<DynamicObject>, ClientError> {
        let served = self.resolve(r).await?;
        let api = match (&r.namespace, served.namespaced) {
            (Some(ns), true) => Api::namespaced_with(self.client.clone(), ns, &served.resource),
            (None, true) => Api::default_namespaced_with(self.client.clone(), &served.resource),
            (_, false) => Api::all_with(self.client.clone(), &served.resource),
        };
        Ok(api)
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get(&self, resource: &ResourceRef) -> Result<DynamicObject, ClientError> {
        let api = self.api_for(resource).await?;
        api.get(&resource.name).await.map_err(|e| client_error(e, resource.to_string()))
    }

    async fn apply(&self, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        let r = ResourceRef::of(obj).map_err(|e| ClientError::Api { code: 422, message: e.to_string() })?;
        let api = self.api_for(&r).await?;
        let mut body = obj.clone();
        body.metadata.managed_fields = None;
        body.metadata.resource_version = None;
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        let live = api
            .patch(&r.name, &pp, &Patch::Apply(&body))
            .await
            .map_err(|e| client_error(e, r.to_string()))?;
        counter!("kube_apply_total", 1u64);
        Ok(live)
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<(), ClientError> {
        let api = match self.api_for(resource).await {
            Ok(api) => api,
            // a kind the cluster no longer serves has nothing left to delete
            Err(ClientError::UnknownKind(k)) => return Err(ClientError::NotFound(k)),
            Err(e) => return Err(e),
        };
        api.delete(&resource.name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| client_error(e, resource.to_string()))
    }
}
