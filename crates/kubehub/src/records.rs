//! `RecordStore` over the `Installation` API.

use async_trait::async_trait;
use keel_core::{ClientError, Installation, ObjectKey, RecordStore};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::debug;

use crate::cluster::client_error;

pub struct KubeRecordStore {
    client: Client,
}

impl KubeRecordStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, record: &Installation) -> Api<Installation> {
        let ns = record.namespace().unwrap_or_default();
        Api::namespaced(self.client.clone(), &ns)
    }
}

#[async_trait]
impl RecordStore for KubeRecordStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Installation, ClientError> {
        let api: Api<Installation> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| client_error(e, ObjectKey::new(namespace, name).to_string()))
    }

    /// Merge patch of the status subresource. The patch carries the record's
    /// resourceVersion so the API server rejects it when the record moved on.
    async fn update_status(&self, record: &Installation) -> Result<Installation, ClientError> {
        let key = ObjectKey::from_resource(record);
        let patch = json!({
            "metadata": { "resourceVersion": record.metadata.resource_version },
            "status": record.status,
        });
        let updated = self
            .api(record)
            .patch_status(&record.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| client_error(e, key.to_string()))?;
        debug!(record = %key, resource_version = ?updated.metadata.resource_version, "status written");
        Ok(updated)
    }

    /// Replaces the record so the defaulted spec is stored; status is ignored
    /// by the main resource endpoint.
    async fn upgrade(&self, record: &Installation) -> Result<(), ClientError> {
        let key = ObjectKey::from_resource(record);
        self.api(record)
            .replace(&record.name_any(), &PostParams::default(), record)
            .await
            .map_err(|e| client_error(e, key.to_string()))?;
        debug!(record = %key, "defaulted spec stored");
        Ok(())
    }
}
