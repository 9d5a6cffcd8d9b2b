//! Seams between the reconciler and the cluster.
//!
//! Production implementations live in `keel-kubehub`; the in-memory ones in
//! `keel-store` back the tests.

use async_trait::async_trait;
use kube::core::DynamicObject;
use kube::runtime::events::EventType;

use crate::error::ClientError;
use crate::key::ResourceRef;
use crate::record::Installation;

/// Read/write access to arbitrary cluster resources.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Live state of a resource; `ClientError::NotFound` when absent.
    async fn get(&self, resource: &ResourceRef) -> Result<DynamicObject, ClientError>;

    /// Create or update a resource to match `obj`; returns the live result.
    async fn apply(&self, obj: &DynamicObject) -> Result<DynamicObject, ClientError>;

    /// Delete a resource; `ClientError::NotFound` when absent.
    async fn delete(&self, resource: &ResourceRef) -> Result<(), ClientError>;
}

/// Access to installation records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Installation, ClientError>;

    /// Writes only the status of `record`. The write is conditional on
    /// `metadata.resourceVersion`; a stale version yields `ClientError::Conflict`.
    async fn update_status(&self, record: &Installation) -> Result<Installation, ClientError>;

    /// Needs-upgrade signal: persists the defaulted spec of `record`.
    async fn upgrade(&self, record: &Installation) -> Result<(), ClientError>;
}

/// Fire-and-forget notifications about a record.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, record: &Installation, type_: EventType, reason: &str, message: String);
}

/// Event sink that drops everything.
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn publish(&self, _record: &Installation, _type: EventType, _reason: &str, _message: String) {}
}
