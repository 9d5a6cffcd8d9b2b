//! Keel in-RAM cluster: hash-map backed implementations of the client seams.
//!
//! Every call is recorded so tests can assert on the exact sequence of reads
//! and writes a pass performs. Failures can be injected per operation and
//! resource name.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use keel_core::{
    ClientError, ClusterClient, Error, EventSink, Installation, InstallationSpec, InstallationStatus,
    ObjectKey, RecordStore, ResourceRef,
};
use kube::core::DynamicObject;
use kube::runtime::events::EventType;
use rustc_hash::FxHashMap;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

/// Operation kinds recorded by `MemoryCluster`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Get,
    Apply,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: Op,
    pub resource: ResourceRef,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory resource store.
#[derive(Default)]
pub struct MemoryCluster {
    objects: Mutex<FxHashMap<ResourceRef, DynamicObject>>,
    calls: Mutex<Vec<Call>>,
    failures: Mutex<FxHashMap<(Op, String), u16>>,
    rv: AtomicU64,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed live state without recording a call.
    pub fn insert(&self, obj: DynamicObject) -> Result<ResourceRef, Error> {
        let r = ResourceRef::of(&obj)?;
        let stamped = self.stamp(obj, None);
        lock(&self.objects).insert(r.clone(), stamped);
        Ok(r)
    }

    /// Make every `op` on a resource named `name` fail with an API error `code`.
    pub fn fail(&self, op: Op, name: &str, code: u16) {
        lock(&self.failures).insert((op, name.to_string()), code);
    }

    pub fn clear_failures(&self) {
        lock(&self.failures).clear();
    }

    pub fn calls(&self) -> Vec<Call> {
        lock(&self.calls).clone()
    }

    pub fn count(&self, op: Op) -> usize {
        lock(&self.calls).iter().filter(|c| c.op == op).count()
    }

    pub fn reset_calls(&self) {
        lock(&self.calls).clear();
    }

    pub fn contains(&self, r: &ResourceRef) -> bool {
        lock(&self.objects).contains_key(r)
    }

    pub fn object(&self, r: &ResourceRef) -> Option<DynamicObject> {
        lock(&self.objects).get(r).cloned()
    }

    fn record(&self, op: Op, resource: &ResourceRef) -> Result<(), ClientError> {
        lock(&self.calls).push(Call { op, resource: resource.clone() });
        match lock(&self.failures).get(&(op, resource.name.clone())) {
            Some(code) => Err(ClientError::Api { code: *code, message: format!("injected {:?} failure", op) }),
            None => Ok(()),
        }
    }

    fn stamp(&self, mut obj: DynamicObject, previous: Option<&DynamicObject>) -> DynamicObject {
        let rv = self.rv.fetch_add(1, Ordering::SeqCst) + 1;
        obj.metadata.resource_version = Some(rv.to_string());
        if obj.metadata.uid.is_none() {
            obj.metadata.uid = previous
                .and_then(|p| p.metadata.uid.clone())
                .or_else(|| Some(Uuid::new_v4().to_string()));
        }
        obj
    }
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn get(&self, resource: &ResourceRef) -> Result<DynamicObject, ClientError> {
        self.record(Op::Get, resource)?;
        lock(&self.objects)
            .get(resource)
            .cloned()
            .ok_or_else(|| ClientError::NotFound(resource.to_string()))
    }

    async fn apply(&self, obj: &DynamicObject) -> Result<DynamicObject, ClientError> {
        let r = ResourceRef::of(obj).map_err(|e| ClientError::Api { code: 422, message: e.to_string() })?;
        self.record(Op::Apply, &r)?;
        let mut objects = lock(&self.objects);
        let mut desired = obj.clone();
        // status is a subresource; applies never touch it
        if let Some(status) = objects.get(&r).and_then(|p| p.data.get("status")).cloned() {
            if let Some(body) = desired.data.as_object_mut() {
                body.insert("status".into(), status);
            }
        }
        let live = self.stamp(desired, objects.get(&r));
        objects.insert(r.clone(), live.clone());
        debug!(resource = %r, "applied");
        Ok(live)
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<(), ClientError> {
        self.record(Op::Delete, resource)?;
        match lock(&self.objects).remove(resource) {
            Some(_) => Ok(()),
            None => Err(ClientError::NotFound(resource.to_string())),
        }
    }
}

/// Deployment with an `Available` condition of the given truth value.
pub fn deployment(namespace: &str, name: &str, available: bool) -> DynamicObject {
    let mut obj = ResourceRef::new("apps/v1", "Deployment", Some(namespace), name).to_object();
    obj.data = json!({
        "spec": { "replicas": 1 },
        "status": {
            "conditions": [
                { "type": "Available", "status": if available { "True" } else { "False" } }
            ]
        }
    });
    obj
}

/// In-memory record store with resourceVersion checks.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: Mutex<FxHashMap<ObjectKey, Installation>>,
    status_writes: Mutex<Vec<InstallationStatus>>,
    upgrades: Mutex<Vec<InstallationSpec>>,
    gets: AtomicU64,
    fail_status: Mutex<Option<u16>>,
    rv: AtomicU64,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record as if a user created it; fills uid and resourceVersion.
    pub fn insert(&self, mut record: Installation) -> Installation {
        if record.metadata.uid.is_none() {
            record.metadata.uid = Some(Uuid::new_v4().to_string());
        }
        if record.metadata.generation.is_none() {
            record.metadata.generation = Some(1);
        }
        record.metadata.resource_version = Some(self.next_rv());
        lock(&self.records).insert(ObjectKey::from_resource(&record), record.clone());
        record
    }

    pub fn current(&self, namespace: &str, name: &str) -> Option<Installation> {
        lock(&self.records).get(&ObjectKey::new(namespace, name)).cloned()
    }

    /// Every status written, in order.
    pub fn status_writes(&self) -> Vec<InstallationStatus> {
        lock(&self.status_writes).clone()
    }

    pub fn upgrades(&self) -> Vec<InstallationSpec> {
        lock(&self.upgrades).clone()
    }

    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::SeqCst)
    }

    /// Make status writes fail with an API error `code`; `None` clears it.
    pub fn fail_status_writes(&self, code: Option<u16>) {
        *lock(&self.fail_status) = code;
    }

    fn next_rv(&self) -> String {
        (self.rv.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Installation, ClientError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        lock(&self.records)
            .get(&ObjectKey::new(namespace, name))
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("installation {}/{}", namespace, name)))
    }

    async fn update_status(&self, record: &Installation) -> Result<Installation, ClientError> {
        if let Some(code) = *lock(&self.fail_status) {
            return Err(ClientError::Api { code, message: "injected status failure".into() });
        }
        let key = ObjectKey::from_resource(record);
        let mut records = lock(&self.records);
        let existing = records
            .get_mut(&key)
            .ok_or_else(|| ClientError::NotFound(format!("installation {}", key)))?;
        if record.metadata.resource_version.is_some()
            && record.metadata.resource_version != existing.metadata.resource_version
        {
            return Err(ClientError::Conflict(format!("installation {}", key)));
        }
        existing.status = record.status.clone();
        existing.metadata.resource_version = Some(self.next_rv());
        lock(&self.status_writes).push(record.status_or_default());
        Ok(existing.clone())
    }

    async fn upgrade(&self, record: &Installation) -> Result<(), ClientError> {
        let key = ObjectKey::from_resource(record);
        let mut records = lock(&self.records);
        let existing = records
            .get_mut(&key)
            .ok_or_else(|| ClientError::NotFound(format!("installation {}", key)))?;
        existing.spec = record.spec.clone();
        existing.metadata.generation = Some(existing.metadata.generation.unwrap_or(0) + 1);
        existing.metadata.resource_version = Some(self.next_rv());
        lock(&self.upgrades).push(record.spec.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub record: ObjectKey,
    pub type_: &'static str,
    pub reason: String,
    pub message: String,
}

/// Event sink that keeps every event.
#[derive(Default)]
pub struct RecordingEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        lock(&self.events).clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        lock(&self.events).iter().map(|e| e.reason.clone()).collect()
    }
}

#[async_trait]
impl EventSink for RecordingEvents {
    async fn publish(&self, record: &Installation, type_: EventType, reason: &str, message: String) {
        let type_ = match type_ {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        };
        lock(&self.events).push(RecordedEvent {
            record: ObjectKey::from_resource(record),
            type_,
            reason: reason.to_string(),
            message,
        });
    }
}
