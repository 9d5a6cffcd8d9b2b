//! `EventSink` publishing Kubernetes Events.

use async_trait::async_trait;
use keel_core::{EventSink, Installation};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::warn;

/// Reporting component shown on every event.
pub const REPORTER: &str = "keel-operator";

/// Publishes events against the record; failures are logged and dropped.
pub struct KubeEventSink {
    client: Client,
    reporter: Reporter,
}

impl KubeEventSink {
    pub fn new(client: Client, instance: Option<String>) -> Self {
        Self { client, reporter: Reporter { controller: REPORTER.to_string(), instance } }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(&self, record: &Installation, type_: EventType, reason: &str, message: String) {
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), record.object_ref(&()));
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(message),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!(reason, error = %e, "failed to publish event");
        }
    }
}
