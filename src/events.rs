//! Kubernetes Events for MicroApplications
//!
//! Sync outcomes show up in `kubectl describe microapplication` next to the
//! status. Publishing is fire-and-forget: a failed event is logged and never
//! fails reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
#[cfg(test)]
use mockall::automock;
use tracing::warn;

use crate::crd::MicroApplication;
use crate::status::SyncOutcome;

/// Publishes Kubernetes Events
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event about `resource_ref`
    ///
    /// Never fails; implementations log publishing errors.
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// [`EventPublisher`] backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "Failed to publish Kubernetes event");
        }
    }
}

/// Publisher that drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons (REASON column of `kubectl get events`)
pub mod reasons {
    /// Every resource authorized and present
    pub const SYNCED: &str = "Synced";
    /// The creator may not create a resource from the source
    pub const ACCESS_DENIED: &str = "AccessDenied";
    /// A pipeline stage failed
    pub const RECONCILE_FAILED: &str = "ReconcileFailed";
    /// The MicroApplication spec is invalid
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
}

/// Event actions (ACTION column of `kubectl get events`)
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
}

/// Publish the event matching `outcome` on `app`
pub async fn publish_outcome(
    publisher: &dyn EventPublisher,
    app: &MicroApplication,
    outcome: &SyncOutcome,
) {
    let (type_, reason) = match outcome {
        SyncOutcome::Synced { .. } => (EventType::Normal, reasons::SYNCED),
        SyncOutcome::Denied { .. } => (EventType::Warning, reasons::ACCESS_DENIED),
        SyncOutcome::Failed { .. } => (EventType::Warning, reasons::RECONCILE_FAILED),
    };
    publisher
        .publish(
            &app.object_ref(&()),
            type_,
            reason,
            actions::RECONCILE,
            Some(outcome.message()),
        )
        .await;
}
