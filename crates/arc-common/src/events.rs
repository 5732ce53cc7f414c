//! Kubernetes Events emitted on Runners
//!
//! Events show up under `kubectl describe runner <name>`. Publishing never
//! fails the caller; a rejected Event is only logged.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Sink for Runner Events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Record one Event against `regarding`
    ///
    /// `reason` and `action` should come from [`reasons`] and [`actions`].
    async fn publish(
        &self,
        regarding: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publishes through the cluster's events API
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Events are reported by `controller`, with the operator pod's hostname as instance
    pub fn new(client: Client, controller: &str) -> Self {
        let reporter = Reporter {
            controller: controller.to_owned(),
            instance: std::env::var("HOSTNAME").ok(),
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
        regarding: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_owned(),
            note,
            action: action.to_owned(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, regarding).await {
            warn!(
                object = regarding.name.as_deref().unwrap_or_default(),
                namespace = regarding.namespace.as_deref().unwrap_or_default(),
                reason,
                error = %e,
                "dropping event the API server rejected"
            );
        }
    }
}

/// Discards every Event
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _regarding: &ObjectReference,
        _type: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons (the REASON column of `kubectl get events`)
pub mod reasons {
    /// Runner pod was created
    pub const POD_CREATED: &str = "PodCreated";
    /// Runner pod was deleted, gracefully or forcefully
    pub const POD_DELETED: &str = "PodDeleted";
    /// A fresh registration token was recorded in status
    pub const REGISTRATION_TOKEN_UPDATED: &str = "RegistrationTokenUpdated";
    /// Minting a registration token failed
    pub const FAILED_UPDATE_REGISTRATION_TOKEN: &str = "FailedUpdateRegistrationToken";
    /// Runner was removed from the registration service
    pub const RUNNER_REMOVED: &str = "RunnerRemoved";
    /// Spec validation failed
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
}

/// Event actions
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Creating the runner pod
    pub const CREATE: &str = "Create";
    /// Deleting the runner pod or registration
    pub const DELETE: &str = "Delete";
    /// Registering the runner with the registration service
    pub const REGISTER: &str = "Register";
}
