//! Kubernetes Event recording
//!
//! Events are fire-and-forget: a failed publish is logged and never fails
//! the reconcile that produced it.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Publishes Kubernetes Events about a resource
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on `resource_ref`.
    ///
    /// `reason` is machine-readable (see [`reasons`]), `action` is what the
    /// controller did (see [`actions`]) and `note` is for humans.
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`
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
            warn!(reason, action, error = %e, "failed to publish Kubernetes event");
        }
    }
}

/// Event reasons, shown under REASON in `kubectl get events`
pub mod reasons {
    /// Workflow pod and its ConfigMap were created
    pub const POD_CREATED: &str = "PodCreated";
    /// The Workflow could not be compiled into a pod
    pub const COMPILATION_FAILED: &str = "CompilationFailed";
}

/// Event actions, shown under ACTION in `kubectl get events`
pub mod actions {
    /// Compiling a Workflow into a pod
    pub const COMPILE: &str = "Compile";
    /// Creating the workflow pod
    pub const CREATE: &str = "Create";
}
