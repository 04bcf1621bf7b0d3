//! Workflow controller implementation
//!
//! A Workflow is run at most once. Each reconcile resolves the default
//! options for the Workflow's namespace, compiles the Workflow into an
//! [`ExecutionPlan`](crate::plan::ExecutionPlan), and creates the plan's
//! ConfigMap and Pod if they do not exist yet. Once the monitor has written
//! `status.updated`, the Workflow is left alone.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::{Api, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use flowpod_common::config::OperatorEnv;
use flowpod_common::crd::Workflow;
use flowpod_common::defaults::{resolve_defaults, DEFAULTS_CONFIG_KEY};
use flowpod_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use flowpod_common::FIELD_MANAGER;

use crate::compiler::ManifestCompiler;
use crate::error::WorkflowError;

/// Name reported as the source of Workflow events
pub const CONTROLLER_NAME: &str = "flowpod-workflow-controller";

const REQUEUE_ON_ERROR: Duration = Duration::from_secs(30);

// =============================================================================
// Kubernetes access
// =============================================================================

/// Kubernetes operations needed by the Workflow controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait WorkflowKubeClient: Send + Sync {
    /// Read `key` from a ConfigMap; `None` when the ConfigMap or key is missing
    async fn get_config_map_data(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Option<String>, WorkflowError>;

    /// Create a ConfigMap; `false` when it already exists
    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<bool, WorkflowError>;

    /// Create a Pod; `false` when it already exists
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<bool, WorkflowError>;
}

/// [`WorkflowKubeClient`] backed by a kube [`Client`]
pub struct WorkflowKubeClientImpl {
    client: Client,
}

impl WorkflowKubeClientImpl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

fn created_or_exists<T>(result: Result<T, kube::Error>) -> Result<bool, WorkflowError> {
    match result {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl WorkflowKubeClient for WorkflowKubeClientImpl {
    async fn get_config_map_data(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Option<String>, WorkflowError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(cm) => Ok(cm.data.and_then(|mut data| data.remove(key))),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_config_map(
        &self,
        namespace: &str,
        config_map: &ConfigMap,
    ) -> Result<bool, WorkflowError> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        created_or_exists(api.create(&Self::post_params(), config_map).await)
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<bool, WorkflowError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        created_or_exists(api.create(&Self::post_params(), pod).await)
    }
}

// =============================================================================
// Context
// =============================================================================

/// Shared context for the Workflow controller
pub struct WorkflowContext {
    pub kube: Arc<dyn WorkflowKubeClient>,
    pub events: Arc<dyn EventPublisher>,
    pub env: OperatorEnv,
}

impl WorkflowContext {
    pub fn new(
        kube: Arc<dyn WorkflowKubeClient>,
        events: Arc<dyn EventPublisher>,
        env: OperatorEnv,
    ) -> Self {
        Self { kube, events, env }
    }

    /// Context talking to the cluster through `client`
    pub fn from_client(client: Client, env: OperatorEnv) -> Self {
        Self {
            kube: Arc::new(WorkflowKubeClientImpl::new(client.clone())),
            events: Arc::new(KubeEventPublisher::new(client, CONTROLLER_NAME)),
            env,
        }
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Reconcile a Workflow
#[instrument(skip(workflow, ctx), fields(workflow = %workflow.name_any()))]
pub async fn reconcile(
    workflow: Arc<Workflow>,
    ctx: Arc<WorkflowContext>,
) -> Result<Action, WorkflowError> {
    let name = workflow.name_any();
    let namespace = workflow
        .metadata
        .namespace
        .as_deref()
        .ok_or(WorkflowError::MissingNamespace)?;

    if workflow.meta().deletion_timestamp.is_some() {
        debug!("workflow is being deleted");
        return Ok(Action::await_change());
    }
    if workflow.has_run() {
        debug!("workflow already ran, not creating a new pod");
        return Ok(Action::await_change());
    }

    let document = match ctx
        .kube
        .get_config_map_data(namespace, &ctx.env.config_map_name, DEFAULTS_CONFIG_KEY)
        .await
    {
        Ok(document) => document,
        Err(e) => {
            warn!(
                config_map = %ctx.env.config_map_name,
                error = %e,
                "unable to read stored defaults, using environment defaults"
            );
            None
        }
    };
    let defaults = resolve_defaults(&ctx.env, document.as_deref());

    let plan = match ManifestCompiler::new(&workflow, &defaults, &ctx.env).compile() {
        Ok(plan) => plan,
        Err(e) => {
            ctx.events
                .publish(
                    &workflow.object_ref(&()),
                    EventType::Warning,
                    reasons::COMPILATION_FAILED,
                    actions::COMPILE,
                    Some(e.to_string()),
                )
                .await;
            return Err(e.into());
        }
    };

    let config_map = plan.config_map()?;
    if ctx.kube.create_config_map(namespace, &config_map).await? {
        info!(config_map = ?config_map.metadata.name, "created workflow config");
    }

    if ctx.kube.create_pod(namespace, &plan.to_pod()).await? {
        info!(pod = %plan.name, namespace, "created workflow pod");
        ctx.events
            .publish(
                &workflow.object_ref(&()),
                EventType::Normal,
                reasons::POD_CREATED,
                actions::CREATE,
                Some(format!("created pod {} in namespace {namespace}", plan.name)),
            )
            .await;
    } else {
        debug!(pod = %name, "workflow pod already exists");
    }

    Ok(Action::await_change())
}

/// Error policy for Workflow reconciliation
///
/// Compile errors wait for the Workflow to change; everything else is
/// retried after a delay.
pub fn error_policy(
    workflow: Arc<Workflow>,
    error: &WorkflowError,
    _ctx: Arc<WorkflowContext>,
) -> Action {
    if error.is_retryable() {
        error!(?error, workflow = %workflow.name_any(), "workflow reconciliation failed");
        Action::requeue(REQUEUE_ON_ERROR)
    } else {
        warn!(error = %error, workflow = %workflow.name_any(), "workflow cannot be run as specified");
        Action::await_change()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use flowpod_common::crd::{PackageRef, WorkflowSpec, WorkflowStatus};
    use k8s_openapi::api::core::v1::ObjectReference;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use crate::error::ManifestError;

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    #[derive(Default)]
    struct RecordingPublisher {
        events: Mutex<Vec<(String, String)>>,
    }

    impl RecordingPublisher {
        fn reasons(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|(reason, _)| reason.clone())
                .collect()
        }
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(
            &self,
            _resource_ref: &ObjectReference,
            _type_: EventType,
            reason: &str,
            _action: &str,
            note: Option<String>,
        ) {
            self.events
                .lock()
                .unwrap()
                .push((reason.to_string(), note.unwrap_or_default()));
        }
    }

    fn env() -> OperatorEnv {
        OperatorEnv {
            flow_image: "env/flow:1".to_string(),
            git_sync_image: "env/git-sync:1".to_string(),
            ..Default::default()
        }
    }

    fn sample_workflow() -> Workflow {
        let mut wf = Workflow::new(
            "wf-1",
            WorkflowSpec {
                package: Some(PackageRef {
                    url: Some("https://example.com/org/repo.git".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        wf.metadata.namespace = Some("runs".to_string());
        wf.metadata.uid = Some("uid-1".to_string());
        wf
    }

    fn context(kube: MockWorkflowKubeClient) -> (Arc<WorkflowContext>, Arc<RecordingPublisher>) {
        let events = Arc::new(RecordingPublisher::default());
        let ctx = WorkflowContext::new(Arc::new(kube), events.clone(), env());
        (Arc::new(ctx), events)
    }

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    #[tokio::test]
    async fn new_workflow_creates_config_map_then_pod() {
        let mut kube = MockWorkflowKubeClient::new();
        kube.expect_get_config_map_data()
            .withf(|ns, name, key| ns == "runs" && name == "workflow-runtime-service" && key == "config.json")
            .returning(|_, _, _| Ok(None));
        kube.expect_create_config_map()
            .withf(|ns, cm| ns == "runs" && cm.metadata.name.as_deref() == Some("wf-1-config"))
            .times(1)
            .returning(|_, _| Ok(true));
        kube.expect_create_pod()
            .withf(|ns, pod| {
                ns == "runs"
                    && pod.metadata.name.as_deref() == Some("wf-1")
                    && pod.spec.as_ref().unwrap().containers[0].image.as_deref()
                        == Some("env/flow:1")
            })
            .times(1)
            .returning(|_, _| Ok(true));

        let (ctx, events) = context(kube);
        let action = reconcile(Arc::new(sample_workflow()), ctx).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(events.reasons(), vec![reasons::POD_CREATED]);
    }

    #[tokio::test]
    async fn stored_defaults_override_environment() {
        let mut kube = MockWorkflowKubeClient::new();
        kube.expect_get_config_map_data()
            .returning(|_, _, _| Ok(Some(r#"{"image": "cm/flow:2"}"#.to_string())));
        kube.expect_create_config_map().returning(|_, _| Ok(true));
        kube.expect_create_pod()
            .withf(|_, pod| {
                pod.spec.as_ref().unwrap().containers[0].image.as_deref() == Some("cm/flow:2")
            })
            .times(1)
            .returning(|_, _| Ok(true));

        let (ctx, _) = context(kube);
        reconcile(Arc::new(sample_workflow()), ctx).await.unwrap();
    }

    #[tokio::test]
    async fn defaults_lookup_failure_degrades_to_environment() {
        let mut kube = MockWorkflowKubeClient::new();
        kube.expect_get_config_map_data()
            .returning(|_, _, _| Err(WorkflowError::Kube(api_error(403))));
        kube.expect_create_config_map().returning(|_, _| Ok(true));
        kube.expect_create_pod()
            .withf(|_, pod| {
                pod.spec.as_ref().unwrap().containers[0].image.as_deref() == Some("env/flow:1")
            })
            .times(1)
            .returning(|_, _| Ok(true));

        let (ctx, _) = context(kube);
        let action = reconcile(Arc::new(sample_workflow()), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn existing_pod_is_left_alone() {
        let mut kube = MockWorkflowKubeClient::new();
        kube.expect_get_config_map_data().returning(|_, _, _| Ok(None));
        kube.expect_create_config_map().returning(|_, _| Ok(false));
        kube.expect_create_pod().returning(|_, _| Ok(false));

        let (ctx, events) = context(kube);
        let action = reconcile(Arc::new(sample_workflow()), ctx).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert!(events.reasons().is_empty());
    }

    #[tokio::test]
    async fn workflow_that_already_ran_is_skipped() {
        let mut wf = sample_workflow();
        wf.status = Some(WorkflowStatus {
            updated: Some("2024-05-01T10:00:00Z".to_string()),
            ..Default::default()
        });

        // no expectations: any Kubernetes call fails the test
        let (ctx, events) = context(MockWorkflowKubeClient::new());
        let action = reconcile(Arc::new(wf), ctx).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert!(events.reasons().is_empty());
    }

    #[tokio::test]
    async fn deleted_workflow_is_skipped() {
        let mut wf = sample_workflow();
        wf.metadata.deletion_timestamp = Some(Time(Default::default()));

        let (ctx, _) = context(MockWorkflowKubeClient::new());
        let action = reconcile(Arc::new(wf), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn compile_failure_publishes_warning_and_creates_nothing() {
        let mut wf = sample_workflow();
        wf.spec.instance = Some("run.instance".to_string());

        let mut kube = MockWorkflowKubeClient::new();
        kube.expect_get_config_map_data().returning(|_, _, _| Ok(None));
        kube.expect_create_config_map().never();
        kube.expect_create_pod().never();

        let (ctx, events) = context(kube);
        let err = reconcile(Arc::new(wf), ctx).await.unwrap_err();

        assert!(matches!(
            err,
            WorkflowError::Manifest(ManifestError::SpecConflict { .. })
        ));
        assert_eq!(events.reasons(), vec![reasons::COMPILATION_FAILED]);
    }

    #[tokio::test]
    async fn pod_creation_error_propagates() {
        let mut kube = MockWorkflowKubeClient::new();
        kube.expect_get_config_map_data().returning(|_, _, _| Ok(None));
        kube.expect_create_config_map().returning(|_, _| Ok(true));
        kube.expect_create_pod()
            .returning(|_, _| Err(WorkflowError::Kube(api_error(500))));

        let (ctx, events) = context(kube);
        let err = reconcile(Arc::new(sample_workflow()), ctx).await.unwrap_err();

        assert!(err.is_retryable());
        assert!(events.reasons().is_empty());
    }

    #[tokio::test]
    async fn missing_namespace_is_an_error() {
        let mut wf = sample_workflow();
        wf.metadata.namespace = None;

        let (ctx, _) = context(MockWorkflowKubeClient::new());
        let err = reconcile(Arc::new(wf), ctx).await.unwrap_err();
        assert!(matches!(err, WorkflowError::MissingNamespace));
    }

    // =========================================================================
    // Error policy
    // =========================================================================

    #[test]
    fn manifest_errors_wait_for_a_change() {
        let (ctx, _) = context(MockWorkflowKubeClient::new());
        let err = WorkflowError::from(ManifestError::incomplete("nothing to run"));
        let action = error_policy(Arc::new(sample_workflow()), &err, ctx);
        assert_eq!(action, Action::await_change());
    }

    #[test]
    fn transient_errors_requeue() {
        let (ctx, _) = context(MockWorkflowKubeClient::new());
        let err = WorkflowError::Kube(api_error(503));
        let action = error_policy(Arc::new(sample_workflow()), &err, ctx);
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));
    }

    #[test]
    fn conflict_responses_mean_already_exists() {
        assert!(!created_or_exists::<()>(Err(api_error(409))).unwrap());
        assert!(created_or_exists(Ok(())).unwrap());
        assert!(created_or_exists::<()>(Err(api_error(500))).is_err());
    }
}
