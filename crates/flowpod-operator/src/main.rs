//! flowpod operator - runs Workflow objects as pods

use std::future::Future;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};

use flowpod_common::config::OperatorEnv;
use flowpod_common::crd::Workflow;
use flowpod_common::telemetry::{init_telemetry, TelemetryConfig};
use flowpod_workflow::controller::{error_policy, reconcile, WorkflowContext};

/// Watcher timeout (seconds); must stay below the client read timeout (30s)
/// so idle watches are closed by the API server first.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// flowpod - compiles Workflow custom resources into pods
#[derive(Parser, Debug)]
#[command(name = "flowpod", version, about, long_about = None)]
struct Cli {
    /// Print the Workflow CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Run the Workflow controller (default mode)
    ///
    /// Watches Workflow objects in every namespace and creates one pod per
    /// pending Workflow, together with the ConfigMap holding its rendered
    /// configuration.
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Workflow::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig::default())?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller().await,
    }
}

async fn run_controller() -> anyhow::Result<()> {
    let env = OperatorEnv::from_env();
    tracing::info!(
        flow_image = %env.flow_image,
        git_sync_image = %env.git_sync_image,
        config_map = %env.config_map_name,
        "Starting flowpod controller"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    build_workflow_controller(client, env).await;

    tracing::info!("Workflow controller stopped");
    Ok(())
}

/// Workflow controller future; it also watches the pods it creates so a
/// deleted pod triggers a fresh reconcile of its Workflow.
fn build_workflow_controller(client: Client, env: OperatorEnv) -> impl Future<Output = ()> {
    let ctx = Arc::new(WorkflowContext::from_client(client.clone(), env));
    let workflows: Api<Workflow> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client);

    Controller::new(
        workflows,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .owns(pods, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each(|result| async move {
        match result {
            Ok(action) => tracing::debug!(?action, "Workflow reconciliation completed"),
            Err(e) => tracing::error!(error = ?e, "Workflow reconciliation error"),
        }
    })
}
