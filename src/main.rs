//! MicroApplication operator - GitOps sync of small applications from git

use std::sync::Arc;

use clap::Parser;
use futures::{future, StreamExt, TryStreamExt};
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::{reflector, Controller, WatchStreamExt};
use kube::{Api, Client, CustomResourceExt, ResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use microapp::admission::install_with_retry;
use microapp::config::{ControllerArgs, LogFormat};
use microapp::controller::{error_policy, reconcile, Context};
use microapp::crd::MicroApplication;
use microapp::predicate::{ChangePredicate, GenerationChanged};
use microapp::retry::{retry_with_backoff, RetryConfig};

/// MicroApplication operator
#[derive(Parser, Debug)]
#[command(name = "microapp", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    controller: ControllerArgs,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // kube's rustls-tls needs a process-wide provider
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_tracing(cli.controller.log_format);

    if cli.crd {
        let crd = serde_yaml::to_string(&MicroApplication::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    run_controller(cli.controller).await
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,microapp=debug,kube=info,tower=warn,hyper=warn"));

    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            )
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init(),
    }
}

/// Install or update the MicroApplication CRD
///
/// Server-side apply keeps the installed schema in step with the binary.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(microapp::FIELD_MANAGER).force();
    let crd = MicroApplication::crd();
    let patch = Patch::Apply(&crd);

    tracing::info!("Installing MicroApplication CRD...");
    retry_with_backoff(
        &RetryConfig::with_max_attempts(5),
        "install_crd",
        |_: &kube::Error| true,
        || crds.patch("microapplications.argoproj.io", &params, &patch),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install MicroApplication CRD: {}", e))?;

    tracing::info!("MicroApplication CRD installed/updated");
    Ok(())
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    args.validate()?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crd_installed(&client).await?;

    let mut kinds = args.kind_table()?;
    if args.discover_kinds {
        if let Err(e) = kinds.extend_from_discovery(client.clone()).await {
            tracing::warn!(error = %e, "API discovery failed, using the static kind table");
        }
    }
    tracing::info!(kinds = kinds.len(), "Kind table ready");

    let ctx = Arc::new(
        Context::builder(client.clone())
            .workspace_root(args.workspace_root.clone())
            .superuser(args.superuser.clone())
            .creator_annotation(args.creator_annotation.clone())
            .field_manager(args.field_manager.clone())
            .reconcile_timeout(args.reconcile_timeout())
            .git_credentials(args.git_credentials())
            .kinds(Arc::new(kinds))
            .build(),
    );

    if args.install_admission_controller {
        match install_with_retry(&ctx, &args.admission(), &RetryConfig::with_max_attempts(5)).await
        {
            Ok(summary) => tracing::info!(
                created = summary.created,
                unchanged = summary.unchanged,
                "Admission controller ready"
            ),
            Err(e) => tracing::error!(
                error = %e,
                "Admission controller install failed, continuing without it"
            ),
        }
    }

    // Status writes and resync events must not retrigger a sync; only spec
    // edits (generation bumps) and recreations pass.
    let predicate = Arc::new(GenerationChanged::new());
    let forget = predicate.clone();
    let (reader, writer) = reflector::store();
    let apps: Api<MicroApplication> = Api::all(client);
    let changes = watcher::watcher(apps, WatcherConfig::default())
        .default_backoff()
        .reflect(writer)
        .inspect_ok(move |event| {
            if let watcher::Event::Delete(app) = event {
                forget.forget(&app.namespace().unwrap_or_default(), &app.name_any());
            }
        })
        .applied_objects()
        .try_filter(move |app| future::ready(predicate.should_reconcile(app)));

    tracing::info!(
        workspace_root = %args.workspace_root.display(),
        "Starting MicroApplication controller"
    );

    Controller::for_stream(changes, reader)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "MicroApplication reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "MicroApplication reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("Controller stopped");
    Ok(())
}
