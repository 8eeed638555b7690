//! Admission companion install
//!
//! The creator annotation that the authorization gate relies on is stamped by
//! a separate admission webhook. When enabled, the operator installs that
//! webhook at startup from its own repository, using the same workspace sync
//! and create-if-absent applier as applications do. The install runs with the
//! operator's own permissions; there is no per-resource review.

use tracing::info;

use crate::apply::ApplySummary;
use crate::controller::Context;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::source::{CancelFlag, SourceRef};
use crate::Error;

/// Repository holding the admission companion manifests
pub const DEFAULT_ADMISSION_REPO_URL: &str =
    "https://github.com/sbose78/micro-application-admission";

/// Manifest directory inside the companion repository
pub const DEFAULT_ADMISSION_REPO_PATH: &str = "manifests/openshift";

/// Namespace for companion resources that do not pin one
pub const ADMISSION_DEFAULT_NAMESPACE: &str = "default";

/// Companion checkout, relative to the workspace root
///
/// Namespace names cannot start with a dot, so this never collides with an
/// application's `<namespace>/<name>` workspace.
pub const ADMISSION_WORKSPACE: &str = ".microapp/admission";

/// Where to install the admission companion from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdmissionConfig {
    /// Companion repository
    pub repo_url: String,
    /// Manifest path inside the repository
    pub manifest_path: String,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            repo_url: DEFAULT_ADMISSION_REPO_URL.to_string(),
            manifest_path: DEFAULT_ADMISSION_REPO_PATH.to_string(),
        }
    }
}

/// Sync the companion repository and create its resources
///
/// The checkout lives at `<workspace root>/.microapp/admission`.
pub async fn install_admission_controller(
    ctx: &Context,
    config: &AdmissionConfig,
) -> Result<ApplySummary, Error> {
    let workspace = ctx
        .workspaces
        .at(ctx.workspace_root.join(ADMISSION_WORKSPACE));
    let revision = workspace
        .sync(
            ctx.source.clone(),
            &SourceRef::new(config.repo_url.as_str()),
            &CancelFlag::new(),
        )
        .await?;
    let resources = workspace
        .discover(vec![config.manifest_path.clone()])
        .await?;

    let summary = ctx
        .applier
        .apply(&resources, ADMISSION_DEFAULT_NAMESPACE)
        .await?;
    info!(
        revision = %revision,
        created = summary.created,
        unchanged = summary.unchanged,
        "Admission controller installed"
    );
    Ok(summary)
}

/// [`install_admission_controller`] retried with backoff on retryable errors
pub async fn install_with_retry(
    ctx: &Context,
    config: &AdmissionConfig,
    retry: &RetryConfig,
) -> Result<ApplySummary, Error> {
    retry_with_backoff(
        retry,
        "install_admission_controller",
        Error::is_retryable,
        || install_admission_controller(ctx, config),
    )
    .await
}
