//! MicroApplication reconciliation
//!
//! Each reconciliation runs the pipeline from scratch:
//!
//! ```text
//! Start -> Synced -> Parsed -> Authorized -> Applied -> Recorded
//! ```
//!
//! A denial or an error jumps straight to `Recorded`: the status recorder runs
//! on every path, carrying whatever is known about the attempt. Nothing is
//! kept in memory between reconciliations except what the workspace and the
//! status hold.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::apply::{Applier, KubeResourceStore, ResourceStore};
use crate::authz::{AccessReviewer, AuthorizationGate, SubjectAccessReviewer};
use crate::crd::MicroApplication;
use crate::events::{self, EventPublisher, KubeEventPublisher, NoopEventPublisher};
use crate::kinds::{KindResolver, KindTable};
use crate::source::{CancelFlag, GitCredentials, GitSource, SourceControl, SourceRef};
use crate::status::{KubeStatusWriter, StatusRecorder, StatusWriter, SyncOutcome};
use crate::workspace::{Workspace, WorkspaceLocks};
use crate::Error;

/// Requeue delay after a retryable failure
const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Requeue delay after a failure that needs a new commit or spec change
const SLOW_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Default deadline for one pipeline run
pub const DEFAULT_RECONCILE_TIMEOUT: Duration = Duration::from_secs(300);

/// Pipeline stage reached by a reconciliation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReconcileStage {
    /// Nothing done yet
    #[default]
    Start,
    /// Workspace is at the latest revision
    Synced,
    /// Manifests were discovered and split
    Parsed,
    /// Every resource passed the gate (or the gate stopped at a denial)
    Authorized,
    /// Missing resources were created
    Applied,
    /// Status was written
    Recorded,
}

impl ReconcileStage {
    /// The step that runs after this stage
    pub fn next_step(&self) -> &'static str {
        match self {
            Self::Start => "sync",
            Self::Synced => "discovery",
            Self::Parsed => "authorization",
            Self::Authorized => "apply",
            Self::Applied => "status",
            Self::Recorded => "done",
        }
    }
}

impl std::fmt::Display for ReconcileStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "Start"),
            Self::Synced => write!(f, "Synced"),
            Self::Parsed => write!(f, "Parsed"),
            Self::Authorized => write!(f, "Authorized"),
            Self::Applied => write!(f, "Applied"),
            Self::Recorded => write!(f, "Recorded"),
        }
    }
}

/// What a pipeline run got through before it returned
#[derive(Debug, Default)]
struct Progress {
    stage: ReconcileStage,
    revision: Option<String>,
}

impl Progress {
    fn advance(&mut self, stage: ReconcileStage) {
        debug!(from = %self.stage, to = %stage, "stage complete");
        self.stage = stage;
    }
}

/// Controller context containing shared state and clients
///
/// Use [`ContextBuilder`] to construct instances:
///
/// ```ignore
/// let ctx = Context::builder(client)
///     .workspace_root("/var/lib/microapp")
///     .kinds(Arc::new(table))
///     .build();
/// ```
pub struct Context {
    /// Clone/pull backend for workspaces
    pub source: Arc<dyn SourceControl>,
    /// Per-resource authorization
    pub gate: AuthorizationGate,
    /// Create-if-absent applier
    pub applier: Applier,
    /// Status writes
    pub recorder: StatusRecorder,
    /// Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
    /// Base directory for workspaces
    pub workspace_root: PathBuf,
    /// One lock per workspace directory, shared by every reconciliation
    pub workspaces: WorkspaceLocks,
    /// Annotation holding the application's creator
    pub creator_annotation: String,
    /// Deadline for one pipeline run
    pub reconcile_timeout: Duration,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Workspace for an application
    pub fn workspace(&self, namespace: &str, name: &str) -> Workspace {
        self.workspaces
            .workspace(&self.workspace_root, namespace, name)
    }

    /// Create a context for testing with mock collaborators
    ///
    /// Uses the built-in kind table, `kube:admin` as superuser and drops
    /// events.
    #[cfg(test)]
    pub fn for_testing(
        source: Arc<dyn SourceControl>,
        reviewer: Arc<dyn AccessReviewer>,
        store: Arc<dyn ResourceStore>,
        writer: Arc<dyn StatusWriter>,
        workspace_root: &std::path::Path,
    ) -> Self {
        let kinds: Arc<dyn KindResolver> = Arc::new(KindTable::with_builtin_kinds());
        Self {
            source,
            gate: AuthorizationGate::new(reviewer, kinds.clone(), crate::DEFAULT_SUPERUSER),
            applier: Applier::new(store, kinds),
            recorder: StatusRecorder::new(writer),
            events: Arc::new(NoopEventPublisher),
            workspace_root: workspace_root.to_path_buf(),
            workspaces: WorkspaceLocks::new(),
            creator_annotation: crate::CREATOR_ANNOTATION.to_string(),
            reconcile_timeout: DEFAULT_RECONCILE_TIMEOUT,
        }
    }
}

/// Builder for constructing [`Context`] instances
///
/// Every collaborator defaults to its Kubernetes- or git-backed
/// implementation; the overrides exist for tests and embedding.
pub struct ContextBuilder {
    client: Client,
    source: Option<Arc<dyn SourceControl>>,
    reviewer: Option<Arc<dyn AccessReviewer>>,
    store: Option<Arc<dyn ResourceStore>>,
    status_writer: Option<Arc<dyn StatusWriter>>,
    events: Option<Arc<dyn EventPublisher>>,
    kinds: Option<Arc<dyn KindResolver>>,
    credentials: Option<GitCredentials>,
    workspace_root: PathBuf,
    superuser: String,
    creator_annotation: String,
    field_manager: String,
    reconcile_timeout: Duration,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            source: None,
            reviewer: None,
            store: None,
            status_writer: None,
            events: None,
            kinds: None,
            credentials: None,
            workspace_root: PathBuf::from(crate::DEFAULT_WORKSPACE_ROOT),
            superuser: crate::DEFAULT_SUPERUSER.to_string(),
            creator_annotation: crate::CREATOR_ANNOTATION.to_string(),
            field_manager: crate::FIELD_MANAGER.to_string(),
            reconcile_timeout: DEFAULT_RECONCILE_TIMEOUT,
        }
    }

    /// Set the base directory for workspaces
    pub fn workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    /// Set the actor that bypasses authorization
    pub fn superuser(mut self, superuser: impl Into<String>) -> Self {
        self.superuser = superuser.into();
        self
    }

    /// Set the annotation the creator is read from
    pub fn creator_annotation(mut self, annotation: impl Into<String>) -> Self {
        self.creator_annotation = annotation.into();
        self
    }

    /// Set the field manager for creates and status writes
    pub fn field_manager(mut self, manager: impl Into<String>) -> Self {
        self.field_manager = manager.into();
        self
    }

    /// Set the deadline for one pipeline run
    pub fn reconcile_timeout(mut self, timeout: Duration) -> Self {
        self.reconcile_timeout = timeout;
        self
    }

    /// Set credentials for private repositories
    pub fn git_credentials(mut self, credentials: Option<GitCredentials>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Set the kind table
    pub fn kinds(mut self, kinds: Arc<dyn KindResolver>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    /// Override the source control backend
    pub fn source(mut self, source: Arc<dyn SourceControl>) -> Self {
        self.source = Some(source);
        self
    }

    /// Override the access reviewer
    pub fn reviewer(mut self, reviewer: Arc<dyn AccessReviewer>) -> Self {
        self.reviewer = Some(reviewer);
        self
    }

    /// Override the resource store
    pub fn store(mut self, store: Arc<dyn ResourceStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the status writer
    pub fn status_writer(mut self, writer: Arc<dyn StatusWriter>) -> Self {
        self.status_writer = Some(writer);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    pub fn build(self) -> Context {
        let kinds = self
            .kinds
            .unwrap_or_else(|| Arc::new(KindTable::with_builtin_kinds()));
        let source = self.source.unwrap_or_else(|| {
            Arc::new(GitSource::new().with_credentials(self.credentials.clone()))
        });
        let reviewer = self
            .reviewer
            .unwrap_or_else(|| Arc::new(SubjectAccessReviewer::new(self.client.clone())));
        let store = self.store.unwrap_or_else(|| {
            Arc::new(KubeResourceStore::new(
                self.client.clone(),
                self.field_manager.clone(),
            ))
        });
        let status_writer = self.status_writer.unwrap_or_else(|| {
            Arc::new(KubeStatusWriter::new(
                self.client.clone(),
                self.field_manager.clone(),
            ))
        });
        let events = self.events.unwrap_or_else(|| {
            Arc::new(KubeEventPublisher::new(
                self.client.clone(),
                crate::CONTROLLER_NAME,
            ))
        });

        Context {
            source,
            gate: AuthorizationGate::new(reviewer, kinds.clone(), self.superuser),
            applier: Applier::new(store, kinds),
            recorder: StatusRecorder::new(status_writer),
            events,
            workspace_root: self.workspace_root,
            workspaces: WorkspaceLocks::new(),
            creator_annotation: self.creator_annotation,
            reconcile_timeout: self.reconcile_timeout,
        }
    }
}

/// Reconcile a MicroApplication
///
/// Runs the sync pipeline under the context's deadline and records the
/// outcome. A denial is a normal result; errors are returned after the
/// failure is recorded so [`error_policy`] can schedule the retry.
#[instrument(
    skip(app, ctx),
    fields(namespace = %app.namespace().unwrap_or_default(), name = %app.name_any())
)]
pub async fn reconcile(app: Arc<MicroApplication>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = app.name_any();
    let namespace = app
        .namespace()
        .ok_or_else(|| Error::validation(format!("MicroApplication {} has no namespace", name)))?;
    info!("reconciling application");

    if let Err(e) = app.spec.validate() {
        warn!(error = %e, "application validation failed");
        let outcome = SyncOutcome::Failed {
            message: e.to_string(),
            revision: None,
        };
        record(&app, &ctx, &outcome).await;
        ctx.events
            .publish(
                &app.object_ref(&()),
                EventType::Warning,
                events::reasons::VALIDATION_FAILED,
                events::actions::RECONCILE,
                Some(e.to_string()),
            )
            .await;
        // the spec has to change before another attempt can succeed
        return Ok(Action::await_change());
    }

    let mut progress = Progress::default();
    let workspace = ctx.workspace(&namespace, &name);
    let cancel = CancelFlag::new();
    let result = match tokio::time::timeout(
        ctx.reconcile_timeout,
        run_pipeline(&app, &ctx, &workspace, &namespace, &cancel, &mut progress),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => {
            // the blocking git task outlives the dropped pipeline future
            cancel.cancel();
            workspace.wait_idle().await;
            Err(Error::timeout(
                namespace.as_str(),
                name.as_str(),
                ctx.reconcile_timeout.as_secs(),
            ))
        }
    };

    match result {
        Ok(outcome) => {
            record(&app, &ctx, &outcome).await;
            events::publish_outcome(ctx.events.as_ref(), &app, &outcome).await;
            Ok(Action::await_change())
        }
        Err(e) => {
            let outcome = SyncOutcome::Failed {
                message: format!("{} failed: {}", progress.stage.next_step(), e),
                revision: progress.revision.clone(),
            };
            record(&app, &ctx, &outcome).await;
            events::publish_outcome(ctx.events.as_ref(), &app, &outcome).await;
            Err(e)
        }
    }
}

/// Sync, split, authorize and apply
///
/// Returns `Denied` as soon as the gate stops at a denial; nothing is
/// applied in that case.
async fn run_pipeline(
    app: &MicroApplication,
    ctx: &Context,
    workspace: &Workspace,
    namespace: &str,
    cancel: &CancelFlag,
    progress: &mut Progress,
) -> Result<SyncOutcome, Error> {
    let source = SourceRef::new(app.spec.repo_url.as_str()).at_revision(app.spec.revision());

    let revision = workspace.sync(ctx.source.clone(), &source, cancel).await?;
    info!(revision = %revision, "workspace synced");
    progress.revision = Some(revision.clone());
    progress.advance(ReconcileStage::Synced);

    let resources = workspace
        .discover(vec![app.spec.source_path().to_string()])
        .await?;
    info!(resources = resources.len(), "manifests discovered");
    progress.advance(ReconcileStage::Parsed);

    let actor = app.creator(&ctx.creator_annotation);
    let authorization = ctx.gate.authorize(&actor, &resources, namespace).await?;
    progress.advance(ReconcileStage::Authorized);

    if let Some(denied) = authorization.denied() {
        warn!(actor = %actor, resource = %denied.resource, "creator not allowed, nothing applied");
        return Ok(SyncOutcome::Denied {
            revision,
            actor,
            resource: denied.resource.clone(),
        });
    }

    let summary = ctx.applier.apply(&resources, namespace).await?;
    info!(
        created = summary.created,
        unchanged = summary.unchanged,
        "resources applied"
    );
    progress.advance(ReconcileStage::Applied);

    Ok(SyncOutcome::Synced { revision, summary })
}

/// Write the outcome; a failed write is logged and does not fail the attempt
async fn record(app: &MicroApplication, ctx: &Context, outcome: &SyncOutcome) {
    match ctx.recorder.record(app, outcome).await {
        Ok(_) => debug!(stage = %ReconcileStage::Recorded, phase = %outcome.phase(), "status recorded"),
        Err(e) => warn!(error = %e, "failed to record status"),
    }
}

/// Error policy for the controller
///
/// Transient failures retry quickly. Failures that need a new commit or a
/// spec change retry slowly so a fixed repository is eventually picked up.
pub fn error_policy(app: Arc<MicroApplication>, error: &Error, _ctx: Arc<Context>) -> Action {
    let retryable = error.is_retryable();
    error!(
        ?error,
        namespace = %app.namespace().unwrap_or_default(),
        name = %app.name_any(),
        retryable,
        "reconciliation failed"
    );

    if retryable {
        Action::requeue(RETRY_DELAY)
    } else {
        Action::requeue(SLOW_RETRY_DELAY)
    }
}
