//! Status recorder for MicroApplication
//!
//! Every reconciliation ends with exactly one status write, whatever happened
//! before it. The write is a single merge patch on the status subresource, so
//! it never re-triggers reconciliation and is never half-applied.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::apply::ApplySummary;
use crate::crd::{MicroApplication, MicroApplicationStatus, SyncPhase};
use crate::Error;

/// Persists MicroApplication status
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusWriter: Send + Sync {
    /// Merge `status` into the application's status subresource
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MicroApplicationStatus,
    ) -> Result<(), Error>;
}

/// [`StatusWriter`] using the Kubernetes API
pub struct KubeStatusWriter {
    client: Client,
    field_manager: String,
}

impl KubeStatusWriter {
    /// Create a writer using the given client and field manager
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &MicroApplicationStatus,
    ) -> Result<(), Error> {
        let api: Api<MicroApplication> = Api::namespaced(self.client.clone(), namespace);

        let status_patch = serde_json::json!({
            "status": status
        });

        api.patch_status(
            name,
            &PatchParams {
                field_manager: Some(self.field_manager.clone()),
                ..Default::default()
            },
            &Patch::Merge(&status_patch),
        )
        .await
        .map_err(|e| Error::status_write_failed(namespace, name, e.to_string()))?;

        Ok(())
    }
}

/// How a reconciliation attempt ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Every resource was authorized and now exists
    Synced {
        /// Commit the workspace was synced to
        revision: String,
        /// What the applier did
        summary: ApplySummary,
    },
    /// The creator may not create a resource in the batch
    Denied {
        /// Commit the workspace was synced to
        revision: String,
        /// Actor the review was evaluated for
        actor: String,
        /// First resource that was denied
        resource: String,
    },
    /// A stage failed before the pipeline completed
    Failed {
        /// What went wrong, including the stage
        message: String,
        /// Commit the workspace was at, if the sync got that far
        revision: Option<String>,
    },
}

impl SyncOutcome {
    /// Phase recorded for this outcome
    pub fn phase(&self) -> SyncPhase {
        match self {
            Self::Synced { .. } => SyncPhase::Synced,
            Self::Denied { .. } => SyncPhase::Denied,
            Self::Failed { .. } => SyncPhase::Failed,
        }
    }

    /// Human-readable status message
    pub fn message(&self) -> String {
        match self {
            Self::Synced { revision, summary } => format!(
                "synced {}: {} created, {} already present",
                short_revision(revision),
                summary.created,
                summary.unchanged
            ),
            Self::Denied {
                actor, resource, ..
            } => format!("{} is not allowed to create {}", actor, resource),
            Self::Failed { message, .. } => message.clone(),
        }
    }

    /// Status to write for this outcome at `now`
    ///
    /// A failed attempt does not decide authorization, so it leaves `allowed`
    /// and `observedGeneration` as they were. It clears `appliedResources`,
    /// and `revision` too when the sync itself failed.
    pub fn to_status(&self, generation: Option<i64>, now: &str) -> MicroApplicationStatus {
        let mut status = MicroApplicationStatus::with_phase(self.phase())
            .message(self.message())
            .last_sync_time(now);

        match self {
            Self::Synced { revision, summary } => {
                status = status
                    .allowed(true)
                    .revision(revision.as_str())
                    .applied_resources(summary.created);
            }
            Self::Denied { revision, .. } => {
                status = status
                    .allowed(false)
                    .revision(revision.as_str())
                    .applied_resources(0);
            }
            Self::Failed { revision, .. } => {
                if let Some(rev) = revision {
                    status = status.revision(rev.as_str());
                }
                return status;
            }
        }

        match generation {
            Some(g) => status.observed_generation(g),
            None => status,
        }
    }
}

fn short_revision(revision: &str) -> &str {
    revision.get(..12).unwrap_or(revision)
}

/// Writes the outcome of a reconciliation to the application's status
pub struct StatusRecorder {
    writer: Arc<dyn StatusWriter>,
}

impl StatusRecorder {
    /// Create a recorder
    pub fn new(writer: Arc<dyn StatusWriter>) -> Self {
        Self { writer }
    }

    /// Record `outcome` on `app`, stamping the current time
    pub async fn record(
        &self,
        app: &MicroApplication,
        outcome: &SyncOutcome,
    ) -> Result<MicroApplicationStatus, Error> {
        let namespace = app.namespace().unwrap_or_default();
        let name = app.name_any();
        let now = chrono::Utc::now().to_rfc3339();
        let status = outcome.to_status(app.metadata.generation, &now);

        self.writer.patch_status(&namespace, &name, &status).await?;
        debug!(
            namespace = %namespace,
            name = %name,
            phase = %outcome.phase(),
            "Recorded status"
        );
        Ok(status)
    }
}
