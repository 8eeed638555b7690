//! MicroApplication Custom Resource Definition
//!
//! A MicroApplication asks the operator to keep the manifests at `path` inside
//! `repoURL` created in the application's namespace, on behalf of whoever
//! created the MicroApplication.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a MicroApplication
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "argoproj.io",
    version = "v1alpha1",
    kind = "MicroApplication",
    plural = "microapplications",
    shortname = "microapp",
    status = "MicroApplicationStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Allowed","type":"boolean","jsonPath":".status.allowed"}"#,
    printcolumn = r#"{"name":"Revision","type":"string","jsonPath":".status.revision"}"#,
    printcolumn = r#"{"name":"Last Sync","type":"string","jsonPath":".status.lastSyncTime"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MicroApplicationSpec {
    /// Git repository holding the manifests
    #[serde(rename = "repoURL")]
    pub repo_url: String,

    /// Directory or file inside the repository (repository root when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Branch, tag or commit to check out (remote default branch when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_revision: Option<String>,
}

impl MicroApplicationSpec {
    /// Validate the application specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.repo_url.trim().is_empty() {
            return Err(crate::Error::validation("repoURL must not be empty"));
        }

        if let Some(path) = &self.path {
            let p = std::path::Path::new(path);
            if p.is_absolute() {
                return Err(crate::Error::validation(format!(
                    "path '{}' must be relative to the repository root",
                    path
                )));
            }
            if p
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
            {
                return Err(crate::Error::validation(format!(
                    "path '{}' must not leave the repository",
                    path
                )));
            }
        }

        if matches!(&self.target_revision, Some(rev) if rev.trim().is_empty()) {
            return Err(crate::Error::validation(
                "targetRevision must not be blank when set",
            ));
        }

        Ok(())
    }

    /// Path inside the repository to discover manifests under
    pub fn source_path(&self) -> &str {
        match self.path.as_deref() {
            Some(p) if !p.trim().is_empty() => p,
            _ => ".",
        }
    }

    /// Revision to check out, if pinned
    pub fn revision(&self) -> Option<&str> {
        self.target_revision.as_deref()
    }
}

impl MicroApplication {
    /// The actor recorded on the application by the admission companion
    ///
    /// Returns an empty string when the annotation is absent. Any other
    /// value, whitespace included, is returned as is and gets reviewed.
    pub fn creator(&self, annotation: &str) -> String {
        self.annotations()
            .get(annotation)
            .cloned()
            .unwrap_or_default()
    }
}

/// Outcome of the last completed synchronization
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[non_exhaustive]
pub enum SyncPhase {
    /// Every resource was authorized and exists on the cluster
    Synced,
    /// The creator may not create at least one resource
    Denied,
    /// A pipeline stage failed before completion
    #[default]
    Failed,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Synced => write!(f, "Synced"),
            Self::Denied => write!(f, "Denied"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Status for a MicroApplication
///
/// Every field is optional so that a merge patch only touches what the
/// writer set. A failed attempt leaves `allowed` and `observedGeneration`
/// as they were. `revision` and `appliedResources` are always written, as
/// `null` when unset, so a failed attempt clears them instead of leaving
/// numbers from an earlier sync next to `phase: Failed`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MicroApplicationStatus {
    /// Whether the creator may create every resource in the source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<bool>,

    /// Human-readable message about the last attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// RFC 3339 time of the last status write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<String>,

    /// Outcome of the last attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<SyncPhase>,

    /// Commit the workspace was at for the last attempt, if the sync got
    /// that far
    #[serde(default)]
    pub revision: Option<String>,

    /// Number of resources the last attempt created
    #[serde(default)]
    pub applied_resources: Option<u32>,

    /// Generation of the spec the last completed attempt acted on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl MicroApplicationStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: SyncPhase) -> Self {
        Self {
            phase: Some(phase),
            ..Default::default()
        }
    }

    /// Set the allowed flag and return self for chaining
    pub fn allowed(mut self, allowed: bool) -> Self {
        self.allowed = Some(allowed);
        self
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.status = Some(msg.into());
        self
    }

    /// Set the sync time and return self for chaining
    pub fn last_sync_time(mut self, time: impl Into<String>) -> Self {
        self.last_sync_time = Some(time.into());
        self
    }

    /// Set the revision and return self for chaining
    pub fn revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    /// Set the created resource count and return self for chaining
    pub fn applied_resources(mut self, count: u32) -> Self {
        self.applied_resources = Some(count);
        self
    }

    /// Set the observed generation and return self for chaining
    pub fn observed_generation(mut self, generation: i64) -> Self {
        self.observed_generation = Some(generation);
        self
    }
}
