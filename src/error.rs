//! Error types for the MicroApplication operator
//!
//! Errors are structured with fields to aid debugging in production. Each
//! pipeline stage has its own variant so the reconcile loop can tell a
//! transient backend failure apart from a broken manifest.
//!
//! An authorization denial is not an error: it is a normal outcome recorded in
//! the MicroApplication status (see [`crate::authz::AuthorizationOutcome`]).

use thiserror::Error;

/// Main error type for MicroApplication operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error outside the pipeline stages (CRD install, discovery)
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Cloning or pulling the source repository failed
    #[error("sync of {url} into {workspace} failed: {message}")]
    SyncFailed {
        /// Repository URL
        url: String,
        /// Workspace directory
        workspace: String,
        /// Description of what failed
        message: String,
    },

    /// Walking or reading the workspace failed
    #[error("manifest discovery failed at {path}: {message}")]
    DiscoveryFailed {
        /// File or directory that could not be read
        path: String,
        /// Description of what failed
        message: String,
    },

    /// A manifest file could not be decoded
    #[error("failed to parse manifest {path}: {message}")]
    ParseFailed {
        /// File containing the malformed document
        path: String,
        /// Description of what failed
        message: String,
    },

    /// No kind table entry for a manifest's group/kind
    #[error("unknown resource kind {kind} (apiVersion {api_version})")]
    UnknownResourceKind {
        /// apiVersion from the manifest
        api_version: String,
        /// kind from the manifest
        kind: String,
    },

    /// The authorization backend could not evaluate a review
    #[error("authorization backend failed for {resource}: {message}")]
    AuthBackendFailed {
        /// Resource being reviewed (Kind/namespace/name)
        resource: String,
        /// Description of what failed
        message: String,
    },

    /// Checking for or creating a resource failed
    #[error("failed to apply {kind} {namespace}/{name}: {message}")]
    ApplyFailed {
        /// Resource kind
        kind: String,
        /// Resource name
        name: String,
        /// Target namespace (empty for cluster-scoped resources)
        namespace: String,
        /// Description of what failed
        message: String,
    },

    /// Persisting the MicroApplication status failed
    #[error("failed to write status for {namespace}/{name}: {message}")]
    StatusWriteFailed {
        /// MicroApplication namespace
        namespace: String,
        /// MicroApplication name
        name: String,
        /// Description of what failed
        message: String,
    },

    /// Invalid MicroApplication spec or configuration
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
    },

    /// A reconciliation ran past its deadline
    #[error("reconciliation of {namespace}/{name} exceeded {seconds}s deadline")]
    Timeout {
        /// MicroApplication namespace
        namespace: String,
        /// MicroApplication name
        name: String,
        /// Deadline in seconds
        seconds: u64,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g. "workspace", "controller")
        context: String,
    },
}

impl Error {
    /// Create a sync error for a repository and workspace
    pub fn sync_failed(
        url: impl Into<String>,
        workspace: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::SyncFailed {
            url: url.into(),
            workspace: workspace.into(),
            message: msg.into(),
        }
    }

    /// Create a discovery error for a path
    pub fn discovery_failed(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::DiscoveryFailed {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create a parse error for a manifest file
    pub fn parse_failed(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ParseFailed {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Create an unknown-kind error
    pub fn unknown_kind(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::UnknownResourceKind {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }

    /// Create an authorization backend error
    pub fn auth_backend(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::AuthBackendFailed {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Create an apply error with resource context
    pub fn apply_failed(
        kind: impl Into<String>,
        name: impl Into<String>,
        namespace: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::ApplyFailed {
            kind: kind.into(),
            name: name.into(),
            namespace: namespace.into(),
            message: msg.into(),
        }
    }

    /// Create a status write error
    pub fn status_write_failed(
        namespace: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::StatusWriteFailed {
            namespace: namespace.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a deadline error
    pub fn timeout(namespace: impl Into<String>, name: impl Into<String>, seconds: u64) -> Self {
        Self::Timeout {
            namespace: namespace.into(),
            name: name.into(),
            seconds,
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Network-bound stages (sync, authorization backend, apply, status) may
    /// recover on their own. Broken manifests, unknown kinds and invalid specs
    /// need a new commit or a spec change.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::SyncFailed { .. } => true,
            Error::DiscoveryFailed { .. } => true,
            Error::ParseFailed { .. } => false,
            Error::UnknownResourceKind { .. } => false,
            Error::AuthBackendFailed { .. } => true,
            Error::ApplyFailed { .. } => true,
            Error::StatusWriteFailed { .. } => true,
            Error::Validation { .. } => false,
            Error::Timeout { .. } => true,
            Error::Internal { .. } => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Error Propagation Through the Sync Pipeline
    // ==========================================================================

    /// Story: A repository that cannot be reached names the URL and workspace
    #[test]
    fn story_sync_errors_name_repository_and_workspace() {
        let err = Error::sync_failed(
            "https://git.example.com/team/app",
            "/tmp/team/app",
            "failed to resolve address",
        );
        let msg = err.to_string();
        assert!(msg.contains("https://git.example.com/team/app"));
        assert!(msg.contains("/tmp/team/app"));
        assert!(msg.contains("failed to resolve address"));
        assert!(err.is_retryable());
    }

    /// Story: A malformed manifest needs a new commit, not a retry
    #[test]
    fn story_parse_errors_are_not_retryable() {
        let err = Error::parse_failed("deploy/app.yaml", "did not find expected key");
        assert!(err.to_string().contains("deploy/app.yaml"));
        assert!(!err.is_retryable());
    }

    /// Story: Apply errors carry kind, name and namespace
    #[test]
    fn story_apply_errors_are_actionable() {
        let err = Error::apply_failed("Deployment", "web", "team-a", "admission webhook denied");
        let msg = err.to_string();
        assert!(msg.contains("Deployment"));
        assert!(msg.contains("team-a/web"));
        assert!(msg.contains("admission webhook denied"));

        match err {
            Error::ApplyFailed {
                kind,
                name,
                namespace,
                ..
            } => {
                assert_eq!(kind, "Deployment");
                assert_eq!(name, "web");
                assert_eq!(namespace, "team-a");
            }
            _ => panic!("Expected ApplyFailed variant"),
        }
    }

    /// Story: An unreachable authorization backend is transient
    #[test]
    fn story_auth_backend_failures_are_retryable() {
        let err = Error::auth_backend("ConfigMap/team-a/settings", "connection refused");
        assert!(err.to_string().contains("ConfigMap/team-a/settings"));
        assert!(err.is_retryable());
    }

    #[test]
    fn unknown_kind_is_not_retryable() {
        let err = Error::unknown_kind("example.com/v1", "Widget");
        assert!(err.to_string().contains("Widget"));
        assert!(err.to_string().contains("example.com/v1"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn timeout_names_application_and_deadline() {
        let err = Error::timeout("team-a", "web", 300);
        assert_eq!(
            err.to_string(),
            "reconciliation of team-a/web exceeded 300s deadline"
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn internal_error_includes_context() {
        let err = Error::internal_with_context("workspace", "task panicked");
        assert!(err.to_string().contains("[workspace]"));
        assert!(err.is_retryable());
    }

    #[test]
    fn validation_is_not_retryable() {
        assert!(!Error::validation("repoURL must not be empty").is_retryable());
    }

    #[test]
    fn status_write_errors_name_the_application() {
        let err = Error::status_write_failed("team-a", "web", "conflict");
        assert!(err.to_string().contains("team-a/web"));
    }
}
