//! MicroApplication - GitOps reconciliation operator
//!
//! A MicroApplication names a git repository and a path inside it. The operator
//! keeps a workspace checkout of that repository per application, splits the
//! manifests it finds into individual resources, asks the API server whether
//! the application's creator may create each of them, and creates the ones
//! that are missing. The outcome lands in the MicroApplication's status.
//!
//! # Pipeline
//!
//! ```text
//! trigger -> workspace sync -> discovery/split -> authorization -> apply -> status
//! ```
//!
//! # Modules
//!
//! - [`crd`] - The MicroApplication custom resource
//! - [`manifest`] - Splitting YAML/JSON streams into resource descriptors
//! - [`source`] - Git clone/pull behind the [`source::SourceControl`] trait
//! - [`workspace`] - Per-application checkout directory and manifest discovery
//! - [`kinds`] - Kind to API resource (plural, scope) table
//! - [`authz`] - Per-resource SubjectAccessReview gate
//! - [`apply`] - Create-if-absent resource applier
//! - [`status`] - Status recorder for MicroApplication
//! - [`predicate`] - Change predicate deciding which watch events trigger a sync
//! - [`events`] - Kubernetes Event publishing
//! - [`controller`] - The reconcile loop tying the pipeline together
//! - [`admission`] - Optional admission-controller companion install
//! - [`retry`] - Exponential backoff helper
//! - [`config`] - Command-line and environment configuration
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod admission;
pub mod apply;
pub mod authz;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod events;
pub mod kinds;
pub mod manifest;
pub mod predicate;
pub mod retry;
pub mod source;
pub mod status;
pub mod workspace;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default base directory for application workspaces
///
/// Each MicroApplication gets `<root>/<namespace>/<name>`.
pub const DEFAULT_WORKSPACE_ROOT: &str = "/tmp";

/// Actor that bypasses per-resource authorization.
///
/// `kube:admin` is not a real user on the cluster, so a SubjectAccessReview
/// for it would always be denied.
pub const DEFAULT_SUPERUSER: &str = "kube:admin";

/// Annotation the admission companion sets to the requesting user
pub const CREATOR_ANNOTATION: &str = "generated-creator";

/// Field manager used for every write this controller makes
pub const FIELD_MANAGER: &str = "microapp-controller";

/// Name reported on Kubernetes Events
pub const CONTROLLER_NAME: &str = "microapp-controller";
