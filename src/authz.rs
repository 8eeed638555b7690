//! Authorization gate
//!
//! Before anything is created on the cluster, the gate asks the API server
//! whether the MicroApplication's creator may `create` each resource, using a
//! `SubjectAccessReview` per resource. Evaluation is sequential in manifest
//! order and stops at the first denial.
//!
//! Two actors skip review entirely:
//! - the empty actor, when the creator annotation is missing. This is a trust
//!   fallback for clusters without the admission companion that stamps the
//!   annotation; it is not a security boundary.
//! - the superuser sentinel (`kube:admin` by default), which is not a real
//!   user and would be denied by every review.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::{
    ResourceAttributes, SubjectAccessReview, SubjectAccessReviewSpec,
};
use kube::api::{Api, PostParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info, warn};

use crate::kinds::KindResolver;
use crate::manifest::ResourceDescriptor;
use crate::Error;

/// The verb every review asks about
pub const CREATE_VERB: &str = "create";

/// One access question: may `user` perform `verb` on this resource?
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessRequest {
    /// Actor the review is evaluated for
    pub user: String,
    /// Verb (always `create` for the gate)
    pub verb: String,
    /// API group (empty for core)
    pub group: String,
    /// API version
    pub version: String,
    /// Plural resource name
    pub resource: String,
    /// Target namespace, `None` for cluster-scoped resources
    pub namespace: Option<String>,
    /// Resource name
    pub name: String,
}

impl AccessRequest {
    /// Short form used in logs and errors
    pub fn describe(&self) -> String {
        let resource = if self.group.is_empty() {
            self.resource.clone()
        } else {
            format!("{}.{}", self.resource, self.group)
        };
        match &self.namespace {
            Some(ns) => format!("{} {} {}/{}", self.verb, resource, ns, self.name),
            None => format!("{} {} {}", self.verb, resource, self.name),
        }
    }
}

/// Backend that answers access questions
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AccessReviewer: Send + Sync {
    /// Whether the request is allowed
    ///
    /// An error means the backend could not evaluate the request, never that
    /// the request was denied.
    async fn review(&self, request: &AccessRequest) -> Result<bool, Error>;
}

/// [`AccessReviewer`] backed by `SubjectAccessReview`
pub struct SubjectAccessReviewer {
    client: Client,
}

impl SubjectAccessReviewer {
    /// Create a reviewer using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl AccessReviewer for SubjectAccessReviewer {
    async fn review(&self, request: &AccessRequest) -> Result<bool, Error> {
        let api: Api<SubjectAccessReview> = Api::all(self.client.clone());
        let review = SubjectAccessReview {
            spec: SubjectAccessReviewSpec {
                user: Some(request.user.clone()),
                resource_attributes: Some(ResourceAttributes {
                    group: Some(request.group.clone()),
                    version: Some(request.version.clone()),
                    resource: Some(request.resource.clone()),
                    namespace: request.namespace.clone(),
                    name: Some(request.name.clone()).filter(|n| !n.is_empty()),
                    verb: Some(request.verb.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        let created = api
            .create(&PostParams::default(), &review)
            .await
            .map_err(|e| Error::auth_backend(request.describe(), e.to_string()))?;

        let status = created.status.ok_or_else(|| {
            Error::auth_backend(request.describe(), "review returned without a status")
        })?;

        if let Some(eval_err) = status.evaluation_error.as_deref().filter(|e| !e.is_empty()) {
            warn!(
                request = %request.describe(),
                error = %eval_err,
                "Authorizer reported an evaluation error"
            );
        }
        debug!(
            request = %request.describe(),
            allowed = status.allowed,
            reason = status.reason.as_deref().unwrap_or_default(),
            "Access review evaluated"
        );

        Ok(status.allowed)
    }
}

/// Verdict for one resource
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthorizationVerdict {
    /// Position of the resource in the batch
    pub index: usize,
    /// The resource (Kind/namespace/name)
    pub resource: String,
    /// Whether creation is allowed
    pub allowed: bool,
}

/// Result of running the gate over a batch
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthorizationOutcome {
    /// No actor recorded on the application; the batch is trusted
    Unattributed,
    /// The actor is the superuser sentinel
    Superuser,
    /// Reviewed resource by resource; ends at the first denial
    Reviewed(Vec<AuthorizationVerdict>),
}

impl AuthorizationOutcome {
    /// Whether every resource in the batch may be created
    pub fn allowed(&self) -> bool {
        self.denied().is_none()
    }

    /// The verdict that stopped evaluation, if any
    pub fn denied(&self) -> Option<&AuthorizationVerdict> {
        match self {
            Self::Reviewed(verdicts) => verdicts.iter().find(|v| !v.allowed),
            _ => None,
        }
    }

    /// Verdicts computed (empty when review was skipped)
    pub fn verdicts(&self) -> &[AuthorizationVerdict] {
        match self {
            Self::Reviewed(verdicts) => verdicts,
            _ => &[],
        }
    }
}

/// Runs access reviews for a batch of resources on behalf of an actor
pub struct AuthorizationGate {
    reviewer: Arc<dyn AccessReviewer>,
    kinds: Arc<dyn KindResolver>,
    superuser: String,
}

impl AuthorizationGate {
    /// Create a gate
    pub fn new(
        reviewer: Arc<dyn AccessReviewer>,
        kinds: Arc<dyn KindResolver>,
        superuser: impl Into<String>,
    ) -> Self {
        Self {
            reviewer,
            kinds,
            superuser: superuser.into(),
        }
    }

    /// Decide whether `actor` may create every resource in `resources`
    ///
    /// Resources without a namespace are checked in `default_ns`. The first
    /// denial ends evaluation: resources after it are not reviewed.
    pub async fn authorize(
        &self,
        actor: &str,
        resources: &[ResourceDescriptor],
        default_ns: &str,
    ) -> Result<AuthorizationOutcome, Error> {
        if actor.is_empty() {
            info!(
                resources = resources.len(),
                "No creator recorded, trusting the batch without review"
            );
            return Ok(AuthorizationOutcome::Unattributed);
        }
        if actor == self.superuser {
            debug!(actor = %actor, resources = resources.len(), "Superuser, skipping review");
            return Ok(AuthorizationOutcome::Superuser);
        }

        let mut verdicts = Vec::with_capacity(resources.len());
        for (index, resource) in resources.iter().enumerate() {
            let kind = self.kinds.resolve(&resource.api_version, &resource.kind)?;
            let request = AccessRequest {
                user: actor.to_string(),
                verb: CREATE_VERB.to_string(),
                group: kind.group.clone(),
                version: kind.version.clone(),
                resource: kind.plural.clone(),
                namespace: kind.scoped_namespace(resource.namespace.as_deref(), default_ns),
                name: resource.name.clone(),
            };

            let allowed = self.reviewer.review(&request).await?;
            verdicts.push(AuthorizationVerdict {
                index,
                resource: resource.to_string(),
                allowed,
            });

            if !allowed {
                info!(
                    actor = %actor,
                    request = %request.describe(),
                    "Access denied, stopping evaluation"
                );
                break;
            }
        }

        Ok(AuthorizationOutcome::Reviewed(verdicts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::KindTable;
    use mockall::Sequence;
    use serde_json::json;

    fn configmap(name: &str) -> ResourceDescriptor {
        ResourceDescriptor::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name}
        }))
        .unwrap()
    }

    fn gate(reviewer: MockAccessReviewer) -> AuthorizationGate {
        AuthorizationGate::new(
            Arc::new(reviewer),
            Arc::new(KindTable::with_builtin_kinds()),
            "kube:admin",
        )
    }

    // =========================================================================
    // Gate Stories
    // =========================================================================

    /// Story: alice is denied the second of three resources
    ///
    /// The first is reviewed and allowed, the second denied, and the third is
    /// never reviewed at all.
    #[tokio::test]
    async fn story_first_denial_stops_evaluation() {
        let mut reviewer = MockAccessReviewer::new();
        let mut seq = Sequence::new();
        reviewer
            .expect_review()
            .withf(|r| r.name == "one")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(true));
        reviewer
            .expect_review()
            .withf(|r| r.name == "two")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(false));
        reviewer
            .expect_review()
            .withf(|r| r.name == "three")
            .never();

        let resources = vec![configmap("one"), configmap("two"), configmap("three")];
        let outcome = gate(reviewer)
            .authorize("alice", &resources, "team-a")
            .await
            .unwrap();

        assert!(!outcome.allowed());
        assert_eq!(outcome.verdicts().len(), 2);
        let denied = outcome.denied().unwrap();
        assert_eq!(denied.index, 1);
        assert_eq!(denied.resource, "ConfigMap/two");
    }

    /// Story: An application without a recorded creator is trusted wholesale
    #[tokio::test]
    async fn story_empty_actor_skips_review() {
        let mut reviewer = MockAccessReviewer::new();
        reviewer.expect_review().never();

        let outcome = gate(reviewer)
            .authorize("", &[configmap("a"), configmap("b")], "team-a")
            .await
            .unwrap();
        assert_eq!(outcome, AuthorizationOutcome::Unattributed);
        assert!(outcome.allowed());
    }

    /// Story: A blank creator annotation is a creator like any other
    #[tokio::test]
    async fn story_blank_actor_is_reviewed() {
        let mut reviewer = MockAccessReviewer::new();
        reviewer
            .expect_review()
            .withf(|r| r.user == " ")
            .times(1)
            .returning(|_| Ok(false));

        let outcome = gate(reviewer)
            .authorize(" ", &[configmap("a"), configmap("b")], "team-a")
            .await
            .unwrap();
        assert!(!outcome.allowed());
    }

    /// Story: kube:admin is allowed without asking the API server
    #[tokio::test]
    async fn story_superuser_skips_review() {
        let mut reviewer = MockAccessReviewer::new();
        reviewer.expect_review().never();

        let outcome = gate(reviewer)
            .authorize("kube:admin", &[configmap("a")], "team-a")
            .await
            .unwrap();
        assert_eq!(outcome, AuthorizationOutcome::Superuser);
        assert!(outcome.allowed());
    }

    /// Story: A backend failure is an error, not a denial
    #[tokio::test]
    async fn story_backend_failure_is_not_a_denial() {
        let mut reviewer = MockAccessReviewer::new();
        reviewer
            .expect_review()
            .returning(|r| Err(Error::auth_backend(r.describe(), "connection refused")));

        let err = gate(reviewer)
            .authorize("alice", &[configmap("a")], "team-a")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthBackendFailed { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn review_targets_default_namespace_and_plural() {
        let mut reviewer = MockAccessReviewer::new();
        reviewer
            .expect_review()
            .withf(|r| {
                r.user == "alice"
                    && r.verb == "create"
                    && r.group.is_empty()
                    && r.version == "v1"
                    && r.resource == "configmaps"
                    && r.namespace.as_deref() == Some("team-a")
                    && r.name == "settings"
            })
            .times(1)
            .returning(|_| Ok(true));

        let outcome = gate(reviewer)
            .authorize("alice", &[configmap("settings")], "team-a")
            .await
            .unwrap();
        assert!(outcome.allowed());
        assert_eq!(outcome.verdicts().len(), 1);
    }

    #[tokio::test]
    async fn cluster_scoped_review_has_no_namespace() {
        let mut reviewer = MockAccessReviewer::new();
        reviewer
            .expect_review()
            .withf(|r| r.resource == "namespaces" && r.namespace.is_none())
            .times(1)
            .returning(|_| Ok(true));

        let ns = ResourceDescriptor::from_value(json!({
            "apiVersion": "v1", "kind": "Namespace", "metadata": {"name": "extra"}
        }))
        .unwrap();
        gate(reviewer).authorize("alice", &[ns], "team-a").await.unwrap();
    }

    #[tokio::test]
    async fn unknown_kind_aborts_review() {
        let mut reviewer = MockAccessReviewer::new();
        reviewer.expect_review().never();

        let widget = ResourceDescriptor::from_value(json!({
            "apiVersion": "example.com/v1", "kind": "Widget", "metadata": {"name": "w"}
        }))
        .unwrap();
        let err = gate(reviewer)
            .authorize("alice", &[widget], "team-a")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownResourceKind { .. }));
    }

    #[test]
    fn access_request_description() {
        let r = AccessRequest {
            user: "alice".into(),
            verb: "create".into(),
            group: "apps".into(),
            version: "v1".into(),
            resource: "deployments".into(),
            namespace: Some("team-a".into()),
            name: "web".into(),
        };
        assert_eq!(r.describe(), "create deployments.apps team-a/web");
    }
}
