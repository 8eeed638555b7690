//! Create-if-absent resource applier
//!
//! Resources are handled strictly in batch order. A resource that already
//! exists is left exactly as it is; there is no update or merge. The first
//! failure aborts the rest of the batch, so a failed apply can leave the
//! earlier resources created and the later ones missing.

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, PostParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use serde_json::Value;
use tracing::{debug, info};

use crate::kinds::{KindResolver, ResolvedKind};
use crate::manifest::ResourceDescriptor;
use crate::Error;

/// A concrete object on the cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceTarget {
    /// Resolved kind
    pub kind: ResolvedKind,
    /// Object name
    pub name: String,
    /// Namespace, `None` for cluster-scoped kinds
    pub namespace: Option<String>,
}

impl ResourceTarget {
    fn apply_error(&self, msg: impl Into<String>) -> Error {
        Error::apply_failed(
            self.kind.kind.clone(),
            self.name.clone(),
            self.namespace.clone().unwrap_or_default(),
            msg,
        )
    }
}

impl std::fmt::Display for ResourceTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind.kind, self.name),
        }
    }
}

/// Existence check and creation against the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Whether an object with the target's kind/name/namespace exists
    async fn exists(&self, target: &ResourceTarget) -> Result<bool, Error>;

    /// Create the object described by `body`
    async fn create(&self, target: &ResourceTarget, body: &Value) -> Result<(), Error>;
}

/// [`ResourceStore`] over the dynamic Kubernetes API
pub struct KubeResourceStore {
    client: Client,
    field_manager: String,
}

impl KubeResourceStore {
    /// Create a store that writes with the given field manager
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn api(&self, target: &ResourceTarget) -> Api<DynamicObject> {
        let ar = target.kind.api_resource();
        match &target.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
            None => Api::all_with(self.client.clone(), &ar),
        }
    }
}

#[async_trait]
impl ResourceStore for KubeResourceStore {
    async fn exists(&self, target: &ResourceTarget) -> Result<bool, Error> {
        self.api(target)
            .get_opt(&target.name)
            .await
            .map(|obj| obj.is_some())
            .map_err(|e| target.apply_error(format!("existence check failed: {}", e)))
    }

    async fn create(&self, target: &ResourceTarget, body: &Value) -> Result<(), Error> {
        let obj: DynamicObject = serde_json::from_value(body.clone())
            .map_err(|e| target.apply_error(format!("invalid object: {}", e)))?;
        let params = PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };

        match self.api(target).create(&params, &obj).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                // created by someone else since the existence check
                debug!(resource = %target, "Resource appeared before create, leaving it");
                Ok(())
            }
            Err(e) => Err(target.apply_error(e.to_string())),
        }
    }
}

/// What an apply pass did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplySummary {
    /// Resources created by this pass
    pub created: u32,
    /// Resources that already existed and were left alone
    pub unchanged: u32,
}

/// Creates the missing resources of a batch
pub struct Applier {
    store: Arc<dyn ResourceStore>,
    kinds: Arc<dyn KindResolver>,
}

impl Applier {
    /// Create an applier
    pub fn new(store: Arc<dyn ResourceStore>, kinds: Arc<dyn KindResolver>) -> Self {
        Self { store, kinds }
    }

    /// Create every resource in `resources` that does not exist yet
    ///
    /// Namespaced resources without a namespace land in `default_ns`.
    pub async fn apply(
        &self,
        resources: &[ResourceDescriptor],
        default_ns: &str,
    ) -> Result<ApplySummary, Error> {
        let mut summary = ApplySummary::default();

        for resource in resources {
            let kind = self.kinds.resolve(&resource.api_version, &resource.kind)?;
            let namespace = kind.scoped_namespace(resource.namespace.as_deref(), default_ns);
            let target = ResourceTarget {
                kind,
                name: resource.name.clone(),
                namespace,
            };

            if target.name.is_empty() {
                return Err(target.apply_error("metadata.name is required"));
            }

            if self.store.exists(&target).await? {
                debug!(resource = %target, "Resource exists, leaving untouched");
                summary.unchanged += 1;
                continue;
            }

            let body = target_body(resource, &target);
            self.store.create(&target, &body).await?;
            info!(resource = %target, "Created resource");
            summary.created += 1;
        }

        Ok(summary)
    }
}

/// Manifest body with the namespace the object is created in
fn target_body(resource: &ResourceDescriptor, target: &ResourceTarget) -> Value {
    match &target.namespace {
        Some(ns) => resource.body_in_namespace(ns),
        None => {
            let mut body = resource.body.clone();
            if let Some(meta) = body.get_mut("metadata").and_then(Value::as_object_mut) {
                meta.remove("namespace");
            }
            body
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kinds::KindTable;
    use serde_json::json;

    fn resource(kind: &str, name: &str) -> ResourceDescriptor {
        ResourceDescriptor::from_value(json!({
            "apiVersion": "v1",
            "kind": kind,
            "metadata": {"name": name},
            "data": {"k": "v"}
        }))
        .unwrap()
    }

    fn applier(store: MockResourceStore) -> Applier {
        Applier::new(Arc::new(store), Arc::new(KindTable::with_builtin_kinds()))
    }

    // =========================================================================
    // Apply Stories
    // =========================================================================

    /// Story: Existing resources are never recreated or modified
    #[tokio::test]
    async fn story_existing_resources_are_left_alone() {
        let mut store = MockResourceStore::new();
        store
            .expect_exists()
            .returning(|t| Ok(t.name == "existing"));
        store
            .expect_create()
            .withf(|t, _| t.name == "existing")
            .never();
        store
            .expect_create()
            .withf(|t, _| t.name != "existing")
            .times(2)
            .returning(|_, _| Ok(()));

        let summary = applier(store)
            .apply(
                &[
                    resource("ConfigMap", "first"),
                    resource("ConfigMap", "existing"),
                    resource("Secret", "third"),
                ],
                "team-a",
            )
            .await
            .unwrap();

        assert_eq!(
            summary,
            ApplySummary {
                created: 2,
                unchanged: 1
            }
        );
    }

    /// Story: Resources without a namespace are created in the application's
    #[tokio::test]
    async fn story_namespace_defaults_to_application_namespace() {
        let mut store = MockResourceStore::new();
        store.expect_exists().returning(|_| Ok(false));
        store
            .expect_create()
            .withf(|t, body| {
                t.namespace.as_deref() == Some("team-a")
                    && body["metadata"]["namespace"] == "team-a"
                    && body["data"]["k"] == "v"
            })
            .times(1)
            .returning(|_, _| Ok(()));

        applier(store)
            .apply(&[resource("ConfigMap", "settings")], "team-a")
            .await
            .unwrap();
    }

    /// Story: A failed create stops the batch
    #[tokio::test]
    async fn story_create_failure_aborts_remaining_batch() {
        let mut store = MockResourceStore::new();
        store.expect_exists().returning(|_| Ok(false));
        store
            .expect_create()
            .withf(|t, _| t.name == "a")
            .times(1)
            .returning(|_, _| Ok(()));
        store
            .expect_create()
            .withf(|t, _| t.name == "b")
            .times(1)
            .returning(|t, _| Err(t.apply_error("forbidden")));
        store.expect_create().withf(|t, _| t.name == "c").never();

        let err = applier(store)
            .apply(
                &[
                    resource("ConfigMap", "a"),
                    resource("ConfigMap", "b"),
                    resource("ConfigMap", "c"),
                ],
                "team-a",
            )
            .await
            .unwrap_err();

        match err {
            Error::ApplyFailed {
                kind,
                name,
                namespace,
                ..
            } => {
                assert_eq!(kind, "ConfigMap");
                assert_eq!(name, "b");
                assert_eq!(namespace, "team-a");
            }
            other => panic!("expected ApplyFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pinned_namespace_is_kept() {
        let mut store = MockResourceStore::new();
        store
            .expect_exists()
            .withf(|t| t.namespace.as_deref() == Some("shared"))
            .returning(|_| Ok(false));
        store.expect_create().times(1).returning(|_, _| Ok(()));

        let pinned = ResourceDescriptor::from_value(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "x", "namespace": "shared"}
        }))
        .unwrap();
        applier(store).apply(&[pinned], "team-a").await.unwrap();
    }

    #[tokio::test]
    async fn cluster_scoped_resource_is_created_without_namespace() {
        let mut store = MockResourceStore::new();
        store
            .expect_exists()
            .withf(|t| t.namespace.is_none())
            .returning(|_| Ok(false));
        store
            .expect_create()
            .withf(|t, body| t.namespace.is_none() && body["metadata"].get("namespace").is_none())
            .times(1)
            .returning(|_, _| Ok(()));

        let ns = ResourceDescriptor::from_value(json!({
            "apiVersion": "v1", "kind": "Namespace",
            "metadata": {"name": "extra", "namespace": "ignored"}
        }))
        .unwrap();
        applier(store).apply(&[ns], "team-a").await.unwrap();
    }

    #[tokio::test]
    async fn nameless_resource_is_rejected() {
        let mut store = MockResourceStore::new();
        store.expect_exists().never();
        store.expect_create().never();

        let nameless = ResourceDescriptor::from_value(json!({
            "apiVersion": "v1", "kind": "ConfigMap"
        }))
        .unwrap();
        let err = applier(store).apply(&[nameless], "team-a").await.unwrap_err();
        assert!(err.to_string().contains("metadata.name"));
    }

    #[tokio::test]
    async fn existence_check_failure_is_reported() {
        let mut store = MockResourceStore::new();
        store
            .expect_exists()
            .returning(|t| Err(t.apply_error("existence check failed: timeout")));
        store.expect_create().never();

        let err = applier(store)
            .apply(&[resource("ConfigMap", "a")], "team-a")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ApplyFailed { .. }));
    }
}
