//! Kind to API resource table
//!
//! Authorization reviews and dynamic API calls need the plural resource name
//! and the scope of a kind. The table is an explicit collaborator: a kind it
//! does not know is an [`Error::UnknownResourceKind`], never a guessed plural.

use std::collections::HashMap;

#[cfg(test)]
use mockall::automock;

use kube::discovery::{ApiResource, Discovery, Scope};
use kube::Client;
use tracing::debug;

use crate::manifest::parse_api_version;
use crate::Error;

/// A kind resolved to its API resource
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedKind {
    /// API group (empty for core)
    pub group: String,
    /// API version
    pub version: String,
    /// Kind
    pub kind: String,
    /// Plural resource name used in API paths and access reviews
    pub plural: String,
    /// Whether resources of this kind live in a namespace
    pub namespaced: bool,
}

impl ResolvedKind {
    /// kube-rs resource descriptor for dynamic API calls
    pub fn api_resource(&self) -> ApiResource {
        let api_version = if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        };
        ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version,
            kind: self.kind.clone(),
            plural: self.plural.clone(),
        }
    }

    /// Namespace a resource of this kind is created in
    ///
    /// Cluster-scoped kinds get no namespace regardless of the manifest.
    pub fn scoped_namespace(&self, own: Option<&str>, default_ns: &str) -> Option<String> {
        if self.namespaced {
            Some(own.unwrap_or(default_ns).to_string())
        } else {
            None
        }
    }
}

/// Resolves `(apiVersion, kind)` to an API resource
#[cfg_attr(test, automock)]
pub trait KindResolver: Send + Sync {
    /// Resolve a manifest's kind, failing with `UnknownResourceKind` when unmapped
    fn resolve(&self, api_version: &str, kind: &str) -> Result<ResolvedKind, Error>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct KindEntry {
    plural: String,
    namespaced: bool,
}

/// Well-known kinds: (group, kind, plural, namespaced)
const BUILTIN_KINDS: &[(&str, &str, &str, bool)] = &[
    // core
    ("", "ConfigMap", "configmaps", true),
    ("", "Endpoints", "endpoints", true),
    ("", "LimitRange", "limitranges", true),
    ("", "Namespace", "namespaces", false),
    ("", "PersistentVolume", "persistentvolumes", false),
    ("", "PersistentVolumeClaim", "persistentvolumeclaims", true),
    ("", "Pod", "pods", true),
    ("", "ResourceQuota", "resourcequotas", true),
    ("", "Secret", "secrets", true),
    ("", "Service", "services", true),
    ("", "ServiceAccount", "serviceaccounts", true),
    // apps
    ("apps", "DaemonSet", "daemonsets", true),
    ("apps", "Deployment", "deployments", true),
    ("apps", "ReplicaSet", "replicasets", true),
    ("apps", "StatefulSet", "statefulsets", true),
    // batch
    ("batch", "CronJob", "cronjobs", true),
    ("batch", "Job", "jobs", true),
    // autoscaling / policy
    ("autoscaling", "HorizontalPodAutoscaler", "horizontalpodautoscalers", true),
    ("policy", "PodDisruptionBudget", "poddisruptionbudgets", true),
    // networking
    ("networking.k8s.io", "Ingress", "ingresses", true),
    ("networking.k8s.io", "IngressClass", "ingressclasses", false),
    ("networking.k8s.io", "NetworkPolicy", "networkpolicies", true),
    // rbac
    ("rbac.authorization.k8s.io", "ClusterRole", "clusterroles", false),
    ("rbac.authorization.k8s.io", "ClusterRoleBinding", "clusterrolebindings", false),
    ("rbac.authorization.k8s.io", "Role", "roles", true),
    ("rbac.authorization.k8s.io", "RoleBinding", "rolebindings", true),
    // storage / scheduling / coordination / discovery
    ("storage.k8s.io", "StorageClass", "storageclasses", false),
    ("scheduling.k8s.io", "PriorityClass", "priorityclasses", false),
    ("coordination.k8s.io", "Lease", "leases", true),
    ("discovery.k8s.io", "EndpointSlice", "endpointslices", true),
    // cluster extension points
    ("apiextensions.k8s.io", "CustomResourceDefinition", "customresourcedefinitions", false),
    ("admissionregistration.k8s.io", "MutatingWebhookConfiguration", "mutatingwebhookconfigurations", false),
    ("admissionregistration.k8s.io", "ValidatingWebhookConfiguration", "validatingwebhookconfigurations", false),
    // OpenShift
    ("route.openshift.io", "Route", "routes", true),
    // ours
    ("argoproj.io", "MicroApplication", "microapplications", true),
];

/// In-memory kind table keyed by `(group, kind)`
///
/// Versions are not part of the key: the version from the manifest is used
/// as-is.
#[derive(Clone, Debug, Default)]
pub struct KindTable {
    entries: HashMap<(String, String), KindEntry>,
}

impl KindTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Table seeded with the well-known built-in kinds
    pub fn with_builtin_kinds() -> Self {
        let mut table = Self::new();
        for (group, kind, plural, namespaced) in BUILTIN_KINDS {
            table.insert(*group, *kind, *plural, *namespaced);
        }
        table
    }

    /// Add or replace a mapping
    pub fn insert(
        &mut self,
        group: impl Into<String>,
        kind: impl Into<String>,
        plural: impl Into<String>,
        namespaced: bool,
    ) {
        self.entries.insert(
            (group.into(), kind.into()),
            KindEntry {
                plural: plural.into(),
                namespaced,
            },
        );
    }

    /// Add a mapping and return self for chaining
    pub fn with_kind(
        mut self,
        group: impl Into<String>,
        kind: impl Into<String>,
        plural: impl Into<String>,
        namespaced: bool,
    ) -> Self {
        self.insert(group, kind, plural, namespaced);
        self
    }

    /// Number of mapped kinds
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no mappings
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Add an entry written as `Kind[.group]=plural[:cluster]`
    ///
    /// `Widget.example.com=widgets` maps a namespaced kind;
    /// `Tenant.example.com=tenants:cluster` maps a cluster-scoped one.
    pub fn parse_entry(&mut self, entry: &str) -> Result<(), Error> {
        let (lhs, rhs) = entry.split_once('=').ok_or_else(|| {
            Error::validation(format!(
                "kind mapping '{}' must look like Kind.group=plural",
                entry
            ))
        })?;
        let (kind, group) = match lhs.trim().split_once('.') {
            Some((kind, group)) => (kind, group),
            None => (lhs.trim(), ""),
        };
        let (plural, namespaced) = match rhs.trim().split_once(':') {
            Some((plural, "cluster")) => (plural, false),
            Some((plural, "namespaced")) => (plural, true),
            Some((_, scope)) => {
                return Err(Error::validation(format!(
                    "kind mapping '{}' has unknown scope '{}'",
                    entry, scope
                )))
            }
            None => (rhs.trim(), true),
        };
        if kind.is_empty() || plural.is_empty() {
            return Err(Error::validation(format!(
                "kind mapping '{}' must name both a kind and a plural",
                entry
            )));
        }
        self.insert(group, kind, plural, namespaced);
        Ok(())
    }

    /// Add every kind the API server advertises
    ///
    /// Discovered entries take precedence over built-in ones.
    pub async fn extend_from_discovery(&mut self, client: Client) -> Result<(), Error> {
        let discovery = Discovery::new(client).run().await?;
        let mut added = 0usize;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                self.insert(
                    ar.group.clone(),
                    ar.kind.clone(),
                    ar.plural.clone(),
                    caps.scope == Scope::Namespaced,
                );
                added += 1;
            }
        }
        debug!(kinds = added, "Seeded kind table from API discovery");
        Ok(())
    }
}

impl KindResolver for KindTable {
    fn resolve(&self, api_version: &str, kind: &str) -> Result<ResolvedKind, Error> {
        let (group, version) = parse_api_version(api_version);
        if version.is_empty() {
            return Err(Error::unknown_kind(api_version, kind));
        }
        let entry = self
            .entries
            .get(&(group.to_string(), kind.to_string()))
            .ok_or_else(|| Error::unknown_kind(api_version, kind))?;
        Ok(ResolvedKind {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: entry.plural.clone(),
            namespaced: entry.namespaced,
        })
    }
}
