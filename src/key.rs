//! Identifiers used to deduplicate informers.

use kube::api::{ApiResource, Resource};
use kube_runtime::watcher;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a collection of resources in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupVersionResource {
    /// API group, empty for the core group.
    #[serde(default)]
    pub group: String,
    pub version: String,
    /// Plural resource name, e.g. `deployments`.
    pub resource: String,
}

impl GroupVersionResource {
    pub fn new(group: &str, version: &str, resource: &str) -> Self {
        GroupVersionResource {
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.to_string(),
        }
    }

    pub fn of<K: Resource<DynamicType = ()>>() -> Self {
        GroupVersionResource {
            group: K::group(&()).into_owned(),
            version: K::version(&()).into_owned(),
            resource: K::plural(&()).into_owned(),
        }
    }

    pub fn from_api_resource(res: &ApiResource) -> Self {
        GroupVersionResource {
            group: res.group.clone(),
            version: res.version.clone(),
            resource: res.plural.clone(),
        }
    }
}

impl fmt::Display for GroupVersionResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

/// Representation the informer caches objects in.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::EnumString,
    strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum InformerType {
    /// Objects of a statically known Rust type.
    #[default]
    Typed,
    /// `DynamicObject`s described by an `ApiResource`.
    Dynamic,
    /// Object metadata only.
    Metadata,
}

/// Parameters scoping what an informer watches.
///
/// Two informers for the same resource with different options are
/// distinct caches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InformerOptions {
    /// Watch a single namespace. `None` means all namespaces
    /// (or a cluster-scoped resource).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_selector: Option<String>,
    #[serde(default)]
    pub informer_type: InformerType,
}

impl InformerOptions {
    pub fn namespace(mut self, ns: &str) -> Self {
        self.namespace = Some(ns.to_string());
        self
    }

    pub fn labels(mut self, selector: &str) -> Self {
        self.label_selector = Some(selector.to_string());
        self
    }

    pub fn fields(mut self, selector: &str) -> Self {
        self.field_selector = Some(selector.to_string());
        self
    }

    pub fn informer_type(mut self, ty: InformerType) -> Self {
        self.informer_type = ty;
        self
    }

    /// Watcher configuration applying these options' selectors.
    /// Namespace is not part of it: it is a property of the `Api`.
    pub fn watcher_config(&self) -> watcher::Config {
        let mut cfg = watcher::Config::default();
        if let Some(labels) = self.label_selector.as_deref() {
            cfg = cfg.labels(labels);
        }
        if let Some(fields) = self.field_selector.as_deref() {
            cfg = cfg.fields(fields);
        }
        cfg
    }

    pub(crate) fn is_cluster_wide(&self) -> bool {
        self.namespace.is_none()
    }
}

/// Key informers are memoized by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InformerKey {
    pub resource: GroupVersionResource,
    pub options: InformerOptions,
}

impl InformerKey {
    pub fn new(resource: GroupVersionResource, options: InformerOptions) -> Self {
        InformerKey { resource, options }
    }

    /// Returns true if both keys cache the same representation of
    /// the same resource and at least one of them spans all namespaces.
    pub(crate) fn overlaps(&self, other: &InformerKey) -> bool {
        self != other
            && self.resource == other.resource
            && self.options.informer_type == other.options.informer_type
            && (self.options.is_cluster_wide() || other.options.is_cluster_wide())
    }
}

impl fmt::Display for InformerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}", self.resource, self.options.informer_type)?;
        if let Some(ns) = &self.options.namespace {
            write!(f, ", namespace={}", ns)?;
        }
        if let Some(labels) = &self.options.label_selector {
            write!(f, ", labels={}", labels)?;
        }
        if let Some(fields) = &self.options.field_selector {
            write!(f, ", fields={}", fields)?;
        }
        write!(f, ")")
    }
}
