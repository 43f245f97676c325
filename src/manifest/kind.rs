//! # Resource Kinds
//!
//! The closed set of object kinds the crate knows how to provision, watch and
//! delete. Readiness predicates and API routing match on [`ResourceKind`];
//! support for a new kind means a new variant here.

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Secret, Service};
use kube::core::{ApiResource, GroupVersionKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of a provisioned object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Pod,
    Service,
    ConfigMap,
    Secret,
    /// batch/v1 Job; scope anchors are Jobs so the cluster expires them
    Job,
    /// Any other namespaced kind, created and deleted generically
    Other(OtherKind),
}

/// Group/version/kind (plus plural) of a kind outside the core set
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OtherKind {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
}

/// Core kinds that are cluster scoped; a test scope cannot own them
const CLUSTER_SCOPED_CORE_KINDS: &[&str] = &["Namespace", "Node", "PersistentVolume"];

impl ResourceKind {
    /// Map a manifest's `apiVersion` and `kind` to a supported kind
    ///
    /// Returns `None` for empty values and for cluster scoped core kinds.
    pub fn from_type_meta(api_version: &str, kind: &str) -> Option<Self> {
        let api_version = api_version.trim();
        let kind = kind.trim();
        if api_version.is_empty() || kind.is_empty() {
            return None;
        }

        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", api_version),
        };
        if version.is_empty() || version.contains('/') {
            return None;
        }

        if group.is_empty() && version == "v1" {
            match kind {
                "Pod" => return Some(ResourceKind::Pod),
                "Service" => return Some(ResourceKind::Service),
                "ConfigMap" => return Some(ResourceKind::ConfigMap),
                "Secret" => return Some(ResourceKind::Secret),
                k if CLUSTER_SCOPED_CORE_KINDS.contains(&k) => return None,
                _ => {}
            }
        }
        if group == "batch" && version == "v1" && kind == "Job" {
            return Some(ResourceKind::Job);
        }

        let gvk = GroupVersionKind::gvk(group, version, kind);
        let resource = ApiResource::from_gvk(&gvk);
        Some(ResourceKind::Other(OtherKind {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.to_string(),
            plural: resource.plural,
        }))
    }

    /// Kind name as written in manifests
    #[must_use]
    pub fn kind_name(&self) -> &str {
        match self {
            ResourceKind::Pod => "Pod",
            ResourceKind::Service => "Service",
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::Secret => "Secret",
            ResourceKind::Job => "Job",
            ResourceKind::Other(other) => &other.kind,
        }
    }

    /// Lowercase kind name used in generated object names
    #[must_use]
    pub fn short_name(&self) -> String {
        self.kind_name().to_lowercase()
    }

    /// API resource descriptor for dynamic API calls
    #[must_use]
    pub fn api_resource(&self) -> ApiResource {
        match self {
            ResourceKind::Pod => ApiResource::erase::<Pod>(&()),
            ResourceKind::Service => ApiResource::erase::<Service>(&()),
            ResourceKind::ConfigMap => ApiResource::erase::<ConfigMap>(&()),
            ResourceKind::Secret => ApiResource::erase::<Secret>(&()),
            ResourceKind::Job => ApiResource::erase::<Job>(&()),
            ResourceKind::Other(other) => ApiResource::from_gvk_with_plural(
                &GroupVersionKind::gvk(&other.group, &other.version, &other.kind),
                &other.plural,
            ),
        }
    }

    /// Only pods and services can back a tunnel
    #[must_use]
    pub fn is_exposable(&self) -> bool {
        matches!(self, ResourceKind::Pod | ResourceKind::Service)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind_name())
    }
}
