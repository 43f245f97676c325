//! # Cluster API Adapter
//!
//! Thin boundary between the lifecycle engine and the cluster API server.
//!
//! - [`ClusterApi`] is the seam every other module talks to
//! - [`kube::KubeClusterApi`] implements it with a `kube::Client`
//! - [`memory::InMemoryCluster`] implements it in memory for tests and dry runs
//!
//! Failures are normalized into [`ApiError`] with a [`FailureClass`] so callers
//! can decide whether to retry. The adapter itself never retries.

pub mod classify;
pub mod kube;
pub mod memory;

use crate::manifest::{ResourceKind, ResourceSpec};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::{Pod, Service};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Whether a failure may succeed if the same call is repeated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureClass {
    Transient,
    Terminal,
}

/// Normalized cluster API failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{class:?} API error{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
pub struct ApiError {
    pub class: FailureClass,
    /// HTTP status code when the server answered
    pub status: Option<u16>,
    /// Machine readable reason (`AlreadyExists`, `NotFound`, `Conflict`, ...)
    pub reason: Option<String>,
    pub message: String,
}

impl ApiError {
    /// Failure that may succeed on retry
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Transient,
            status: None,
            reason: None,
            message: message.into(),
        }
    }

    /// Failure that will not succeed on retry
    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Terminal,
            status: None,
            reason: None,
            message: message.into(),
        }
    }

    /// Attach the HTTP status and reason reported by the server
    #[must_use]
    pub fn with_status(mut self, status: u16, reason: impl Into<String>) -> Self {
        self.status = Some(status);
        self.reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.class == FailureClass::Transient
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.status == Some(404) || self.reason.as_deref() == Some("NotFound")
    }

    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        self.status == Some(409) && self.reason.as_deref() == Some("AlreadyExists")
    }
}

/// Fully qualified reference to one namespaced object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Server-side facts returned by a successful create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    pub uid: String,
    pub resource_version: Option<String>,
    pub creation_timestamp: DateTime<Utc>,
}

/// Snapshot of an object as the readiness predicates need it
#[derive(Debug, Clone)]
pub enum ResourceState {
    Absent,
    Pod(Box<Pod>),
    Service {
        service: Box<Service>,
        /// Number of ready endpoint addresses backing the service
        ready_endpoints: usize,
    },
    /// Kinds whose readiness is plain existence
    Present { uid: Option<String> },
}

impl ResourceState {
    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(self, ResourceState::Absent)
    }

    #[must_use]
    pub fn uid(&self) -> Option<&str> {
        match self {
            ResourceState::Absent => None,
            ResourceState::Pod(pod) => pod.metadata.uid.as_deref(),
            ResourceState::Service { service, .. } => service.metadata.uid.as_deref(),
            ResourceState::Present { uid } => uid.as_deref(),
        }
    }
}

/// One event on a watch stream
#[derive(Debug, Clone)]
pub enum StateChange {
    Applied(ResourceState),
    Deleted,
}

/// Result of a delete call; not-found is not an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyGone,
}

/// Object metadata returned by [`ClusterApi::list`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedObject {
    pub resource: ResourceRef,
    pub uid: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// uids named by the object's owner references
    pub owner_uids: Vec<String>,
}

/// Outcome of a command run inside a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecResult {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Standard output, lossily decoded as UTF-8
    #[must_use]
    pub fn stdout_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    /// Standard error, lossily decoded as UTF-8
    #[must_use]
    pub fn stderr_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

/// Bidirectional byte stream to a remote port
pub trait PortStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> PortStream for T {}

/// Boxed remote connection returned by [`ClusterApi::open_port`]
pub type BoxPortStream = Box<dyn PortStream>;

/// Everything the lifecycle engine needs from a cluster
///
/// Implementations must be safe to share across concurrently running scopes.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Submit a materialized manifest
    async fn create(&self, spec: &ResourceSpec) -> Result<Created, ApiError>;

    /// Current state of one object
    async fn get(&self, resource: &ResourceRef) -> Result<ResourceState, ApiError>;

    /// Stream of state changes for one object; ends only when dropped or on error
    async fn watch(
        &self,
        resource: &ResourceRef,
    ) -> Result<BoxStream<'static, Result<StateChange, ApiError>>, ApiError>;

    /// Delete one object; not-found reports [`DeleteOutcome::AlreadyGone`]
    async fn delete(&self, resource: &ResourceRef) -> Result<DeleteOutcome, ApiError>;

    /// Objects of `kind` in `namespace` (all namespaces when `None`) matching a label selector
    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<ListedObject>, ApiError>;

    /// Whether watches are available for `kind`; polling is used otherwise
    fn supports_watch(&self, kind: &ResourceKind) -> bool;

    /// Open a byte stream to `port` on a pod, or on a ready pod behind a service
    async fn open_port(&self, resource: &ResourceRef, port: u16)
        -> Result<BoxPortStream, ApiError>;

    /// Run `command` in a pod container, feeding it `stdin` when given, and wait for it to exit
    async fn exec(
        &self,
        resource: &ResourceRef,
        container: Option<&str>,
        command: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<ExecResult, ApiError>;

    /// Follow a pod container's log line by line
    async fn log_lines(
        &self,
        resource: &ResourceRef,
        container: Option<&str>,
    ) -> Result<BoxStream<'static, Result<String, ApiError>>, ApiError>;
}
