//! # Connectivity Exposer
//!
//! Makes ports of ready pods and services reachable from the test process.
//!
//! - [`ExposeMode::PortForward`]: a local [`Tunnel`]. Before binding the
//!   listener one connection to the remote port is opened through the cluster
//!   adapter, retrying transient failures (a pod whose process is still
//!   starting refuses port-forwards for a moment).
//! - [`ExposeMode::NodePort`]: a NodePort Service selecting the pod; the
//!   endpoint is the pod's node address and the allocated node port.

mod tunnel;

pub use tunnel::{Tunnel, TunnelBroken, TunnelStatus, TunnelStream};

use crate::backoff::retry_transient;
use crate::cluster::ClusterApi;
use crate::config::{FixtureConfig, RetryPolicy};
use crate::error::{FixtureError, Result};
use crate::lifecycle::TrackedResource;
use crate::cluster::{ResourceRef, ResourceState};
use crate::constants::{INSTANCE_LABEL, SCOPE_LABEL};
use crate::manifest::{ManifestResolver, ManifestSource, ResourceKind, ResourceSpec};
use serde_json::json;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// How an exposed port is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExposeMode {
    #[default]
    PortForward,
    NodePort,
}

impl FromStr for ExposeMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "port-forward" | "portforward" => Ok(ExposeMode::PortForward),
            "node-port" | "nodeport" => Ok(ExposeMode::NodePort),
            other => Err(format!("unknown expose mode '{other}'")),
        }
    }
}

impl fmt::Display for ExposeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExposeMode::PortForward => f.write_str("port-forward"),
            ExposeMode::NodePort => f.write_str("node-port"),
        }
    }
}

/// A pod port published through a NodePort Service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePortEndpoint {
    logical_name: String,
    pod: ResourceRef,
    service: ResourceRef,
    remote_port: u16,
    endpoint: SocketAddr,
}

impl NodePortEndpoint {
    #[must_use]
    pub fn logical_name(&self) -> &str {
        &self.logical_name
    }

    /// The exposed pod
    #[must_use]
    pub fn pod(&self) -> &ResourceRef {
        &self.pod
    }

    /// The NodePort Service created for this port
    #[must_use]
    pub fn service(&self) -> &ResourceRef {
        &self.service
    }

    #[must_use]
    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// Node address and node port to dial
    #[must_use]
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }
}

/// Creates [`Tunnel`]s for tracked resources
#[derive(Clone)]
pub struct ConnectivityExposer {
    cluster: Arc<dyn ClusterApi>,
    retry: RetryPolicy,
    node_address: Option<String>,
}

impl std::fmt::Debug for ConnectivityExposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityExposer")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl ConnectivityExposer {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: &FixtureConfig) -> Self {
        Self {
            cluster,
            retry: config.expose_retry(),
            node_address: config.node_address.clone(),
        }
    }

    /// Open a tunnel from a local port to `remote_port` of `resource`
    pub async fn expose(&self, resource: &TrackedResource, remote_port: u16) -> Result<Tunnel> {
        let target = resource.resource_ref();
        let failed = |reason: String| FixtureError::ExposeFailed {
            resource: target.to_string(),
            port: remote_port,
            reason,
        };

        if !resource.is_ready() {
            return Err(failed(format!("resource is {}, not Ready", resource.phase)));
        }
        if !target.kind.is_exposable() {
            return Err(failed(format!("a {} has no ports to forward", target.kind)));
        }

        let first = retry_transient(self.retry, "open_port", || {
            self.cluster.open_port(&target, remote_port)
        })
        .await
        .map_err(|e| failed(e.to_string()))?;
        drop(first);
        debug!("{}:{} accepts connections", target, remote_port);

        Tunnel::open(
            Arc::clone(&self.cluster),
            target.clone(),
            resource.logical_name().to_string(),
            remote_port,
        )
        .await
        .map_err(|e| failed(format!("cannot bind local listener: {e}")))
    }

    /// NodePort Service publishing `remote_port` of the pod `resource`
    ///
    /// The Service selects the pod by its instance and scope labels and is
    /// resolved through the scope's resolver, so it is named, labeled and
    /// owned like every other object of the scope.
    pub fn node_port_spec(
        &self,
        resolver: &ManifestResolver,
        resource: &TrackedResource,
        remote_port: u16,
    ) -> Result<ResourceSpec> {
        let target = resource.resource_ref();
        if target.kind != ResourceKind::Pod {
            return Err(FixtureError::ExposeFailed {
                resource: target.to_string(),
                port: remote_port,
                reason: format!("node ports publish pods, not a {}", target.kind),
            });
        }
        let selector = json!({
            INSTANCE_LABEL: target.name,
            SCOPE_LABEL: resolver.scope_hash(),
        });
        let service = json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "generateName": format!("{}-np{remote_port}-", resource.logical_name()),
                "namespace": target.namespace,
            },
            "spec": {
                "type": "NodePort",
                "selector": selector,
                "ports": [{"name": "exposed", "port": remote_port, "targetPort": remote_port}],
            },
        });
        let mut specs = resolver.resolve(&ManifestSource::Object(service))?;
        Ok(specs.remove(0))
    }

    /// Endpoint of a ready NodePort `service` created by [`Self::node_port_spec`]
    pub async fn node_port_endpoint(
        &self,
        resource: &TrackedResource,
        service: &TrackedResource,
        remote_port: u16,
    ) -> Result<NodePortEndpoint> {
        let pod = resource.resource_ref();
        let failed = |reason: String| FixtureError::ExposeFailed {
            resource: pod.to_string(),
            port: remote_port,
            reason,
        };

        let node_port = match self.cluster.get(&service.resource_ref()).await {
            Ok(ResourceState::Service { service, .. }) => service
                .spec
                .and_then(|spec| spec.ports)
                .and_then(|ports| ports.into_iter().find_map(|p| p.node_port))
                .and_then(|port| u16::try_from(port).ok())
                .ok_or_else(|| failed("service has no node port allocated".to_string()))?,
            Ok(_) => return Err(failed("node port service disappeared".to_string())),
            Err(e) => return Err(failed(e.to_string())),
        };

        let host = match &self.node_address {
            Some(address) => address.clone(),
            None => match self.cluster.get(&pod).await {
                Ok(ResourceState::Pod(pod)) => pod
                    .status
                    .and_then(|status| status.host_ip)
                    .ok_or_else(|| failed("pod has no host address".to_string()))?,
                Ok(_) => return Err(failed("pod disappeared".to_string())),
                Err(e) => return Err(failed(e.to_string())),
            },
        };
        let endpoint = (host.as_str(), node_port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| failed(format!("cannot resolve node address '{host}'")))?;

        debug!("{} port {} published on {}", pod, remote_port, endpoint);
        Ok(NodePortEndpoint {
            logical_name: resource.logical_name().to_string(),
            pod,
            service: service.resource_ref(),
            remote_port,
            endpoint,
        })
    }
}
