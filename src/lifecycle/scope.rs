//! # Scope
//!
//! State of one provisioning session: the scope anchor, every tracked resource
//! in creation order, the open tunnels and the published node ports.
//!
//! Resources are only added by the provisioner and only removed by teardown.

use crate::cluster::ResourceRef;
use crate::expose::{NodePortEndpoint, Tunnel};
use crate::manifest::ResourceSpec;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Last phase observed for a tracked resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ObservedPhase {
    Pending,
    Running,
    Ready,
    Failed,
    Deleted,
}

impl fmt::Display for ObservedPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ObservedPhase::Pending => "Pending",
            ObservedPhase::Running => "Running",
            ObservedPhase::Ready => "Ready",
            ObservedPhase::Failed => "Failed",
            ObservedPhase::Deleted => "Deleted",
        };
        f.write_str(s)
    }
}

/// A created object together with what the cluster reported about it
#[derive(Debug, Clone)]
pub struct TrackedResource {
    pub spec: ResourceSpec,
    pub uid: String,
    pub created_at: DateTime<Utc>,
    pub resource_version: Option<String>,
    pub phase: ObservedPhase,
}

impl TrackedResource {
    #[must_use]
    pub fn resource_ref(&self) -> ResourceRef {
        self.spec.resource_ref()
    }

    #[must_use]
    pub fn logical_name(&self) -> &str {
        &self.spec.logical_name
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.phase == ObservedPhase::Ready
    }
}

/// One provisioning session
#[derive(Debug)]
pub struct Scope {
    id: String,
    anchor: Option<TrackedResource>,
    resources: Vec<TrackedResource>,
    tunnels: Vec<Tunnel>,
    node_ports: Vec<NodePortEndpoint>,
}

impl Scope {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            anchor: None,
            resources: Vec::new(),
            tunnels: Vec::new(),
            node_ports: Vec::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn anchor(&self) -> Option<&TrackedResource> {
        self.anchor.as_ref()
    }

    /// Tracked resources in creation order
    #[must_use]
    pub fn resources(&self) -> &[TrackedResource] {
        &self.resources
    }

    #[must_use]
    pub fn tunnels(&self) -> &[Tunnel] {
        &self.tunnels
    }

    /// Node ports whose Services are among the tracked resources
    #[must_use]
    pub fn node_ports(&self) -> &[NodePortEndpoint] {
        &self.node_ports
    }

    /// Nothing left to tear down
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.anchor.is_none() && self.resources.is_empty() && self.tunnels.is_empty()
    }

    /// Tracked resource by logical name
    #[must_use]
    pub fn find(&self, logical_name: &str) -> Option<&TrackedResource> {
        self.resources
            .iter()
            .find(|r| r.spec.logical_name == logical_name)
    }

    pub(crate) fn set_anchor(&mut self, anchor: TrackedResource) {
        self.anchor = Some(anchor);
    }

    pub(crate) fn take_anchor(&mut self) -> Option<TrackedResource> {
        self.anchor.take()
    }

    pub(crate) fn push_resource(&mut self, resource: TrackedResource) {
        self.resources.push(resource);
    }

    pub(crate) fn remove_resource(&mut self, uid: &str) -> Option<TrackedResource> {
        let index = self.resources.iter().position(|r| r.uid == uid)?;
        Some(self.resources.remove(index))
    }

    pub(crate) fn set_phase(&mut self, uid: &str, phase: ObservedPhase) {
        if let Some(resource) = self.resources.iter_mut().find(|r| r.uid == uid) {
            resource.phase = phase;
        }
    }

    pub(crate) fn push_tunnel(&mut self, tunnel: Tunnel) {
        self.tunnels.push(tunnel);
    }

    pub(crate) fn take_tunnels(&mut self) -> Vec<Tunnel> {
        std::mem::take(&mut self.tunnels)
    }

    pub(crate) fn push_node_port(&mut self, endpoint: NodePortEndpoint) {
        self.node_ports.push(endpoint);
    }

    /// Forget node ports whose Service is no longer tracked
    pub(crate) fn retain_node_ports(&mut self) {
        let resources = &self.resources;
        self.node_ports
            .retain(|np| resources.iter().any(|r| &r.resource_ref() == np.service()));
    }
}
