//! # Prelude
//!
//! Re-exports commonly used types and traits for convenience.
//!
//! ## Usage
//!
//! ```rust
//! use kube_fixtures::prelude::*;
//! ```
//!
//! This brings into scope:
//! - The coordinator and its handles (LifecycleCoordinator, ScopeHandle, Handle, ExposurePlan)
//! - Manifest types (ManifestSource, ResourceSpec, ReadinessGate, SetupStep)
//! - The cluster adapter trait and its implementations
//! - Config and error types

// Lifecycle - the entry point for test integrations
pub use crate::lifecycle::{
    ExposurePlan, Handle, LifecycleCoordinator, ObservedPhase, PortRequest, ScopeHandle,
    ScopeRegistry, TrackedResource,
};

// Manifests
pub use crate::manifest::{
    FileSource, ManifestSource, ReadinessGate, ResourceKind, ResourceSpec, SetupStep,
};

// Cluster adapters
pub use crate::cluster::kube::KubeClusterApi;
pub use crate::cluster::memory::InMemoryCluster;
pub use crate::cluster::{ApiError, ClusterApi, ExecResult, ResourceRef};

// Connectivity
pub use crate::expose::{
    ExposeMode, NodePortEndpoint, Tunnel, TunnelBroken, TunnelStatus, TunnelStream,
};

// Teardown
pub use crate::teardown::TeardownOutcome;

// Presets
pub use crate::presets::{ElasticsearchPreset, PostgresPreset, RabbitMqPreset};

// Config and errors
pub use crate::config::FixtureConfig;
pub use crate::error::{FixtureError, Result};
pub use crate::readiness::ReadinessResult;
