//! kube-fixtures Library
//!
//! Ephemeral Kubernetes workloads for integration tests: resolve manifests,
//! provision them into a scope, wait until they are ready, forward their
//! ports to localhost and tear everything down again, even when the test
//! process dies.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kube_fixtures::prelude::*;
//!
//! # async fn run() -> kube_fixtures::error::Result<()> {
//! let coordinator = LifecycleCoordinator::connect(FixtureConfig::from_env()).await?;
//! let scope = coordinator.begin_scope("orders-it")?;
//!
//! let postgres = PostgresPreset::new().database("orders");
//! let handle = postgres.acquire(&coordinator, &scope).await?;
//! println!("connect to {}", postgres.connection_url(&handle)?);
//!
//! coordinator.end_scope(scope).await;
//! # Ok(())
//! # }
//! ```
//!
//! This brings commonly used types into scope. For more specific imports,
//! use the individual modules.

pub mod backoff;
pub mod cluster;
pub mod config;
pub mod constants;
pub mod error;
pub mod expose;
pub mod lifecycle;
pub mod manifest;
pub mod observability;
pub mod prelude;
pub mod presets;
pub mod provisioner;
pub mod readiness;
pub mod teardown;
