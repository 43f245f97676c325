//! Shared helpers for integration tests.

#![allow(dead_code)]

use kube_fixtures::cluster::memory::InMemoryCluster;
use kube_fixtures::config::FixtureConfig;
use kube_fixtures::lifecycle::{LifecycleCoordinator, ScopeRegistry};
use std::sync::Arc;

pub const REDIS: &str = r#"
apiVersion: v1
kind: Pod
metadata:
  generateName: redis-
  labels:
    app: redis
spec:
  containers:
    - name: redis
      image: redis:7
"#;

pub const REDIS_WITH_SERVICE: &str = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  generateName: redis-conf-
data:
  redis.conf: "maxmemory 64mb"
---
apiVersion: v1
kind: Pod
metadata:
  name: redis
  labels:
    app: redis
spec:
  containers:
    - name: redis
      image: redis:7
---
apiVersion: v1
kind: Service
metadata:
  name: redis-svc
spec:
  selector:
    app: redis
  ports:
    - port: 6379
"#;

/// Coordinator over a fresh in-memory cluster with a private registry
pub fn coordinator() -> (InMemoryCluster, LifecycleCoordinator) {
    coordinator_with(FixtureConfig::default())
}

pub fn coordinator_with(config: FixtureConfig) -> (InMemoryCluster, LifecycleCoordinator) {
    let cluster = InMemoryCluster::new();
    let coordinator = LifecycleCoordinator::with_registry(
        Arc::new(cluster.clone()),
        config,
        Arc::new(ScopeRegistry::new()),
    );
    (cluster, coordinator)
}
