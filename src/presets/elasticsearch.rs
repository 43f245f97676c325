//! # Elasticsearch Preset
//!
//! A single-node Elasticsearch pod. A privileged init container raises
//! `vm.max_map_count` on the node before the server starts; without it the
//! bootstrap checks refuse to start outside development mode.

use crate::error::Result;
use crate::lifecycle::{ExposurePlan, Handle, LifecycleCoordinator, ScopeHandle};
use crate::manifest::{ManifestSource, ReadinessGate, ResourceSpec};
use serde_json::json;
use std::time::Duration;

pub const DEFAULT_IMAGE: &str = "docker.elastic.co/elasticsearch/elasticsearch:7.9.2";
pub const HTTP_PORT: u16 = 9200;
pub const TRANSPORT_PORT: u16 = 9300;
pub const CONTAINER: &str = "elasticsearch";
pub const READY_PATTERN: &str = ".*started.*";
pub const READY_TIMEOUT: Duration = Duration::from_secs(60);
pub const MAX_MAP_COUNT: u32 = 262_144;

/// Builder for an Elasticsearch fixture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElasticsearchPreset {
    pub name: String,
    pub image: String,
    pub init_image: String,
    /// `ES_JAVA_OPTS`, e.g. `-Xms512m -Xmx512m`
    pub java_opts: Option<String>,
}

impl Default for ElasticsearchPreset {
    fn default() -> Self {
        Self {
            name: "elasticsearch".to_string(),
            image: DEFAULT_IMAGE.to_string(),
            init_image: "busybox".to_string(),
            java_opts: None,
        }
    }
}

impl ElasticsearchPreset {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Logical name (and generated-name base) of the pod
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Image of the init container running `sysctl`
    #[must_use]
    pub fn init_image(mut self, image: impl Into<String>) -> Self {
        self.init_image = image.into();
        self
    }

    #[must_use]
    pub fn java_opts(mut self, opts: impl Into<String>) -> Self {
        self.java_opts = Some(opts.into());
        self
    }

    #[must_use]
    pub fn manifest(&self) -> ManifestSource {
        let mut env = vec![json!({ "name": "discovery.type", "value": "single-node" })];
        if let Some(opts) = &self.java_opts {
            env.push(json!({ "name": "ES_JAVA_OPTS", "value": opts }));
        }
        ManifestSource::Object(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "generateName": format!("{}-", self.name),
                "labels": { "app.kubernetes.io/name": "elasticsearch" }
            },
            "spec": {
                "restartPolicy": "Never",
                "initContainers": [{
                    "name": "set-vm-max-map-count",
                    "image": self.init_image,
                    "command": ["sysctl", "-w", format!("vm.max_map_count={MAX_MAP_COUNT}")],
                    "securityContext": { "privileged": true }
                }],
                "containers": [{
                    "name": CONTAINER,
                    "image": self.image,
                    "env": env,
                    "securityContext": { "runAsNonRoot": true, "runAsUser": 1000 },
                    "ports": [
                        { "name": "http", "containerPort": HTTP_PORT },
                        { "name": "transport", "containerPort": TRANSPORT_PORT }
                    ]
                }]
            }
        }))
    }

    /// Resolved spec with the log gate and timeout applied
    pub fn specs(&self, coordinator: &LifecycleCoordinator, scope: &ScopeHandle) -> Result<Vec<ResourceSpec>> {
        Ok(coordinator
            .resolve(scope, &self.manifest())?
            .into_iter()
            .map(|spec| {
                spec.with_gate(ReadinessGate::Log {
                    pattern: READY_PATTERN.to_string(),
                    times: 1,
                    container: Some(CONTAINER.to_string()),
                })
                .with_readiness_timeout(READY_TIMEOUT)
            })
            .collect())
    }

    #[must_use]
    pub fn exposure(&self) -> ExposurePlan {
        ExposurePlan::new().expose(self.name.clone(), HTTP_PORT)
    }

    /// Provision, wait and expose in one call
    pub async fn acquire(&self, coordinator: &LifecycleCoordinator, scope: &ScopeHandle) -> Result<Handle> {
        let specs = self.specs(coordinator, scope)?;
        coordinator.acquire(scope, specs, &self.exposure()).await
    }

    /// Base URL of the REST API
    pub fn http_url(&self, handle: &Handle) -> Result<String> {
        let endpoint = handle.endpoint(&self.name, HTTP_PORT)?;
        Ok(format!("http://{endpoint}"))
    }
}
