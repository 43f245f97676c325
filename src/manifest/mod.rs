//! # Manifest Resolver
//!
//! Turns a declarative workload description into concrete [`ResourceSpec`]s for
//! one scope.
//!
//! ## Sources
//!
//! - `Yaml`: one or more `---` separated documents
//! - `File`: a YAML file, read once
//! - `Object` / `Objects`: inline structured data
//!
//! ## Materialization
//!
//! Every resolved object receives:
//! - a scope-unique name derived from its manifest name, see [`naming`]; the
//!   manifest name survives only as the logical name
//! - the managed-by, scope and instance labels plus the scope-id annotation
//! - the configured namespace when the manifest names none
//! - for pods, the configured image pull secrets and an `activeDeadlineSeconds`
//!   equal to the fallback TTL unless the manifest sets one
//!
//! Since cluster names change, references between objects of the same scope
//! are rewritten: ConfigMap, Secret and PersistentVolumeClaim references in pod
//! specs (and pod templates) point at the generated names, and Service
//! selectors are narrowed to the scope label. Hostnames inside container
//! arguments or environment values are left alone.
//!
//! Resolution has no side effects beyond reading a `File` source.

pub mod kind;
pub mod naming;

pub use kind::{OtherKind, ResourceKind};

use crate::cluster::ResourceRef;
use crate::config::FixtureConfig;
use crate::constants::*;
use crate::error::{FixtureError, Result};
use kube::api::DynamicObject;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Where manifests come from
#[derive(Debug, Clone)]
pub enum ManifestSource {
    Yaml(String),
    File(PathBuf),
    Object(Value),
    Objects(Vec<Value>),
}

impl ManifestSource {
    /// Wrap a typed object (e.g. a k8s-openapi `Pod`)
    pub fn from_resource<K: serde::Serialize>(resource: &K) -> Result<Self> {
        serde_json::to_value(resource)
            .map(ManifestSource::Object)
            .map_err(|e| FixtureError::MalformedManifest(format!("cannot serialize object: {e}")))
    }
}

/// Readiness condition overriding the per-kind default (pods only)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessGate {
    /// Phase `Running`, `Ready` condition true and the listed containers ready (empty = all)
    ContainersReady { containers: Vec<String> },
    /// Phase `Running`
    Running,
    /// `pattern` (regex, or literal text when not a valid regex) seen `times` times in the log
    Log {
        pattern: String,
        times: usize,
        container: Option<String>,
    },
}

/// Where the bytes of a copied file come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource {
    /// Local file, read when the step runs
    Path(PathBuf),
    Bytes(Vec<u8>),
}

/// Work done inside a pod once it is ready and before it is exposed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupStep {
    /// Write a file into a container; a failure aborts the acquire
    CopyFile {
        container: Option<String>,
        source: FileSource,
        destination: String,
    },
    /// Run a command in a container; a non-zero exit is logged, not fatal
    Exec {
        container: Option<String>,
        command: Vec<String>,
    },
}

/// One materialized object ready to be submitted
#[derive(Debug, Clone)]
pub struct ResourceSpec {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
    /// Caller-facing alias used by exposure plans and handles
    pub logical_name: String,
    /// Full manifest as submitted to the API server
    pub payload: DynamicObject,
    pub scope_id: String,
    pub gate: Option<ReadinessGate>,
    pub readiness_timeout: Option<Duration>,
    /// Steps run in order after readiness (pods only)
    pub setup: Vec<SetupStep>,
}

impl ResourceSpec {
    #[must_use]
    pub fn resource_ref(&self) -> ResourceRef {
        ResourceRef::new(self.kind.clone(), &self.namespace, &self.name)
    }

    /// Replace the readiness gate
    #[must_use]
    pub fn with_gate(mut self, gate: ReadinessGate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Replace the readiness budget
    #[must_use]
    pub fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = Some(timeout);
        self
    }

    /// Append a step to run once the pod is ready
    #[must_use]
    pub fn with_setup(mut self, step: SetupStep) -> Self {
        self.setup.push(step);
        self
    }

    /// Value of the scope label stamped on this object
    #[must_use]
    pub fn scope_label(&self) -> Option<&str> {
        self.payload
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(SCOPE_LABEL))
            .map(String::as_str)
    }
}

/// Resolves manifests for a single scope
///
/// Holds the scope's name counter and the manifest-name to cluster-name table,
/// so all resolutions of a scope share one resolver.
#[derive(Debug)]
pub struct ManifestResolver {
    scope_id: String,
    scope_hash: String,
    namespace: String,
    pull_secrets: Vec<String>,
    fallback_ttl_secs: u64,
    counter: AtomicU64,
    /// (kind, namespace, manifest name) to generated name
    renamed: Mutex<HashMap<(String, String, String), String>>,
}

impl ManifestResolver {
    pub fn new(scope_id: &str, config: &FixtureConfig) -> Self {
        Self {
            scope_id: scope_id.to_string(),
            scope_hash: naming::scope_hash(scope_id),
            namespace: config.namespace.clone(),
            pull_secrets: config.pull_secrets.clone(),
            fallback_ttl_secs: config.fallback_ttl_secs,
            counter: AtomicU64::new(0),
            renamed: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn scope_hash(&self) -> &str {
        &self.scope_hash
    }

    /// Default namespace for this scope's objects
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Parse, validate and materialize every document in `source`
    pub fn resolve(&self, source: &ManifestSource) -> Result<Vec<ResourceSpec>> {
        let documents = read_documents(source)?;
        if documents.is_empty() {
            return Err(FixtureError::MalformedManifest(
                "manifest contains no documents".to_string(),
            ));
        }

        let mut logical_names = HashSet::new();
        let mut specs = documents
            .into_iter()
            .enumerate()
            .map(|(index, doc)| self.materialize(index, doc, &mut logical_names))
            .collect::<Result<Vec<_>>>()?;

        // References may point at documents later in the same source
        let renamed = self.renamed.lock().unwrap_or_else(PoisonError::into_inner);
        for spec in &mut specs {
            rewrite_references(spec, &renamed);
            if spec.kind == ResourceKind::Service {
                scope_selector(&mut spec.payload, &self.scope_hash);
            }
        }
        Ok(specs)
    }

    /// Cluster name given to the object called `manifest_name` in this scope's manifests
    #[must_use]
    pub fn cluster_name(&self, kind: &ResourceKind, namespace: &str, manifest_name: &str) -> Option<String> {
        self.renamed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(kind.kind_name().to_string(), namespace.to_string(), manifest_name.to_string()))
            .cloned()
    }

    fn materialize(
        &self,
        index: usize,
        document: Value,
        logical_names: &mut HashSet<String>,
    ) -> Result<ResourceSpec> {
        let kind = document_kind(index, &document)?;
        let mut payload: DynamicObject = serde_json::from_value(document).map_err(|e| {
            FixtureError::MalformedManifest(format!("document {index}: invalid object: {e}"))
        })?;

        let explicit_name = payload
            .metadata
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(ToString::to_string);
        let generate_base = payload
            .metadata
            .generate_name
            .take()
            .map(|g| g.trim_end_matches('-').to_string())
            .filter(|g| !g.is_empty());

        let namespace = payload
            .metadata
            .namespace
            .clone()
            .filter(|ns| !ns.trim().is_empty())
            .unwrap_or_else(|| self.namespace.clone());

        let base = explicit_name
            .clone()
            .or_else(|| generate_base.clone())
            .unwrap_or_else(|| format!("{GENERATED_NAME_PREFIX}-{}", kind.short_name()));
        let counter = self.counter.fetch_add(1, Ordering::SeqCst);
        let name = naming::generate_name(&base, &self.scope_hash, counter);
        if let Some(original) = &explicit_name {
            self.renamed.lock().unwrap_or_else(PoisonError::into_inner).insert(
                (kind.kind_name().to_string(), namespace.clone(), original.clone()),
                name.clone(),
            );
        }

        let logical_base = explicit_name
            .or(generate_base)
            .unwrap_or_else(|| kind.short_name());
        let logical_name = unique_logical_name(&logical_base, logical_names);

        payload.metadata.name = Some(name.clone());
        payload.metadata.namespace = Some(namespace.clone());
        let labels = payload.metadata.labels.get_or_insert_with(BTreeMap::new);
        labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());
        labels.insert(SCOPE_LABEL.to_string(), self.scope_hash.clone());
        if name.len() <= MAX_NAME_LEN {
            labels.insert(INSTANCE_LABEL.to_string(), name.clone());
        }
        let annotations = payload.metadata.annotations.get_or_insert_with(BTreeMap::new);
        annotations.insert(SCOPE_ID_ANNOTATION.to_string(), self.scope_id.clone());

        let gate = gate_from_annotations(annotations)?;
        let readiness_timeout = annotations
            .get(READY_TIMEOUT_ANNOTATION)
            .map(|raw| {
                humantime::parse_duration(raw.trim()).map_err(|e| {
                    FixtureError::MalformedManifest(format!(
                        "{name}: invalid {READY_TIMEOUT_ANNOTATION} value '{raw}': {e}"
                    ))
                })
            })
            .transpose()?;

        if kind == ResourceKind::Pod {
            self.prepare_pod(&name, &mut payload)?;
        } else if gate.is_some() {
            return Err(FixtureError::MalformedManifest(format!(
                "{name}: readiness gates apply to pods only, not {kind}"
            )));
        }

        Ok(ResourceSpec {
            kind,
            namespace,
            name,
            logical_name,
            payload,
            scope_id: self.scope_id.clone(),
            gate,
            readiness_timeout,
            setup: Vec::new(),
        })
    }

    fn prepare_pod(&self, name: &str, payload: &mut DynamicObject) -> Result<()> {
        let spec = payload
            .data
            .get_mut("spec")
            .and_then(Value::as_object_mut)
            .ok_or_else(|| FixtureError::MalformedManifest(format!("Pod {name} has no spec")))?;

        if !self.pull_secrets.is_empty() {
            let secrets = spec
                .entry("imagePullSecrets")
                .or_insert_with(|| json!([]))
                .as_array_mut()
                .ok_or_else(|| {
                    FixtureError::MalformedManifest(format!(
                        "Pod {name}: imagePullSecrets must be a list"
                    ))
                })?;
            for secret in &self.pull_secrets {
                let present = secrets
                    .iter()
                    .any(|s| s.get("name").and_then(Value::as_str) == Some(secret.as_str()));
                if !present {
                    secrets.push(json!({ "name": secret }));
                }
            }
        }

        spec.entry("activeDeadlineSeconds")
            .or_insert_with(|| json!(self.fallback_ttl_secs));
        Ok(())
    }
}

type RenameTable = HashMap<(String, String, String), String>;

/// Point ConfigMap, Secret and claim references of a pod spec (or pod template) at generated names
fn rewrite_references(spec: &mut ResourceSpec, renamed: &RenameTable) {
    let namespace = spec.namespace.clone();
    let pod_spec = if spec.kind == ResourceKind::Pod {
        spec.payload.data.get_mut("spec")
    } else {
        spec.payload
            .data
            .get_mut("spec")
            .and_then(|s| s.get_mut("template"))
            .and_then(|t| t.get_mut("spec"))
    };
    let Some(pod_spec) = pod_spec else {
        return;
    };
    let rename = |kind: &str, value: &mut Value| {
        if let Some(original) = value.as_str() {
            let key = (kind.to_string(), namespace.clone(), original.to_string());
            if let Some(generated) = renamed.get(&key) {
                *value = Value::String(generated.clone());
            }
        }
    };

    for volume in array_items(pod_spec.get_mut("volumes")) {
        if let Some(v) = volume.pointer_mut("/configMap/name") {
            rename("ConfigMap", v);
        }
        if let Some(v) = volume.pointer_mut("/secret/secretName") {
            rename("Secret", v);
        }
        if let Some(v) = volume.pointer_mut("/persistentVolumeClaim/claimName") {
            rename("PersistentVolumeClaim", v);
        }
        for source in array_items(volume.pointer_mut("/projected/sources")) {
            if let Some(v) = source.pointer_mut("/configMap/name") {
                rename("ConfigMap", v);
            }
            if let Some(v) = source.pointer_mut("/secret/name") {
                rename("Secret", v);
            }
        }
    }

    for field in ["containers", "initContainers"] {
        for container in array_items(pod_spec.get_mut(field)) {
            for env in array_items(container.get_mut("env")) {
                if let Some(v) = env.pointer_mut("/valueFrom/configMapKeyRef/name") {
                    rename("ConfigMap", v);
                }
                if let Some(v) = env.pointer_mut("/valueFrom/secretKeyRef/name") {
                    rename("Secret", v);
                }
            }
            for env_from in array_items(container.get_mut("envFrom")) {
                if let Some(v) = env_from.pointer_mut("/configMapRef/name") {
                    rename("ConfigMap", v);
                }
                if let Some(v) = env_from.pointer_mut("/secretRef/name") {
                    rename("Secret", v);
                }
            }
        }
    }
}

fn array_items<'a>(value: Option<&'a mut Value>) -> impl Iterator<Item = &'a mut Value> {
    value
        .and_then(Value::as_array_mut)
        .into_iter()
        .flat_map(|items| items.iter_mut())
}

/// Add the scope label to a non-empty Service selector so it never matches another scope's pods
fn scope_selector(payload: &mut DynamicObject, scope_hash: &str) {
    let selector = payload
        .data
        .get_mut("spec")
        .and_then(|s| s.get_mut("selector"))
        .and_then(Value::as_object_mut);
    if let Some(selector) = selector {
        if !selector.is_empty() {
            selector.insert(SCOPE_LABEL.to_string(), Value::String(scope_hash.to_string()));
        }
    }
}

fn read_documents(source: &ManifestSource) -> Result<Vec<Value>> {
    match source {
        ManifestSource::Yaml(text) => parse_yaml(text),
        ManifestSource::File(path) => {
            let text = std::fs::read_to_string(path)?;
            parse_yaml(&text)
        }
        ManifestSource::Object(value) => Ok(vec![value.clone()]),
        ManifestSource::Objects(values) => Ok(values.clone()),
    }
}

fn parse_yaml(text: &str) -> Result<Vec<Value>> {
    let mut documents = Vec::new();
    for (index, document) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let value = Value::deserialize(document).map_err(|e| {
            FixtureError::MalformedManifest(format!("document {index}: invalid YAML: {e}"))
        })?;
        if !value.is_null() {
            documents.push(value);
        }
    }
    Ok(documents)
}

fn document_kind(index: usize, document: &Value) -> Result<ResourceKind> {
    let object = document.as_object().ok_or_else(|| {
        FixtureError::MalformedManifest(format!("document {index} is not a mapping"))
    })?;
    let api_version = string_field(index, object, "apiVersion")?;
    let kind = string_field(index, object, "kind")?;

    if kind.ends_with("List") && object.contains_key("items") {
        return Err(FixtureError::MalformedManifest(format!(
            "document {index}: {kind} is not supported, use one document per object"
        )));
    }
    if let Some(metadata) = object.get("metadata") {
        if !metadata.is_object() {
            return Err(FixtureError::MalformedManifest(format!(
                "document {index}: metadata must be a mapping"
            )));
        }
    }

    ResourceKind::from_type_meta(api_version, kind).ok_or_else(|| {
        FixtureError::MalformedManifest(format!(
            "document {index}: unsupported kind {api_version}/{kind}"
        ))
    })
}

fn string_field<'a>(
    index: usize,
    object: &'a serde_json::Map<String, Value>,
    field: &str,
) -> Result<&'a str> {
    match object.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.as_str()),
        Some(_) => Err(FixtureError::MalformedManifest(format!(
            "document {index}: {field} must be a non-empty string"
        ))),
        None => Err(FixtureError::MalformedManifest(format!(
            "document {index}: missing {field}"
        ))),
    }
}

fn unique_logical_name(base: &str, taken: &mut HashSet<String>) -> String {
    let mut candidate = base.to_string();
    let mut n = 2;
    while !taken.insert(candidate.clone()) {
        candidate = format!("{base}-{n}");
        n += 1;
    }
    candidate
}

fn gate_from_annotations(annotations: &BTreeMap<String, String>) -> Result<Option<ReadinessGate>> {
    let wait_for = annotations.get(WAIT_FOR_ANNOTATION).map(|s| s.trim());
    let log_pattern = annotations.get(WAIT_LOG_ANNOTATION);

    match (wait_for, log_pattern) {
        (None, None) => Ok(None),
        (Some("running"), _) => Ok(Some(ReadinessGate::Running)),
        (Some("containers-ready"), _) => {
            let containers = annotations
                .get(WAIT_CONTAINERS_ANNOTATION)
                .map(|list| {
                    list.split(',')
                        .map(str::trim)
                        .filter(|c| !c.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default();
            Ok(Some(ReadinessGate::ContainersReady { containers }))
        }
        (Some("log") | None, Some(pattern)) => {
            let times = match annotations.get(WAIT_LOG_TIMES_ANNOTATION) {
                Some(raw) => raw.trim().parse::<usize>().ok().filter(|t| *t > 0).ok_or_else(|| {
                    FixtureError::MalformedManifest(format!(
                        "invalid {WAIT_LOG_TIMES_ANNOTATION} value '{raw}'"
                    ))
                })?,
                None => 1,
            };
            Ok(Some(ReadinessGate::Log {
                pattern: pattern.clone(),
                times,
                container: None,
            }))
        }
        (Some("log"), None) => Err(FixtureError::MalformedManifest(format!(
            "{WAIT_FOR_ANNOTATION}=log requires {WAIT_LOG_ANNOTATION}"
        ))),
        (Some(other), _) => Err(FixtureError::MalformedManifest(format!(
            "unknown {WAIT_FOR_ANNOTATION} value '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> ManifestResolver {
        ManifestResolver::new("scope-under-test", &FixtureConfig::default())
    }

    const POD: &str = r#"
apiVersion: v1
kind: Pod
metadata:
  generateName: redis-
spec:
  containers:
    - name: redis
      image: redis:7
"#;

    #[test]
    fn test_generated_names_use_scope_hash_and_counter() {
        let resolver = resolver();
        let hash = resolver.scope_hash().to_string();
        let first = resolver.resolve(&ManifestSource::Yaml(POD.to_string())).unwrap();
        let second = resolver.resolve(&ManifestSource::Yaml(POD.to_string())).unwrap();

        assert_eq!(first[0].name, format!("redis-{hash}-0"));
        assert_eq!(second[0].name, format!("redis-{hash}-1"));
        assert_eq!(first[0].logical_name, "redis");
        assert_eq!(first[0].kind, ResourceKind::Pod);
        assert_eq!(first[0].namespace, "default");
    }

    #[test]
    fn test_default_base_is_kind() {
        let resolver = resolver();
        let specs = resolver
            .resolve(&ManifestSource::Object(json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "data": {"k": "v"}
            })))
            .unwrap();
        assert!(specs[0].name.starts_with("kfx-configmap-"));
        assert_eq!(specs[0].logical_name, "configmap");
    }

    #[test]
    fn test_explicit_name_becomes_logical_name_and_labels_stamped() {
        let resolver = resolver();
        let hash = resolver.scope_hash().to_string();
        let specs = resolver
            .resolve(&ManifestSource::Object(json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": {"name": "db", "namespace": "tests"},
                "spec": {"ports": [{"port": 5432}]}
            })))
            .unwrap();
        let spec = &specs[0];
        assert_eq!(spec.name, format!("db-{hash}-0"));
        assert_eq!(spec.logical_name, "db");
        assert_eq!(spec.namespace, "tests");
        assert_eq!(spec.payload.metadata.name.as_deref(), Some(spec.name.as_str()));

        let labels = spec.payload.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[MANAGED_BY_LABEL], MANAGED_BY_VALUE);
        assert_eq!(labels[SCOPE_LABEL], resolver.scope_hash());
        assert_eq!(labels[INSTANCE_LABEL], spec.name);
        assert_eq!(spec.scope_label(), Some(resolver.scope_hash()));
        let annotations = spec.payload.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations[SCOPE_ID_ANNOTATION], "scope-under-test");
    }

    #[test]
    fn test_multi_document_yaml_keeps_order() {
        let yaml = format!(
            "{POD}\n---\napiVersion: v1\nkind: Service\nmetadata:\n  name: redis\nspec:\n  ports:\n    - port: 6379\n---\n"
        );
        let specs = resolver().resolve(&ManifestSource::Yaml(yaml)).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].kind, ResourceKind::Pod);
        assert_eq!(specs[1].kind, ResourceKind::Service);
        // Both aliases want "redis"
        assert_eq!(specs[0].logical_name, "redis");
        assert_eq!(specs[1].logical_name, "redis-2");
    }

    #[test]
    fn test_pod_defaults_injected() {
        let config = FixtureConfig {
            pull_secrets: vec!["regcred".to_string()],
            fallback_ttl_secs: 600,
            ..FixtureConfig::default()
        };
        let resolver = ManifestResolver::new("s", &config);
        let specs = resolver.resolve(&ManifestSource::Yaml(POD.to_string())).unwrap();
        let spec = &specs[0].payload.data["spec"];
        assert_eq!(spec["imagePullSecrets"], json!([{"name": "regcred"}]));
        assert_eq!(spec["activeDeadlineSeconds"], json!(600));
    }

    #[test]
    fn test_explicit_deadline_is_kept() {
        let specs = resolver()
            .resolve(&ManifestSource::Object(json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "spec": {"activeDeadlineSeconds": 30, "containers": []}
            })))
            .unwrap();
        assert_eq!(specs[0].payload.data["spec"]["activeDeadlineSeconds"], json!(30));
    }

    #[test]
    fn test_malformed_inputs() {
        let resolver = resolver();
        let cases = [
            ManifestSource::Yaml(String::new()),
            ManifestSource::Yaml("kind: Pod\nmetadata: {}\n".to_string()),
            ManifestSource::Yaml("apiVersion: v1\n".to_string()),
            ManifestSource::Yaml("apiVersion: v1\nkind: [a]\n".to_string()),
            ManifestSource::Yaml("apiVersion: v1\nkind: Pod\nspec: [\n".to_string()),
            ManifestSource::Yaml("apiVersion: v1\nkind: Namespace\nmetadata:\n  name: x\n".to_string()),
            ManifestSource::Yaml("apiVersion: v1\nkind: PodList\nitems: []\n".to_string()),
            ManifestSource::Yaml("- just\n- a list\n".to_string()),
            ManifestSource::Object(json!({"apiVersion": "v1", "kind": "Pod"})),
        ];
        for case in cases {
            match resolver.resolve(&case) {
                Err(FixtureError::MalformedManifest(_)) => {}
                other => panic!("expected MalformedManifest for {case:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_readiness_annotations() {
        let specs = resolver()
            .resolve(&ManifestSource::Object(json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {
                    "name": "pg",
                    "annotations": {
                        WAIT_FOR_ANNOTATION: "log",
                        WAIT_LOG_ANNOTATION: "ready to accept connections",
                        WAIT_LOG_TIMES_ANNOTATION: "2",
                        READY_TIMEOUT_ANNOTATION: "1m30s"
                    }
                },
                "spec": {"containers": []}
            })))
            .unwrap();
        assert_eq!(
            specs[0].gate,
            Some(ReadinessGate::Log {
                pattern: "ready to accept connections".to_string(),
                times: 2,
                container: None
            })
        );
        assert_eq!(specs[0].readiness_timeout, Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_gate_on_non_pod_rejected() {
        let result = resolver().resolve(&ManifestSource::Object(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"annotations": {WAIT_FOR_ANNOTATION: "running"}}
        })));
        assert!(matches!(result, Err(FixtureError::MalformedManifest(_))));
    }

    #[test]
    fn test_file_source() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, POD.as_bytes()).unwrap();
        let specs = resolver()
            .resolve(&ManifestSource::File(file.path().to_path_buf()))
            .unwrap();
        assert_eq!(specs.len(), 1);
    }

    #[test]
    fn test_from_resource() {
        use k8s_openapi::api::core::v1::ConfigMap;
        let cm = ConfigMap {
            data: Some(BTreeMap::from([("a".to_string(), "b".to_string())])),
            ..ConfigMap::default()
        };
        let specs = resolver()
            .resolve(&ManifestSource::from_resource(&cm).unwrap())
            .unwrap();
        assert_eq!(specs[0].kind, ResourceKind::ConfigMap);
    }

    #[test]
    fn test_invalid_ready_timeout_rejected() {
        for raw in ["10", "soon", ""] {
            let result = resolver().resolve(&ManifestSource::Object(json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {"annotations": {READY_TIMEOUT_ANNOTATION: raw}},
                "spec": {"containers": []}
            })));
            assert!(
                matches!(result, Err(FixtureError::MalformedManifest(_))),
                "'{raw}' should be rejected"
            );
        }
    }

    #[test]
    fn test_same_manifest_in_two_scopes_gets_distinct_names() {
        let config = FixtureConfig::default();
        let manifest = ManifestSource::Object(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "db"},
            "spec": {"containers": []}
        }));
        let a = ManifestResolver::new("suite::a", &config).resolve(&manifest).unwrap();
        let b = ManifestResolver::new("suite::b", &config).resolve(&manifest).unwrap();
        assert_ne!(a[0].name, b[0].name);
        assert_eq!(a[0].logical_name, b[0].logical_name);
    }

    #[test]
    fn test_references_follow_generated_names() {
        let resolver = resolver();
        let hash = resolver.scope_hash().to_string();
        let yaml = r#"
apiVersion: v1
kind: Pod
metadata:
  name: app
spec:
  containers:
    - name: app
      image: busybox
      env:
        - name: PASSWORD
          valueFrom:
            secretKeyRef:
              name: creds
              key: password
      envFrom:
        - configMapRef:
            name: settings
  volumes:
    - name: conf
      configMap:
        name: settings
    - name: external
      configMap:
        name: shared-elsewhere
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
data:
  mode: test
---
apiVersion: v1
kind: Secret
metadata:
  name: creds
stringData:
  password: hunter2
"#;
        let specs = resolver.resolve(&ManifestSource::Yaml(yaml.to_string())).unwrap();
        let settings = format!("settings-{hash}-1");
        let creds = format!("creds-{hash}-2");
        assert_eq!(specs[1].name, settings);
        assert_eq!(specs[2].name, creds);

        let pod = &specs[0].payload.data["spec"];
        assert_eq!(pod["volumes"][0]["configMap"]["name"], json!(settings));
        assert_eq!(pod["volumes"][1]["configMap"]["name"], json!("shared-elsewhere"));
        let container = &pod["containers"][0];
        assert_eq!(container["envFrom"][0]["configMapRef"]["name"], json!(settings));
        assert_eq!(
            container["env"][0]["valueFrom"]["secretKeyRef"]["name"],
            json!(creds)
        );
        assert_eq!(
            resolver.cluster_name(&ResourceKind::Secret, "default", "creds"),
            Some(creds)
        );
    }

    #[test]
    fn test_service_selector_is_scoped() {
        let resolver = resolver();
        let specs = resolver
            .resolve(&ManifestSource::Object(json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": {"name": "redis-svc"},
                "spec": {"selector": {"app": "redis"}, "ports": [{"port": 6379}]}
            })))
            .unwrap();
        assert_eq!(
            specs[0].payload.data["spec"]["selector"],
            json!({"app": "redis", SCOPE_LABEL: resolver.scope_hash()})
        );
    }
}
