//! # Kubernetes Adapter
//!
//! [`ClusterApi`] implementation backed by a `kube::Client`.
//!
//! - create, delete and list go through `Api<DynamicObject>` so any kind works
//! - state reads use typed `Pod`, `Service` and `Endpoints`
//! - pod watches use `kube_runtime::watcher` with a `metadata.name` field selector
//! - tunnels use the pod `portforward` subresource; services are first resolved
//!   to a ready backing pod through their endpoints
//! - commands use the pod `exec` subresource; the exit code comes from the
//!   final status frame
//!
//! Every request is bounded by the configured operation timeout; an expired
//! request is reported as a transient failure.

use super::{
    ApiError, BoxPortStream, ClusterApi, Created, DeleteOutcome, ExecResult, ListedObject,
    ResourceRef, ResourceState, StateChange,
};
use crate::config::FixtureConfig;
use crate::manifest::{ResourceKind, ResourceSpec};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::{AsyncBufReadExt, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Endpoints, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Status};
use kube::api::{
    Api, AttachParams, DeleteParams, DynamicObject, ListParams, LogParams, PostParams,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use kube_runtime::watcher::{self, Event};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

/// Build a client for the configured kubeconfig context, or infer one
pub async fn connect(config: &FixtureConfig) -> Result<Client, ApiError> {
    let mut kube_config = match &config.context {
        Some(context) => {
            let kubeconfig = Kubeconfig::read()
                .map_err(|e| ApiError::terminal(format!("failed to read kubeconfig: {e}")))?;
            let options = KubeConfigOptions {
                context: Some(context.clone()),
                ..KubeConfigOptions::default()
            };
            kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(|e| {
                    ApiError::terminal(format!("failed to load kubeconfig context '{context}': {e}"))
                })?
        }
        None => kube::Config::infer()
            .await
            .map_err(|e| ApiError::terminal(format!("failed to infer cluster config: {e}")))?,
    };
    kube_config.read_timeout = Some(config.operation_timeout());
    kube_config.write_timeout = Some(config.operation_timeout());

    info!(
        "🔌 Connecting to cluster at {} (context: {})",
        kube_config.cluster_url,
        config.context.as_deref().unwrap_or("<default>")
    );
    Client::try_from(kube_config)
        .map_err(|e| ApiError::terminal(format!("failed to create Kubernetes client: {e}")))
}

/// [`ClusterApi`] over a live cluster
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
    operation_timeout: Duration,
}

impl std::fmt::Debug for KubeClusterApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterApi")
            .field("operation_timeout", &self.operation_timeout)
            .finish_non_exhaustive()
    }
}

impl KubeClusterApi {
    #[must_use]
    pub fn new(client: Client, operation_timeout: Duration) -> Self {
        Self {
            client,
            operation_timeout,
        }
    }

    /// Connect using [`connect`]
    pub async fn from_config(config: &FixtureConfig) -> Result<Self, ApiError> {
        Ok(Self::new(connect(config).await?, config.operation_timeout()))
    }

    fn dynamic(&self, kind: &ResourceKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &kind.api_resource())
    }

    async fn bounded<T, F>(&self, operation: &str, fut: F) -> Result<T, ApiError>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.operation_timeout, fut).await {
            Ok(result) => result.map_err(ApiError::from),
            Err(_) => Err(ApiError::transient(format!(
                "{operation} timed out after {:?}",
                self.operation_timeout
            ))),
        }
    }

    /// Pick a ready pod behind `service` and the pod port serving `port`
    async fn service_backend(
        &self,
        service: &ResourceRef,
        port: u16,
    ) -> Result<(String, u16), ApiError> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), &service.namespace);
        let svc = self
            .bounded("get service", services.get(&service.name))
            .await?;
        let port_name = svc
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.as_ref())
            .and_then(|ports| ports.iter().find(|p| p.port == i32::from(port)))
            .ok_or_else(|| ApiError::terminal(format!("{service} does not expose port {port}")))?
            .name
            .clone();

        let endpoints: Api<Endpoints> = Api::namespaced(self.client.clone(), &service.namespace);
        let eps = self
            .bounded("get endpoints", endpoints.get_opt(&service.name))
            .await?;

        for subset in eps.and_then(|e| e.subsets).unwrap_or_default() {
            let ports = subset.ports.unwrap_or_default();
            let target = match ports.as_slice() {
                [only] => Some(only),
                many => many.iter().find(|p| p.name == port_name),
            };
            let Some(target) = target.and_then(|p| u16::try_from(p.port).ok()) else {
                continue;
            };
            let pod = subset
                .addresses
                .unwrap_or_default()
                .into_iter()
                .filter_map(|address| address.target_ref)
                .find(|r| r.kind.as_deref() == Some("Pod"))
                .and_then(|r| r.name);
            if let Some(pod) = pod {
                return Ok((pod, target));
            }
        }
        Err(ApiError::transient(format!("{service} has no ready endpoints")))
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn create(&self, spec: &ResourceSpec) -> Result<Created, ApiError> {
        let api = self.dynamic(&spec.kind, &spec.namespace);
        let created = self
            .bounded("create", api.create(&PostParams::default(), &spec.payload))
            .await?;
        let uid = created
            .metadata
            .uid
            .clone()
            .ok_or_else(|| ApiError::terminal(format!("{} created without uid", spec.resource_ref())))?;
        debug!("created {} ({})", spec.resource_ref(), uid);
        Ok(Created {
            uid,
            resource_version: created.metadata.resource_version.clone(),
            creation_timestamp: creation_time(&created.metadata).unwrap_or_else(Utc::now),
        })
    }

    async fn get(&self, resource: &ResourceRef) -> Result<ResourceState, ApiError> {
        let ns = &resource.namespace;
        match &resource.kind {
            ResourceKind::Pod => {
                let pods: Api<Pod> = Api::namespaced(self.client.clone(), ns);
                Ok(self
                    .bounded("get pod", pods.get_opt(&resource.name))
                    .await?
                    .map_or(ResourceState::Absent, |pod| ResourceState::Pod(Box::new(pod))))
            }
            ResourceKind::Service => {
                let services: Api<Service> = Api::namespaced(self.client.clone(), ns);
                let Some(service) = self
                    .bounded("get service", services.get_opt(&resource.name))
                    .await?
                else {
                    return Ok(ResourceState::Absent);
                };
                let endpoints: Api<Endpoints> = Api::namespaced(self.client.clone(), ns);
                let ready_endpoints = self
                    .bounded("get endpoints", endpoints.get_opt(&resource.name))
                    .await?
                    .and_then(|e| e.subsets)
                    .unwrap_or_default()
                    .iter()
                    .map(|subset| subset.addresses.as_ref().map_or(0, Vec::len))
                    .sum();
                Ok(ResourceState::Service {
                    service: Box::new(service),
                    ready_endpoints,
                })
            }
            kind => {
                let api = self.dynamic(kind, ns);
                Ok(self
                    .bounded("get", api.get_opt(&resource.name))
                    .await?
                    .map_or(ResourceState::Absent, |object| ResourceState::Present {
                        uid: object.metadata.uid,
                    }))
            }
        }
    }

    async fn watch(
        &self,
        resource: &ResourceRef,
    ) -> Result<BoxStream<'static, Result<StateChange, ApiError>>, ApiError> {
        if resource.kind != ResourceKind::Pod {
            return Err(ApiError::terminal(format!(
                "watching {} is not supported",
                resource.kind
            )));
        }
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &resource.namespace);
        let config = watcher::Config::default().fields(&format!("metadata.name={}", resource.name));
        let stream = watcher::watcher(pods, config)
            .filter_map(|event| async move {
                match event {
                    Ok(Event::Apply(pod) | Event::InitApply(pod)) => {
                        Some(Ok(StateChange::Applied(ResourceState::Pod(Box::new(pod)))))
                    }
                    Ok(Event::Delete(_)) => Some(Ok(StateChange::Deleted)),
                    Ok(Event::Init | Event::InitDone) => None,
                    Err(e) => Some(Err(ApiError::from(e))),
                }
            })
            .boxed();
        Ok(stream)
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<DeleteOutcome, ApiError> {
        let api = self.dynamic(&resource.kind, &resource.namespace);
        match self
            .bounded("delete", api.delete(&resource.name, &DeleteParams::background()))
            .await
        {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(e) if e.is_not_found() => Ok(DeleteOutcome::AlreadyGone),
            Err(e) => Err(e),
        }
    }

    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<ListedObject>, ApiError> {
        let api: Api<DynamicObject> = match namespace {
            Some(ns) => self.dynamic(kind, ns),
            None => Api::all_with(self.client.clone(), &kind.api_resource()),
        };
        let params = ListParams::default().labels(label_selector);
        let objects = self.bounded("list", api.list(&params)).await?;
        Ok(objects
            .items
            .into_iter()
            .map(|object| {
                let creation_timestamp = creation_time(&object.metadata);
                let meta = object.metadata;
                ListedObject {
                    resource: ResourceRef::new(
                        kind.clone(),
                        meta.namespace.unwrap_or_default(),
                        meta.name.unwrap_or_default(),
                    ),
                    uid: meta.uid,
                    labels: meta.labels.unwrap_or_default(),
                    annotations: meta.annotations.unwrap_or_default(),
                    creation_timestamp,
                    owner_uids: meta
                        .owner_references
                        .unwrap_or_default()
                        .into_iter()
                        .map(|owner| owner.uid)
                        .collect(),
                }
            })
            .collect())
    }

    fn supports_watch(&self, kind: &ResourceKind) -> bool {
        // Service readiness lives on Endpoints; other kinds are ready on creation
        *kind == ResourceKind::Pod
    }

    async fn open_port(&self, resource: &ResourceRef, port: u16) -> Result<BoxPortStream, ApiError> {
        let (pod, target_port) = match &resource.kind {
            ResourceKind::Pod => (resource.name.clone(), port),
            ResourceKind::Service => self.service_backend(resource, port).await?,
            other => {
                return Err(ApiError::terminal(format!("cannot forward ports of a {other}")));
            }
        };

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &resource.namespace);
        let mut forwarder = self
            .bounded("port-forward", pods.portforward(&pod, &[target_port]))
            .await?;
        let stream = forwarder.take_stream(target_port).ok_or_else(|| {
            ApiError::transient(format!("port-forward to {pod}:{target_port} has no stream"))
        })?;

        tokio::spawn(async move {
            if let Err(e) = forwarder.join().await {
                debug!("port-forward to {}:{} ended: {}", pod, target_port, e);
            }
        });
        let stream: BoxPortStream = Box::new(stream);
        Ok(stream)
    }

    async fn exec(
        &self,
        resource: &ResourceRef,
        container: Option<&str>,
        command: &[String],
        stdin: Option<Vec<u8>>,
    ) -> Result<ExecResult, ApiError> {
        if resource.kind != ResourceKind::Pod {
            return Err(ApiError::terminal(format!("cannot exec in a {}", resource.kind)));
        }
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &resource.namespace);
        let mut params = AttachParams::default()
            .stdin(stdin.is_some())
            .stdout(true)
            .stderr(true);
        if let Some(container) = container {
            params = params.container(container);
        }

        let mut process = self
            .bounded("exec", pods.exec(&resource.name, command.to_vec(), &params))
            .await?;
        let status = process.take_status();

        if let (Some(input), Some(mut writer)) = (stdin, process.stdin()) {
            writer
                .write_all(&input)
                .await
                .map_err(|e| ApiError::transient(format!("exec stdin write failed: {e}")))?;
            writer
                .shutdown()
                .await
                .map_err(|e| ApiError::transient(format!("exec stdin close failed: {e}")))?;
        }

        let (stdout, stderr) = tokio::join!(
            read_all(process.stdout()),
            read_all(process.stderr())
        );
        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        if let Err(e) = process.join().await {
            debug!("exec in {} ended: {}", resource, e);
        }

        Ok(ExecResult {
            exit_code: exit_code(status.as_ref()),
            stdout: stdout?,
            stderr: stderr?,
        })
    }

    async fn log_lines(
        &self,
        resource: &ResourceRef,
        container: Option<&str>,
    ) -> Result<BoxStream<'static, Result<String, ApiError>>, ApiError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &resource.namespace);
        let params = LogParams {
            follow: true,
            container: container.map(ToString::to_string),
            ..LogParams::default()
        };
        let reader = self
            .bounded("log stream", pods.log_stream(&resource.name, &params))
            .await?;
        Ok(reader
            .lines()
            .map_err(|e| ApiError::transient(format!("log stream failed: {e}")))
            .boxed())
    }
}

async fn read_all(reader: Option<impl AsyncRead + Unpin>) -> Result<Vec<u8>, ApiError> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(|e| ApiError::transient(format!("exec output read failed: {e}")))?;
    }
    Ok(buf)
}

/// Exit code carried by the final exec status; a missing status counts as failure
fn exit_code(status: Option<&Status>) -> i32 {
    let Some(status) = status else {
        return -1;
    };
    if status.status.as_deref() == Some("Success") {
        return 0;
    }
    status
        .details
        .as_ref()
        .and_then(|details| {
            details
                .causes
                .iter()
                .flatten()
                .find(|cause| cause.reason.as_deref() == Some("ExitCode"))
        })
        .and_then(|cause| cause.message.as_deref()?.trim().parse().ok())
        .unwrap_or(1)
}

/// `metadata.creationTimestamp` as a chrono instant
fn creation_time(meta: &ObjectMeta) -> Option<DateTime<Utc>> {
    let raw = serde_json::to_value(meta.creation_timestamp.as_ref()?).ok()?;
    DateTime::parse_from_rfc3339(raw.as_str()?)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
