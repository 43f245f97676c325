//! # Lifecycle Coordinator
//!
//! Entry point for the test-framework integration layer.
//!
//! ```text
//! begin_scope ─► resolve ─► acquire ─► (test runs) ─► release / end_scope
//!                             │
//!                             ├─ provision (sequential, rollback on failure)
//!                             ├─ await readiness (concurrent)
//!                             ├─ run setup steps (copy files, then commands)
//!                             └─ expose ports
//! ```
//!
//! `acquire` is all-or-nothing: on any failure the whole scope is torn down
//! before the error is returned. If the `acquire` future is dropped before it
//! completes, the same teardown runs on a spawned task.

pub mod registry;
mod scope;

pub use registry::ScopeRegistry;
pub use scope::{ObservedPhase, Scope, TrackedResource};

use crate::cluster::kube::KubeClusterApi;
use crate::cluster::{ApiError, ClusterApi, ExecResult, ResourceRef};
use crate::config::FixtureConfig;
use crate::error::{FixtureError, Result};
use crate::expose::{ConnectivityExposer, ExposeMode, NodePortEndpoint, Tunnel};
use crate::manifest::{
    FileSource, ManifestResolver, ManifestSource, ResourceKind, ResourceSpec, SetupStep,
};
use crate::observability::metrics;
use crate::provisioner::Provisioner;
use crate::readiness::{ReadinessResult, ReadinessWatcher};
use crate::teardown::{reaper, TeardownGuarantor, TeardownOutcome};
use futures::stream::BoxStream;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Shell used to write a file from stdin, creating its directory first
const COPY_SCRIPT: &str = r#"mkdir -p "$(dirname "$1")" && cat > "$1""#;

/// One port of an [`ExposurePlan`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRequest {
    pub logical_name: String,
    pub port: u16,
    /// `None` follows the configured default mode
    pub mode: Option<ExposeMode>,
}

/// Ports to expose after readiness
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExposurePlan {
    ports: Vec<PortRequest>,
}

impl ExposurePlan {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Nothing to expose
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Expose `port` of `logical_name` the configured way
    #[must_use]
    pub fn expose(self, logical_name: impl Into<String>, port: u16) -> Self {
        self.push(logical_name.into(), port, None)
    }

    /// Expose `port` of the pod `logical_name` through a NodePort Service
    #[must_use]
    pub fn expose_node_port(self, logical_name: impl Into<String>, port: u16) -> Self {
        self.push(logical_name.into(), port, Some(ExposeMode::NodePort))
    }

    /// Expose `port` of `logical_name` through a local tunnel
    #[must_use]
    pub fn expose_port_forward(self, logical_name: impl Into<String>, port: u16) -> Self {
        self.push(logical_name.into(), port, Some(ExposeMode::PortForward))
    }

    fn push(mut self, logical_name: String, port: u16, mode: Option<ExposeMode>) -> Self {
        let entry = PortRequest {
            logical_name,
            port,
            mode,
        };
        if !self.ports.contains(&entry) {
            self.ports.push(entry);
        }
        self
    }

    #[must_use]
    pub fn ports(&self) -> &[PortRequest] {
        &self.ports
    }
}

struct ScopeCell {
    id: String,
    scope: Arc<tokio::sync::Mutex<Scope>>,
    resolver: ManifestResolver,
    cluster: Arc<dyn ClusterApi>,
    ended: AtomicBool,
}

/// Caller's reference to a scope started with [`LifecycleCoordinator::begin_scope`]
#[derive(Clone)]
pub struct ScopeHandle {
    cell: Arc<ScopeCell>,
}

impl std::fmt::Debug for ScopeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeHandle")
            .field("id", &self.cell.id)
            .field("ended", &self.is_ended())
            .finish()
    }
}

impl ScopeHandle {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.cell.id
    }

    /// Hash stamped into generated names and the scope label
    #[must_use]
    pub fn scope_hash(&self) -> &str {
        self.cell.resolver.scope_hash()
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.cell.ended.load(Ordering::SeqCst)
    }

    /// Snapshot of the tracked resources, in creation order
    pub async fn resources(&self) -> Vec<TrackedResource> {
        self.cell.scope.lock().await.resources().to_vec()
    }

    /// Follow the log of the pod with logical name `logical`
    pub async fn logs(
        &self,
        logical: &str,
        container: Option<&str>,
    ) -> Result<BoxStream<'static, std::result::Result<String, ApiError>>> {
        let target = {
            let scope = self.cell.scope.lock().await;
            scope
                .find(logical)
                .map(TrackedResource::resource_ref)
                .ok_or_else(|| FixtureError::UnknownResource(logical.to_string()))?
        };
        Ok(self.cell.cluster.log_lines(&target, container).await?)
    }

    /// Run `command` in the pod with logical name `logical` and wait for it to exit
    ///
    /// A non-zero exit is not an error; check [`ExecResult::exit_code`].
    pub async fn exec<S: AsRef<str>>(
        &self,
        logical: &str,
        container: Option<&str>,
        command: &[S],
    ) -> Result<ExecResult> {
        let target = self.pod(logical).await?;
        let command: Vec<String> = command.iter().map(|c| c.as_ref().to_string()).collect();
        Ok(self.cell.cluster.exec(&target, container, &command, None).await?)
    }

    /// Write `contents` to `destination` inside the pod with logical name `logical`
    pub async fn copy_to(
        &self,
        logical: &str,
        container: Option<&str>,
        destination: &str,
        contents: Vec<u8>,
    ) -> Result<()> {
        let target = self.pod(logical).await?;
        copy_into(self.cell.cluster.as_ref(), &target, container, destination, contents).await
    }

    async fn pod(&self, logical: &str) -> Result<ResourceRef> {
        let scope = self.cell.scope.lock().await;
        let resource = scope
            .find(logical)
            .ok_or_else(|| FixtureError::UnknownResource(logical.to_string()))?;
        if resource.spec.kind != ResourceKind::Pod {
            return Err(FixtureError::UnknownResource(format!("{logical} is not a pod")));
        }
        Ok(resource.resource_ref())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_ended() {
            Err(FixtureError::ScopeReleased(self.cell.id.clone()))
        } else {
            Ok(())
        }
    }
}

/// What `acquire` hands back to the test
#[derive(Debug, Clone)]
pub struct Handle {
    scope_id: String,
    resources: Vec<TrackedResource>,
    tunnels: Vec<Tunnel>,
    node_ports: Vec<NodePortEndpoint>,
}

impl Handle {
    #[must_use]
    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    /// Resources provisioned by this acquire, in creation order
    #[must_use]
    pub fn resources(&self) -> &[TrackedResource] {
        &self.resources
    }

    #[must_use]
    pub fn resource(&self, logical: &str) -> Option<&TrackedResource> {
        self.resources.iter().find(|r| r.logical_name() == logical)
    }

    /// Tunnel exposing `port` of `logical`
    pub fn tunnel(&self, logical: &str, port: u16) -> Result<&Tunnel> {
        self.tunnels
            .iter()
            .find(|t| t.logical_name() == logical && t.remote_port() == port)
            .ok_or_else(|| FixtureError::UnknownResource(format!("{logical}:{port}")))
    }

    /// Node port publishing `port` of `logical`
    pub fn node_port(&self, logical: &str, port: u16) -> Result<&NodePortEndpoint> {
        self.node_ports
            .iter()
            .find(|np| np.logical_name() == logical && np.remote_port() == port)
            .ok_or_else(|| FixtureError::UnknownResource(format!("{logical}:{port}")))
    }

    /// Address reaching `port` of `logical`, through a tunnel or a node port
    pub fn endpoint(&self, logical: &str, port: u16) -> Result<SocketAddr> {
        self.tunnel(logical, port)
            .map(Tunnel::endpoint)
            .or_else(|_| self.node_port(logical, port).map(NodePortEndpoint::endpoint))
    }

    #[must_use]
    pub fn tunnels(&self) -> &[Tunnel] {
        &self.tunnels
    }

    #[must_use]
    pub fn node_ports(&self) -> &[NodePortEndpoint] {
        &self.node_ports
    }
}

/// Tears the scope down on a spawned task if `acquire` is dropped mid-flight
struct AcquireGuard {
    scope: Arc<tokio::sync::Mutex<Scope>>,
    teardown: TeardownGuarantor,
    armed: bool,
}

impl AcquireGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AcquireGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!("acquire cancelled outside a runtime; scope left for expiry reaping");
            return;
        };
        let scope = Arc::clone(&self.scope);
        let teardown = self.teardown.clone();
        warn!("acquire cancelled, tearing down scope in the background");
        runtime.spawn(async move {
            let mut scope = scope.lock().await;
            teardown.teardown(&mut scope).await;
        });
    }
}

/// Drives resolve, provision, readiness, exposure and teardown
#[derive(Clone)]
pub struct LifecycleCoordinator {
    cluster: Arc<dyn ClusterApi>,
    config: FixtureConfig,
    provisioner: Provisioner,
    readiness: ReadinessWatcher,
    exposer: ConnectivityExposer,
    teardown: TeardownGuarantor,
    registry: Arc<ScopeRegistry>,
}

impl std::fmt::Debug for LifecycleCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleCoordinator")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl LifecycleCoordinator {
    /// Coordinator over `cluster`, registering scopes in the global registry
    pub fn new(cluster: Arc<dyn ClusterApi>, config: FixtureConfig) -> Self {
        Self::with_registry(cluster, config, ScopeRegistry::global())
    }

    pub fn with_registry(
        cluster: Arc<dyn ClusterApi>,
        config: FixtureConfig,
        registry: Arc<ScopeRegistry>,
    ) -> Self {
        Self {
            provisioner: Provisioner::new(Arc::clone(&cluster), &config),
            readiness: ReadinessWatcher::new(Arc::clone(&cluster), &config),
            exposer: ConnectivityExposer::new(Arc::clone(&cluster), &config),
            teardown: TeardownGuarantor::new(Arc::clone(&cluster), &config),
            cluster,
            config,
            registry,
        }
    }

    /// Connect to the cluster selected by `config` and reap expired scopes
    pub async fn connect(config: FixtureConfig) -> Result<Self> {
        let cluster: Arc<dyn ClusterApi> = Arc::new(KubeClusterApi::from_config(&config).await?);
        let coordinator = Self::new(cluster, config);
        match reaper::reap_expired(coordinator.cluster.as_ref(), Some(&coordinator.config.namespace)).await {
            Ok(outcome) if !outcome.is_complete() => {
                warn!("Could not reap {} expired object(s)", outcome.failed.len());
            }
            Ok(_) => {}
            Err(e) => warn!("Skipping expiry reaping: {}", e),
        }
        Ok(coordinator)
    }

    #[must_use]
    pub fn config(&self) -> &FixtureConfig {
        &self.config
    }

    #[must_use]
    pub fn cluster(&self) -> Arc<dyn ClusterApi> {
        Arc::clone(&self.cluster)
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ScopeRegistry> {
        &self.registry
    }

    /// Start a scope; fails with `ScopeActive` if `id` is already in use
    pub fn begin_scope(&self, id: impl Into<String>) -> Result<ScopeHandle> {
        let id = id.into();
        let scope = Arc::new(tokio::sync::Mutex::new(Scope::new(id.clone())));
        self.registry
            .register(&id, Arc::clone(&scope), self.teardown.clone())?;
        info!("📦 Scope '{}' started", id);
        Ok(ScopeHandle {
            cell: Arc::new(ScopeCell {
                resolver: ManifestResolver::new(&id, &self.config),
                id,
                scope,
                cluster: Arc::clone(&self.cluster),
                ended: AtomicBool::new(false),
            }),
        })
    }

    /// Turn `source` into specs owned by `handle`'s scope
    pub fn resolve(&self, handle: &ScopeHandle, source: &ManifestSource) -> Result<Vec<ResourceSpec>> {
        handle.ensure_open()?;
        handle.cell.resolver.resolve(source)
    }

    /// Provision `specs`, wait until they are ready and expose `plan`
    #[instrument(skip_all, fields(scope = %handle.id(), resources = specs.len()))]
    pub async fn acquire(
        &self,
        handle: &ScopeHandle,
        specs: Vec<ResourceSpec>,
        plan: &ExposurePlan,
    ) -> Result<Handle> {
        handle.ensure_open()?;
        let mut guard = AcquireGuard {
            scope: Arc::clone(&handle.cell.scope),
            teardown: self.teardown.clone(),
            armed: true,
        };

        let result = self.acquire_inner(handle, specs, plan).await;
        guard.disarm();

        match result {
            Ok(acquired) => {
                info!(
                    "🚀 Scope '{}' acquired {} resource(s), {} tunnel(s), {} node port(s)",
                    handle.id(),
                    acquired.resources.len(),
                    acquired.tunnels.len(),
                    acquired.node_ports.len()
                );
                Ok(acquired)
            }
            Err(e) => {
                metrics::increment_acquire_failures();
                error!("❌ Acquire in scope '{}' failed: {}", handle.id(), e);
                let outcome = self.release(handle).await;
                if !outcome.is_complete() {
                    warn!(
                        "Rollback of scope '{}' left {} object(s) for later teardown",
                        handle.id(),
                        outcome.failed.len()
                    );
                }
                Err(e)
            }
        }
    }

    async fn acquire_inner(
        &self,
        handle: &ScopeHandle,
        specs: Vec<ResourceSpec>,
        plan: &ExposurePlan,
    ) -> Result<Handle> {
        if let Some(foreign) = specs.iter().find(|s| s.scope_id != handle.id()) {
            return Err(FixtureError::MalformedManifest(format!(
                "{} was resolved for scope '{}', not '{}'",
                foreign.name,
                foreign.scope_id,
                handle.id()
            )));
        }
        if let Some(spec) = specs
            .iter()
            .find(|s| !s.setup.is_empty() && s.kind != ResourceKind::Pod)
        {
            return Err(FixtureError::MalformedManifest(format!(
                "{}: setup steps apply to pods only, not {}",
                spec.name, spec.kind
            )));
        }

        let mut scope = handle.cell.scope.lock().await;
        let created = self.provisioner.provision(&mut scope, specs).await?;

        let waits = created.iter().map(|resource| {
            let timeout = resource
                .spec
                .readiness_timeout
                .unwrap_or_else(|| self.config.readiness_timeout());
            async move { (timeout, self.readiness.await_ready(resource, timeout).await) }
        });
        let results = futures::future::join_all(waits).await;

        let mut first_error = None;
        for (resource, (timeout, result)) in created.iter().zip(results) {
            let phase = match &result {
                ReadinessResult::Ready => ObservedPhase::Ready,
                ReadinessResult::TimedOut => ObservedPhase::Pending,
                ReadinessResult::Failed(_) => ObservedPhase::Failed,
            };
            scope.set_phase(&resource.uid, phase);
            if first_error.is_some() {
                continue;
            }
            first_error = match result {
                ReadinessResult::Ready => None,
                ReadinessResult::TimedOut => Some(FixtureError::TimedOut {
                    resource: resource.resource_ref(),
                    timeout,
                }),
                ReadinessResult::Failed(reason) => Some(FixtureError::ResourceFailed {
                    resource: resource.resource_ref(),
                    reason,
                }),
            };
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        for resource in &created {
            self.run_setup(resource).await?;
        }

        let mut tunnels = Vec::new();
        let mut node_ports = Vec::new();
        for request in plan.ports() {
            let logical = &request.logical_name;
            let port = request.port;
            let tracked = scope
                .find(logical)
                .cloned()
                .ok_or_else(|| FixtureError::UnknownResource(logical.clone()))?;
            match request.mode.unwrap_or(self.config.expose_mode) {
                ExposeMode::PortForward => {
                    let existing = scope
                        .tunnels()
                        .iter()
                        .find(|t| {
                            t.resource() == &tracked.resource_ref()
                                && t.remote_port() == port
                                && !t.is_closed()
                        })
                        .cloned();
                    let tunnel = match existing {
                        Some(tunnel) => tunnel,
                        None => {
                            let tunnel = self.exposer.expose(&tracked, port).await?;
                            scope.push_tunnel(tunnel.clone());
                            tunnel
                        }
                    };
                    tunnels.push(tunnel);
                }
                ExposeMode::NodePort => {
                    let existing = scope
                        .node_ports()
                        .iter()
                        .find(|np| np.pod() == &tracked.resource_ref() && np.remote_port() == port)
                        .cloned();
                    let endpoint = match existing {
                        Some(endpoint) => endpoint,
                        None => {
                            let endpoint = self.publish_node_port(handle, &mut scope, &tracked, port).await?;
                            scope.push_node_port(endpoint.clone());
                            endpoint
                        }
                    };
                    node_ports.push(endpoint);
                }
            }
        }

        let resources = created
            .iter()
            .filter_map(|c| scope.resources().iter().find(|r| r.uid == c.uid).cloned())
            .collect();
        Ok(Handle {
            scope_id: handle.id().to_string(),
            resources,
            tunnels,
            node_ports,
        })
    }

    /// Create a NodePort Service for `port` of `pod` and wait until it routes
    async fn publish_node_port(
        &self,
        handle: &ScopeHandle,
        scope: &mut Scope,
        pod: &TrackedResource,
        port: u16,
    ) -> Result<NodePortEndpoint> {
        if !pod.is_ready() {
            return Err(FixtureError::ExposeFailed {
                resource: pod.resource_ref().to_string(),
                port,
                reason: format!("resource is {}, not Ready", pod.phase),
            });
        }
        let spec = self.exposer.node_port_spec(&handle.cell.resolver, pod, port)?;
        let service = self
            .provisioner
            .provision(scope, vec![spec])
            .await?
            .remove(0);

        let timeout = self.config.readiness_timeout();
        match self.readiness.await_ready(&service, timeout).await {
            ReadinessResult::Ready => scope.set_phase(&service.uid, ObservedPhase::Ready),
            ReadinessResult::TimedOut => {
                return Err(FixtureError::TimedOut {
                    resource: service.resource_ref(),
                    timeout,
                })
            }
            ReadinessResult::Failed(reason) => {
                return Err(FixtureError::ResourceFailed {
                    resource: service.resource_ref(),
                    reason,
                })
            }
        }
        self.exposer.node_port_endpoint(pod, &service, port).await
    }

    /// Copy files, then run commands, in the order the spec lists them
    async fn run_setup(&self, resource: &TrackedResource) -> Result<()> {
        let target = resource.resource_ref();
        for step in &resource.spec.setup {
            match step {
                SetupStep::CopyFile {
                    container,
                    source,
                    destination,
                } => {
                    let contents = match source {
                        FileSource::Path(path) => tokio::fs::read(path).await?,
                        FileSource::Bytes(bytes) => bytes.clone(),
                    };
                    copy_into(
                        self.cluster.as_ref(),
                        &target,
                        container.as_deref(),
                        destination,
                        contents,
                    )
                    .await?;
                    debug!("copied {} into {}", destination, target);
                }
                SetupStep::Exec { container, command } => {
                    match self.cluster.exec(&target, container.as_deref(), command, None).await {
                        Ok(result) if result.success() => debug!("ran {:?} in {}", command, target),
                        Ok(result) => warn!(
                            "Command {:?} in {} exited with {}: {}",
                            command,
                            target,
                            result.exit_code,
                            result.stderr_str().trim()
                        ),
                        Err(e) => warn!("Command {:?} in {} failed: {}", command, target, e),
                    }
                }
            }
        }
        Ok(())
    }

    /// Tear down everything in `handle`'s scope
    ///
    /// Safe to call repeatedly; never fails. Anything that could not be
    /// deleted is reported in the outcome and retried by the next call.
    #[instrument(skip_all, fields(scope = %handle.id()))]
    pub async fn release(&self, handle: &ScopeHandle) -> TeardownOutcome {
        let mut scope = handle.cell.scope.lock().await;
        self.teardown.teardown(&mut scope).await
    }

    /// Release the scope and retire its id
    ///
    /// The id stays registered if teardown was incomplete, so that
    /// [`ScopeRegistry::teardown_all`] retries it at exit.
    pub async fn end_scope(&self, handle: ScopeHandle) -> TeardownOutcome {
        handle.cell.ended.store(true, Ordering::SeqCst);
        let outcome = self.release(&handle).await;
        if outcome.is_complete() {
            self.registry.unregister(handle.id());
        }
        info!("📦 Scope '{}' ended", handle.id());
        outcome
    }
}

/// Stream `contents` into `destination` through `sh`
async fn copy_into(
    cluster: &dyn ClusterApi,
    target: &ResourceRef,
    container: Option<&str>,
    destination: &str,
    contents: Vec<u8>,
) -> Result<()> {
    let failed = |reason: String| FixtureError::SetupFailed {
        resource: target.clone(),
        reason,
    };
    let command = copy_command(destination);
    let result = cluster
        .exec(target, container, &command, Some(contents))
        .await
        .map_err(|e| failed(format!("copy to {destination}: {e}")))?;
    if !result.success() {
        return Err(failed(format!(
            "copy to {destination} exited with {}: {}",
            result.exit_code,
            result.stderr_str().trim()
        )));
    }
    Ok(())
}

fn copy_command(destination: &str) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        COPY_SCRIPT.to_string(),
        "kfx-copy".to_string(),
        destination.to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::{InMemoryCluster, PodScript};
    use std::time::Duration;

    const STACK: &str = r#"
apiVersion: v1
kind: Pod
metadata:
  name: db
  labels:
    app: db
spec:
  containers:
    - name: db
      image: postgres:16
---
apiVersion: v1
kind: Service
metadata:
  name: db-svc
spec:
  selector:
    app: db
  ports:
    - port: 5432
"#;

    fn coordinator(cluster: &InMemoryCluster) -> LifecycleCoordinator {
        LifecycleCoordinator::with_registry(
            Arc::new(cluster.clone()),
            FixtureConfig::default(),
            Arc::new(ScopeRegistry::new()),
        )
    }

    #[test]
    fn test_exposure_plan_dedups() {
        let plan = ExposurePlan::new().expose("db", 5432).expose("db", 5432);
        assert_eq!(plan.ports().len(), 1);
        assert!(ExposurePlan::none().ports().is_empty());
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let cluster = InMemoryCluster::new();
        let coordinator = coordinator(&cluster);
        let scope = coordinator.begin_scope("happy").unwrap();
        let specs = coordinator
            .resolve(&scope, &ManifestSource::Yaml(STACK.to_string()))
            .unwrap();

        let handle = coordinator
            .acquire(&scope, specs, &ExposurePlan::new().expose("db", 5432))
            .await
            .unwrap();
        assert_eq!(handle.resources().len(), 2);
        assert!(handle.resources().iter().all(TrackedResource::is_ready));
        assert!(handle.endpoint("db", 5432).unwrap().ip().is_loopback());
        assert!(matches!(
            handle.endpoint("cache", 6379),
            Err(FixtureError::UnknownResource(_))
        ));

        let outcome = coordinator.end_scope(scope).await;
        assert!(outcome.is_complete());
        assert_eq!(outcome.tunnels_closed, 1);
        assert!(cluster.objects().is_empty());
        assert!(!coordinator.registry().is_active("happy"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_scope_and_released_handle() {
        let cluster = InMemoryCluster::new();
        let coordinator = coordinator(&cluster);
        let scope = coordinator.begin_scope("dup").unwrap();
        assert!(matches!(
            coordinator.begin_scope("dup"),
            Err(FixtureError::ScopeActive(_))
        ));

        let stale = scope.clone();
        coordinator.end_scope(scope).await;
        assert!(matches!(
            coordinator.resolve(&stale, &ManifestSource::Yaml(STACK.to_string())),
            Err(FixtureError::ScopeReleased(_))
        ));
        assert!(coordinator.begin_scope("dup").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_timeout_tears_down() {
        let cluster = InMemoryCluster::new();
        cluster.script_pod("db", PodScript::stuck());
        let coordinator = coordinator(&cluster);
        let scope = coordinator.begin_scope("slow").unwrap();
        let specs: Vec<ResourceSpec> = coordinator
            .resolve(&scope, &ManifestSource::Yaml(STACK.to_string()))
            .unwrap()
            .into_iter()
            .map(|s| s.with_readiness_timeout(Duration::from_secs(10)))
            .collect();

        let err = coordinator
            .acquire(&scope, specs, &ExposurePlan::none())
            .await
            .unwrap_err();
        assert!(matches!(err, FixtureError::TimedOut { ref resource, .. } if resource.name.starts_with("db-")));
        assert!(cluster.objects().is_empty());
        assert!(scope.resources().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_specs_from_another_scope_rejected() {
        let cluster = InMemoryCluster::new();
        let coordinator = coordinator(&cluster);
        let a = coordinator.begin_scope("a").unwrap();
        let b = coordinator.begin_scope("b").unwrap();
        let specs = coordinator
            .resolve(&a, &ManifestSource::Yaml(STACK.to_string()))
            .unwrap();

        let err = coordinator.acquire(&b, specs, &ExposurePlan::none()).await.unwrap_err();
        assert!(matches!(err, FixtureError::MalformedManifest(_)));
        assert_eq!(cluster.create_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logs_by_logical_name() {
        use futures::StreamExt;

        let cluster = InMemoryCluster::new();
        let coordinator = coordinator(&cluster);
        let scope = coordinator.begin_scope("logs").unwrap();
        let specs = coordinator
            .resolve(&scope, &ManifestSource::Yaml(STACK.to_string()))
            .unwrap();
        coordinator
            .acquire(&scope, specs, &ExposurePlan::none())
            .await
            .unwrap();

        let pod = scope.resources().await[0].name().to_string();
        cluster.push_log("default", &pod, "hello");
        let mut logs = scope.logs("db", None).await.unwrap();
        assert_eq!(logs.next().await.unwrap().unwrap(), "hello");
        assert!(matches!(
            scope.logs("missing", None).await,
            Err(FixtureError::UnknownResource(_))
        ));
        coordinator.release(&scope).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_steps_run_after_readiness() {
        let cluster = InMemoryCluster::new();
        cluster.on_exec("db", |request| ExecResult {
            exit_code: i32::from(request.command[0] == "false"),
            ..ExecResult::default()
        });
        let coordinator = coordinator(&cluster);
        let scope = coordinator.begin_scope("setup").unwrap();
        let specs: Vec<ResourceSpec> = coordinator
            .resolve(&scope, &ManifestSource::Yaml(STACK.to_string()))
            .unwrap()
            .into_iter()
            .map(|spec| {
                if spec.kind != ResourceKind::Pod {
                    return spec;
                }
                spec.with_setup(SetupStep::CopyFile {
                    container: None,
                    source: FileSource::Bytes(b"max_connections = 5".to_vec()),
                    destination: "/etc/db/custom.conf".to_string(),
                })
                .with_setup(SetupStep::Exec {
                    container: Some("db".to_string()),
                    command: vec!["false".to_string()],
                })
            })
            .collect();

        coordinator
            .acquire(&scope, specs, &ExposurePlan::none())
            .await
            .unwrap();
        let execs = cluster.execs();
        assert_eq!(execs.len(), 2);
        assert_eq!(execs[0].command, copy_command("/etc/db/custom.conf"));
        assert_eq!(execs[0].stdin.as_deref(), Some(&b"max_connections = 5"[..]));
        assert_eq!(execs[1].command, vec!["false".to_string()]);

        let result = scope.exec("db", None, &["echo", "hi"]).await.unwrap();
        assert!(result.success());
        assert!(matches!(
            scope.exec("db-svc", None, &["true"]).await,
            Err(FixtureError::UnknownResource(_))
        ));
        coordinator.release(&scope).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_copy_aborts_acquire() {
        let cluster = InMemoryCluster::new();
        cluster.on_exec("db", |_| ExecResult {
            exit_code: 1,
            stdout: Vec::new(),
            stderr: b"read-only file system".to_vec(),
        });
        let coordinator = coordinator(&cluster);
        let scope = coordinator.begin_scope("bad-copy").unwrap();
        let specs: Vec<ResourceSpec> = coordinator
            .resolve(&scope, &ManifestSource::Yaml(STACK.to_string()))
            .unwrap()
            .into_iter()
            .map(|spec| {
                if spec.kind != ResourceKind::Pod {
                    return spec;
                }
                spec.with_setup(SetupStep::CopyFile {
                    container: None,
                    source: FileSource::Bytes(Vec::new()),
                    destination: "/etc/db/custom.conf".to_string(),
                })
            })
            .collect();

        let err = coordinator
            .acquire(&scope, specs, &ExposurePlan::none())
            .await
            .unwrap_err();
        match err {
            FixtureError::SetupFailed { reason, .. } => assert!(reason.contains("read-only")),
            other => panic!("expected SetupFailed, got {other:?}"),
        }
        assert!(cluster.objects().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_on_service_rejected() {
        let cluster = InMemoryCluster::new();
        let coordinator = coordinator(&cluster);
        let scope = coordinator.begin_scope("bad-setup").unwrap();
        let specs: Vec<ResourceSpec> = coordinator
            .resolve(&scope, &ManifestSource::Yaml(STACK.to_string()))
            .unwrap()
            .into_iter()
            .map(|spec| {
                spec.with_setup(SetupStep::Exec {
                    container: None,
                    command: vec!["true".to_string()],
                })
            })
            .collect();
        let err = coordinator.acquire(&scope, specs, &ExposurePlan::none()).await.unwrap_err();
        assert!(matches!(err, FixtureError::MalformedManifest(_)));
        assert_eq!(cluster.create_count(), 0);
    }

    #[tokio::test]
    async fn test_node_port_exposure() {
        let cluster = InMemoryCluster::new();
        let coordinator = coordinator(&cluster);
        let scope = coordinator.begin_scope("node-port").unwrap();
        let specs = coordinator
            .resolve(&scope, &ManifestSource::Yaml(STACK.to_string()))
            .unwrap();

        let plan = ExposurePlan::new().expose_node_port("db", 5432);
        let handle = coordinator.acquire(&scope, specs, &plan).await.unwrap();
        assert!(handle.tunnels().is_empty());
        let published = handle.node_port("db", 5432).unwrap();
        assert_eq!(handle.endpoint("db", 5432).unwrap(), published.endpoint());
        assert!(cluster.contains(published.service()));
        // Pod, Service and the NodePort Service, plus the anchor
        assert_eq!(cluster.objects().len(), 4);

        let again = coordinator
            .acquire(&scope, Vec::new(), &plan)
            .await
            .unwrap();
        assert_eq!(again.node_port("db", 5432).unwrap(), published);

        let outcome = coordinator.end_scope(scope).await;
        assert!(outcome.is_complete());
        assert!(cluster.objects().is_empty());
    }
}
