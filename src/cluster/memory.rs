//! # In-Memory Cluster
//!
//! A [`ClusterApi`] backed by a process-local object store. Used by the test
//! suite and for dry runs without a cluster.
//!
//! What it emulates:
//! - uid, resource version and creation timestamp assignment
//! - pod status progression, either immediately ready or driven by a [`PodScript`]
//! - service endpoints derived from ready pods matching the selector
//! - owner-reference cascade on delete (the garbage collector)
//! - Jobs with `activeDeadlineSeconds` and `ttlSecondsAfterFinished` are
//!   removed, with their dependents, once both have elapsed
//! - watches, label-selector listing, container logs
//! - port connections served by in-process handlers (echo by default)
//! - NodePort services, each port backed by a real listener on 127.0.0.1
//! - exec, answered by registered handlers (exit 0 by default) and recorded
//!
//! Faults can be injected per object-name prefix for create, delete and
//! port opening.

use super::{
    ApiError, BoxPortStream, ClusterApi, Created, DeleteOutcome, ExecResult, ListedObject,
    ResourceRef, ResourceState, StateChange,
};
use crate::manifest::{ResourceKind, ResourceSpec};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use kube::api::DynamicObject;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 1024;
const DUPLEX_BUFFER: usize = 64 * 1024;
/// Address reported as every pod's `hostIP`; node ports listen here
const NODE_ADDRESS: &str = "127.0.0.1";

/// One pod status transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodStep {
    Pending,
    /// Phase `Running`; `ready` sets the Ready condition and every container's ready flag
    Running { ready: bool },
    /// Containers waiting with `reason` (e.g. `CrashLoopBackOff`)
    Waiting { reason: String },
    Failed { reason: String },
    Succeeded,
    /// Append a line to the pod's log
    Log(String),
    /// Remove the pod, as an eviction or external delete would
    Delete,
}

/// Timed sequence of pod status transitions
///
/// Each delay is relative to the previous step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodScript {
    steps: Vec<(Duration, PodStep)>,
}

impl PodScript {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pending at creation, ready after `delay`
    #[must_use]
    pub fn ready_after(delay: Duration) -> Self {
        Self::new().then(delay, PodStep::Running { ready: true })
    }

    /// Never leaves Pending
    #[must_use]
    pub fn stuck() -> Self {
        Self::new()
    }

    #[must_use]
    pub fn then(mut self, delay: Duration, step: PodStep) -> Self {
        self.steps.push((delay, step));
        self
    }
}

struct StoredObject {
    object: DynamicObject,
    uid: String,
    created_at: DateTime<Utc>,
}

struct Fault {
    prefix: String,
    error: ApiError,
    remaining: usize,
    after_commit: bool,
}

type PortHandler = Arc<dyn Fn(DuplexStream) -> BoxFuture<'static, ()> + Send + Sync>;

type ExecHandler = Arc<dyn Fn(&ExecRequest) -> ExecResult + Send + Sync>;

/// One command run through [`ClusterApi::exec`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub pod: ResourceRef,
    pub container: Option<String>,
    pub command: Vec<String>,
    pub stdin: Option<Vec<u8>>,
}

#[derive(Default)]
struct State {
    objects: HashMap<ResourceRef, StoredObject>,
    next_uid: u64,
    next_version: u64,
    scripts: Vec<(String, PodScript)>,
    create_faults: Vec<Fault>,
    delete_faults: Vec<Fault>,
    port_faults: Vec<Fault>,
    port_handlers: Vec<(String, u16, PortHandler)>,
    port_tasks: HashMap<ResourceRef, Vec<AbortHandle>>,
    exec_handlers: Vec<(String, ExecHandler)>,
    execs: Vec<ExecRequest>,
    logs: HashMap<ResourceRef, Vec<String>>,
    creates: usize,
    deletions: usize,
    watch_disabled: bool,
    watch_fails: bool,
}

struct Inner {
    state: Mutex<State>,
    changes: broadcast::Sender<ResourceRef>,
    log_lines: broadcast::Sender<(ResourceRef, String)>,
}

/// In-memory [`ClusterApi`]
#[derive(Clone)]
pub struct InMemoryCluster {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for InMemoryCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("InMemoryCluster")
            .field("objects", &state.objects.len())
            .field("creates", &state.creates)
            .field("deletions", &state.deletions)
            .finish()
    }
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCluster {
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (log_lines, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                changes,
                log_lines,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.inner.state)
    }

    /// Drive pods whose name starts with `prefix` through `script` instead of making them ready at once
    pub fn script_pod(&self, prefix: &str, script: PodScript) {
        self.state().scripts.push((prefix.to_string(), script));
    }

    /// Fail the next `times` creates of objects named `prefix*` with `error`
    pub fn fail_create(&self, prefix: &str, error: ApiError, times: usize) {
        self.state().create_faults.push(Fault {
            prefix: prefix.to_string(),
            error,
            remaining: times,
            after_commit: false,
        });
    }

    /// Store the next `times` creates of `prefix*` but report `error`, as a lost response would
    pub fn fail_create_after_commit(&self, prefix: &str, error: ApiError, times: usize) {
        self.state().create_faults.push(Fault {
            prefix: prefix.to_string(),
            error,
            remaining: times,
            after_commit: true,
        });
    }

    /// Fail the next `times` deletes of `prefix*` with `error`
    pub fn fail_delete(&self, prefix: &str, error: ApiError, times: usize) {
        self.state().delete_faults.push(Fault {
            prefix: prefix.to_string(),
            error,
            remaining: times,
            after_commit: false,
        });
    }

    /// Fail the next `times` port opens on `prefix*` with `error`
    pub fn fail_open_port(&self, prefix: &str, error: ApiError, times: usize) {
        self.state().port_faults.push(Fault {
            prefix: prefix.to_string(),
            error,
            remaining: times,
            after_commit: false,
        });
    }

    /// Serve connections to `port` on pods named `prefix*` with `handler`
    ///
    /// Ports without a handler echo their input.
    pub fn serve_port<F, Fut>(&self, prefix: &str, port: u16, handler: F)
    where
        F: Fn(DuplexStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: PortHandler = Arc::new(move |stream| Box::pin(handler(stream)));
        self.state()
            .port_handlers
            .push((prefix.to_string(), port, handler));
    }

    /// Answer commands run in pods named `prefix*` with `handler`
    ///
    /// Commands without a handler succeed with empty output.
    pub fn on_exec<F>(&self, prefix: &str, handler: F)
    where
        F: Fn(&ExecRequest) -> ExecResult + Send + Sync + 'static,
    {
        self.state()
            .exec_handlers
            .push((prefix.to_string(), Arc::new(handler)));
    }

    /// Commands run so far, oldest first
    #[must_use]
    pub fn execs(&self) -> Vec<ExecRequest> {
        self.state().execs.clone()
    }

    /// Report watches as unsupported so readiness falls back to polling
    pub fn disable_watch(&self) {
        self.state().watch_disabled = true;
    }

    /// Make every watch stream fail right after its first event
    pub fn break_watches(&self) {
        self.state().watch_fails = true;
    }

    /// Apply a status step to a pod right away; false if the pod does not exist
    pub fn set_pod_step(&self, namespace: &str, name: &str, step: PodStep) -> bool {
        let resource = ResourceRef::new(ResourceKind::Pod, namespace, name);
        let uid = match self.state().objects.get(&resource) {
            Some(stored) => stored.uid.clone(),
            None => return false,
        };
        self.inner.apply_step(&resource, &uid, &step) != StepOutcome::Gone
    }

    /// Append a line to a pod's log
    pub fn push_log(&self, namespace: &str, name: &str, line: &str) -> bool {
        self.set_pod_step(namespace, name, PodStep::Log(line.to_string()))
    }

    /// Whether an object exists
    #[must_use]
    pub fn contains(&self, resource: &ResourceRef) -> bool {
        self.state().objects.contains_key(resource)
    }

    /// Stored manifest of an object
    #[must_use]
    pub fn object(&self, resource: &ResourceRef) -> Option<DynamicObject> {
        self.state()
            .objects
            .get(resource)
            .map(|stored| stored.object.clone())
    }

    /// Every stored object, sorted by kind then name
    #[must_use]
    pub fn objects(&self) -> Vec<ResourceRef> {
        let mut refs: Vec<_> = self.state().objects.keys().cloned().collect();
        refs.sort_by(|a, b| {
            (a.kind.kind_name(), &a.namespace, &a.name).cmp(&(
                b.kind.kind_name(),
                &b.namespace,
                &b.name,
            ))
        });
        refs
    }

    /// Objects carrying `label=value`
    #[must_use]
    pub fn objects_labeled(&self, label: &str, value: &str) -> Vec<ResourceRef> {
        self.objects()
            .into_iter()
            .filter(|r| {
                self.object(r)
                    .and_then(|o| o.metadata.labels)
                    .is_some_and(|labels| labels.get(label).map(String::as_str) == Some(value))
            })
            .collect()
    }

    /// Successful creates so far
    #[must_use]
    pub fn create_count(&self) -> usize {
        self.state().creates
    }

    /// Objects removed so far, cascades included
    #[must_use]
    pub fn deletion_count(&self) -> usize {
        self.state().deletions
    }

    fn snapshot(&self, resource: &ResourceRef) -> Result<ResourceState, ApiError> {
        let state = self.state();
        let Some(stored) = state.objects.get(resource) else {
            return Ok(ResourceState::Absent);
        };

        match resource.kind {
            ResourceKind::Pod => Ok(ResourceState::Pod(Box::new(to_typed(&stored.object)?))),
            ResourceKind::Service => {
                let service: k8s_openapi::api::core::v1::Service = to_typed(&stored.object)?;
                let ready_endpoints = ready_endpoints(&state, &resource.namespace, &stored.object);
                Ok(ResourceState::Service {
                    service: Box::new(service),
                    ready_endpoints,
                })
            }
            _ => Ok(ResourceState::Present {
                uid: Some(stored.uid.clone()),
            }),
        }
    }

    fn change_for(&self, resource: &ResourceRef) -> Result<StateChange, ApiError> {
        match self.snapshot(resource)? {
            ResourceState::Absent => Ok(StateChange::Deleted),
            state => Ok(StateChange::Applied(state)),
        }
    }

    /// Remove a Job and its dependents once its deadline and finished-TTL have passed
    fn spawn_expiry(&self, resource: ResourceRef, uid: String, lifetime: Duration) {
        let inner = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(lifetime).await;
            if let Some(inner) = inner.upgrade() {
                inner.expire(&resource, &uid);
            }
        });
    }

    fn serve_node_ports(&self, service: &ResourceRef, listeners: Vec<(u16, TcpListener)>) {
        for (service_port, listener) in listeners {
            let inner = Arc::downgrade(&self.inner);
            let target = service.clone();
            let task = tokio::spawn(accept_node_port(inner, target, service_port, listener));
            self.state()
                .port_tasks
                .entry(service.clone())
                .or_default()
                .push(task.abort_handle());
        }
    }

    fn spawn_script(&self, resource: ResourceRef, uid: String, script: PodScript) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            for (delay, step) in script.steps {
                tokio::time::sleep(delay).await;
                if inner.apply_step(&resource, &uid, &step) != StepOutcome::Applied {
                    break;
                }
            }
        });
    }
}

/// What [`Inner::apply_step`] did to the pod
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    Applied,
    /// The step was [`PodStep::Delete`] and removed the pod
    Deleted,
    /// The pod (or this incarnation of it) no longer exists
    Gone,
}

impl Inner {
    /// Remove `resource` and its dependents if it is still the incarnation with `uid`
    fn expire(&self, resource: &ResourceRef, uid: &str) {
        let mut state = lock(&self.state);
        if !state.objects.get(resource).is_some_and(|stored| stored.uid == uid) {
            return;
        }
        let removed = remove_cascade(&mut state, resource);
        drop(state);
        debug!("in-memory expiry of {} removed {} object(s)", resource, removed.len());
        for gone in removed {
            let _ = self.changes.send(gone);
        }
    }

    /// Pod and pod port serving `port` of `resource` (a pod or a service)
    fn route(&self, resource: &ResourceRef, port: u16) -> Result<(ResourceRef, u16), ApiError> {
        let state = lock(&self.state);
        let stored = state.objects.get(resource).ok_or_else(|| {
            ApiError::terminal(format!("{resource} not found")).with_status(404, "NotFound")
        })?;
        match &resource.kind {
            ResourceKind::Pod => {
                if !pod_is_running(&stored.object) {
                    return Err(ApiError::transient(format!("{resource} is not running")));
                }
                Ok((resource.clone(), port))
            }
            ResourceKind::Service => {
                let target_port = service_target_port(&stored.object, port);
                let pod = backing_pods(&state, &resource.namespace, &stored.object)
                    .into_iter()
                    .next()
                    .ok_or_else(|| ApiError::transient(format!("{resource} has no ready endpoints")))?;
                Ok((pod, target_port))
            }
            other => Err(ApiError::terminal(format!("cannot forward ports of a {other}"))),
        }
    }

    /// Connect to `target_port` on `pod`, served by its handler or by echo
    fn dial(&self, pod: ResourceRef, target_port: u16) -> DuplexStream {
        let handler = lock(&self.state)
            .port_handlers
            .iter()
            .find(|(prefix, p, _)| *p == target_port && pod.name.starts_with(prefix.as_str()))
            .map(|(_, _, handler)| Arc::clone(handler));

        let (client, server) = tokio::io::duplex(DUPLEX_BUFFER);
        let task = match handler {
            Some(handler) => tokio::spawn(handler(server)),
            None => tokio::spawn(echo(server)),
        };
        debug!("in-memory port-forward {}:{}", pod, target_port);
        lock(&self.state)
            .port_tasks
            .entry(pod)
            .or_default()
            .push(task.abort_handle());
        client
    }

    /// Apply one step to the pod with `uid`
    fn apply_step(&self, resource: &ResourceRef, uid: &str, step: &PodStep) -> StepOutcome {
        let mut state = lock(&self.state);
        let alive = state
            .objects
            .get(resource)
            .is_some_and(|stored| stored.uid == uid);
        if !alive {
            return StepOutcome::Gone;
        }

        match step {
            PodStep::Log(line) => {
                state
                    .logs
                    .entry(resource.clone())
                    .or_default()
                    .push(line.clone());
                let _ = self.log_lines.send((resource.clone(), line.clone()));
                return StepOutcome::Applied;
            }
            PodStep::Delete => {
                let removed = remove_cascade(&mut state, resource);
                drop(state);
                for gone in removed {
                    let _ = self.changes.send(gone);
                }
                return StepOutcome::Deleted;
            }
            _ => {
                let version = next_version(&mut state);
                if let Some(stored) = state.objects.get_mut(resource) {
                    let containers = container_names(&stored.object);
                    if let Some(status) = pod_status(step, &containers) {
                        set_field(&mut stored.object, "status", status);
                    }
                    stored.object.metadata.resource_version = Some(version);
                }
            }
        }
        drop(state);
        let _ = self.changes.send(resource.clone());
        StepOutcome::Applied
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    async fn create(&self, spec: &ResourceSpec) -> Result<Created, ApiError> {
        let resource = spec.resource_ref();
        if resource.namespace.is_empty() || resource.name.is_empty() {
            return Err(ApiError::terminal("name and namespace are required").with_status(422, "Invalid"));
        }

        let mut object = spec.payload.clone();
        let node_ports = if is_node_port_service(&resource, &object) {
            bind_node_ports(&mut object).await?
        } else {
            Vec::new()
        };
        let expiry = (resource.kind == ResourceKind::Job)
            .then(|| job_lifetime(&object))
            .flatten();

        let (created, script, lost_response) = {
            let mut state = self.state();
            let fault = take_fault(&mut state.create_faults, &resource.name);
            if let Some(fault) = &fault {
                if !fault.after_commit {
                    return Err(fault.error.clone());
                }
            }
            if state.objects.contains_key(&resource) {
                return Err(ApiError::terminal(format!("{resource} already exists"))
                    .with_status(409, "AlreadyExists"));
            }

            state.next_uid += 1;
            let uid = format!("uid-{:06}", state.next_uid);
            let version = next_version(&mut state);
            let created_at = Utc::now();

            object.metadata.uid = Some(uid.clone());
            object.metadata.resource_version = Some(version.clone());

            let script = if resource.kind == ResourceKind::Pod {
                let script = state
                    .scripts
                    .iter()
                    .find(|(prefix, _)| resource.name.starts_with(prefix.as_str()))
                    .map(|(_, script)| script.clone());
                let initial = if script.is_some() {
                    PodStep::Pending
                } else {
                    PodStep::Running { ready: true }
                };
                let containers = container_names(&object);
                if let Some(status) = pod_status(&initial, &containers) {
                    set_field(&mut object, "status", status);
                }
                script
            } else {
                None
            };

            state.objects.insert(
                resource.clone(),
                StoredObject {
                    object,
                    uid: uid.clone(),
                    created_at,
                },
            );
            state.creates += 1;
            debug!("in-memory create {} ({})", resource, uid);

            let created = Created {
                uid,
                resource_version: Some(version),
                creation_timestamp: created_at,
            };
            (created, script, fault.map(|f| f.error))
        };

        let _ = self.inner.changes.send(resource.clone());
        if !node_ports.is_empty() {
            self.serve_node_ports(&resource, node_ports);
        }
        if let Some(lifetime) = expiry {
            self.spawn_expiry(resource.clone(), created.uid.clone(), lifetime);
        }
        if let Some(script) = script {
            self.spawn_script(resource, created.uid.clone(), script);
        }
        match lost_response {
            Some(error) => Err(error),
            None => Ok(created),
        }
    }

    async fn get(&self, resource: &ResourceRef) -> Result<ResourceState, ApiError> {
        self.snapshot(resource)
    }

    async fn watch(
        &self,
        resource: &ResourceRef,
    ) -> Result<BoxStream<'static, Result<StateChange, ApiError>>, ApiError> {
        let rx = self.inner.changes.subscribe();
        let first = self.change_for(resource);
        if self.state().watch_fails {
            return Ok(stream::iter(vec![
                first,
                Err(ApiError::transient("watch stream reset")),
            ])
            .boxed());
        }

        let cluster = self.clone();
        let target = resource.clone();
        let updates = stream::unfold((rx, cluster, target), |(mut rx, cluster, target)| async move {
            loop {
                match rx.recv().await {
                    Ok(changed) if changed == target => {
                        let change = cluster.change_for(&target);
                        return Some((change, (rx, cluster, target)));
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        let change = cluster.change_for(&target);
                        return Some((change, (rx, cluster, target)));
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream::once(async move { first }).chain(updates).boxed())
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<DeleteOutcome, ApiError> {
        let removed = {
            let mut state = self.state();
            if let Some(fault) = take_fault(&mut state.delete_faults, &resource.name) {
                return Err(fault.error);
            }
            if !state.objects.contains_key(resource) {
                return Ok(DeleteOutcome::AlreadyGone);
            }
            remove_cascade(&mut state, resource)
        };
        debug!("in-memory delete {} removed {} object(s)", resource, removed.len());
        for gone in removed {
            let _ = self.inner.changes.send(gone);
        }
        Ok(DeleteOutcome::Deleted)
    }

    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<ListedObject>, ApiError> {
        let selector = parse_selector(label_selector)?;
        let state = self.state();
        let mut listed: Vec<ListedObject> = state
            .objects
            .iter()
            .filter(|(r, _)| &r.kind == kind)
            .filter(|(r, _)| namespace.is_none_or(|ns| r.namespace == ns))
            .filter(|(_, stored)| {
                let empty = BTreeMap::new();
                let labels = stored.object.metadata.labels.as_ref().unwrap_or(&empty);
                selector.iter().all(|req| req.matches(labels))
            })
            .map(|(r, stored)| ListedObject {
                resource: r.clone(),
                uid: Some(stored.uid.clone()),
                labels: stored.object.metadata.labels.clone().unwrap_or_default(),
                annotations: stored.object.metadata.annotations.clone().unwrap_or_default(),
                creation_timestamp: Some(stored.created_at),
                owner_uids: stored
                    .object
                    .metadata
                    .owner_references
                    .iter()
                    .flatten()
                    .map(|owner| owner.uid.clone())
                    .collect(),
            })
            .collect();
        listed.sort_by(|a, b| a.resource.name.cmp(&b.resource.name));
        Ok(listed)
    }

    fn supports_watch(&self, _kind: &ResourceKind) -> bool {
        !self.state().watch_disabled
    }

    async fn open_port(&self, resource: &ResourceRef, port: u16) -> Result<BoxPortStream, ApiError> {
        if let Some(fault) = take_fault(&mut self.state().port_faults, &resource.name) {
            return Err(fault.error);
        }
        let (pod, target_port) = self.inner.route(resource, port)?;
        let stream: BoxPortStream = Box::new(self.inner.dial(pod, target_port));
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
        if command.is_empty() {
            return Err(ApiError::terminal("exec needs a command").with_status(400, "BadRequest"));
        }
        let (request, handler) = {
            let mut state = self.state();
            let stored = state.objects.get(resource).ok_or_else(|| {
                ApiError::terminal(format!("{resource} not found")).with_status(404, "NotFound")
            })?;
            if !pod_is_running(&stored.object) {
                return Err(ApiError::terminal(format!("{resource} is not running"))
                    .with_status(400, "BadRequest"));
            }
            let request = ExecRequest {
                pod: resource.clone(),
                container: container.map(ToString::to_string),
                command: command.to_vec(),
                stdin,
            };
            state.execs.push(request.clone());
            let handler = state
                .exec_handlers
                .iter()
                .find(|(prefix, _)| resource.name.starts_with(prefix.as_str()))
                .map(|(_, handler)| Arc::clone(handler));
            (request, handler)
        };
        debug!("in-memory exec in {}: {:?}", resource, request.command);
        Ok(handler.map_or_else(ExecResult::default, |handler| handler(&request)))
    }

    async fn log_lines(
        &self,
        resource: &ResourceRef,
        _container: Option<&str>,
    ) -> Result<BoxStream<'static, Result<String, ApiError>>, ApiError> {
        let (backlog, rx) = {
            let state = self.state();
            if !state.objects.contains_key(resource) {
                return Err(ApiError::terminal(format!("{resource} not found")).with_status(404, "NotFound"));
            }
            let rx = self.inner.log_lines.subscribe();
            (state.logs.get(resource).cloned().unwrap_or_default(), rx)
        };

        let target = resource.clone();
        let live = stream::unfold((rx, target), |(mut rx, target)| async move {
            loop {
                match rx.recv().await {
                    Ok((pod, line)) if pod == target => return Some((Ok(line), (rx, target))),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream::iter(backlog.into_iter().map(Ok)).chain(live).boxed())
    }
}

fn lock(mutex: &Mutex<State>) -> MutexGuard<'_, State> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn next_version(state: &mut State) -> String {
    state.next_version += 1;
    state.next_version.to_string()
}

fn take_fault(faults: &mut Vec<Fault>, name: &str) -> Option<Fault> {
    let index = faults
        .iter()
        .position(|f| f.remaining > 0 && name.starts_with(f.prefix.as_str()))?;
    let fault = &mut faults[index];
    fault.remaining -= 1;
    Some(Fault {
        prefix: fault.prefix.clone(),
        error: fault.error.clone(),
        remaining: fault.remaining,
        after_commit: fault.after_commit,
    })
}

/// Remove `root` and, transitively, every object owned by it
fn remove_cascade(state: &mut State, root: &ResourceRef) -> Vec<ResourceRef> {
    let mut removed = Vec::new();
    let mut pending = vec![root.clone()];
    while let Some(next) = pending.pop() {
        let Some(stored) = state.objects.remove(&next) else {
            continue;
        };
        state.deletions += 1;
        state.logs.remove(&next);
        if let Some(tasks) = state.port_tasks.remove(&next) {
            for task in tasks {
                task.abort();
            }
        }
        for (candidate, object) in &state.objects {
            let owned = object
                .object
                .metadata
                .owner_references
                .as_ref()
                .is_some_and(|refs| refs.iter().any(|o| o.uid == stored.uid));
            if owned && candidate.namespace == next.namespace {
                pending.push(candidate.clone());
            }
        }
        removed.push(next);
    }
    removed
}

/// Bind one loopback listener per service port and relay its connections to the backing pod
async fn bind_node_ports(object: &mut DynamicObject) -> Result<Vec<(u16, TcpListener)>, ApiError> {
    let mut listeners = Vec::new();
    let Some(ports) = object
        .data
        .pointer_mut("/spec/ports")
        .and_then(Value::as_array_mut)
    else {
        return Ok(listeners);
    };
    for port in ports.iter_mut() {
        let Some(service_port) = port
            .get("port")
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
        else {
            continue;
        };
        let listener = TcpListener::bind((NODE_ADDRESS, 0))
            .await
            .map_err(|e| ApiError::transient(format!("cannot allocate node port: {e}")))?;
        let node_port = listener
            .local_addr()
            .map_err(|e| ApiError::transient(format!("cannot allocate node port: {e}")))?
            .port();
        if let Some(port) = port.as_object_mut() {
            port.insert("nodePort".to_string(), json!(node_port));
        }
        listeners.push((service_port, listener));
    }
    Ok(listeners)
}

/// Accept loop behind one emulated node port
async fn accept_node_port(inner: Weak<Inner>, service: ResourceRef, port: u16, listener: TcpListener) {
    loop {
        let Ok((mut socket, peer)) = listener.accept().await else {
            return;
        };
        let Some(cluster) = inner.upgrade() else {
            return;
        };
        match cluster.route(&service, port) {
            Ok((pod, target_port)) => {
                let mut upstream = cluster.dial(pod, target_port);
                tokio::spawn(async move {
                    let _ = tokio::io::copy_bidirectional(&mut socket, &mut upstream).await;
                });
            }
            Err(e) => debug!("node port {} of {} refused {}: {}", port, service, peer, e),
        }
    }
}

fn is_node_port_service(resource: &ResourceRef, object: &DynamicObject) -> bool {
    resource.kind == ResourceKind::Service
        && object.data.pointer("/spec/type").and_then(Value::as_str) == Some("NodePort")
}

/// How long the job and TTL controllers would let a Job live
fn job_lifetime(object: &DynamicObject) -> Option<Duration> {
    let deadline = object.data.pointer("/spec/activeDeadlineSeconds")?.as_u64()?;
    let ttl = object.data.pointer("/spec/ttlSecondsAfterFinished")?.as_u64()?;
    Some(Duration::from_secs(deadline.saturating_add(ttl)))
}

async fn echo(stream: DuplexStream) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let _ = tokio::io::copy(&mut reader, &mut writer).await;
}

fn to_typed<K: serde::de::DeserializeOwned>(object: &DynamicObject) -> Result<K, ApiError> {
    serde_json::to_value(object)
        .and_then(serde_json::from_value)
        .map_err(|e| ApiError::terminal(format!("stored object does not decode: {e}")))
}

fn set_field(object: &mut DynamicObject, field: &str, value: Value) {
    if let Some(map) = object.data.as_object_mut() {
        map.insert(field.to_string(), value);
    } else {
        object.data = json!({ field: value });
    }
}

fn container_names(object: &DynamicObject) -> Vec<(String, String)> {
    object
        .data
        .pointer("/spec/containers")
        .and_then(Value::as_array)
        .map(|containers| {
            containers
                .iter()
                .map(|c| {
                    let name = c.get("name").and_then(Value::as_str).unwrap_or("main");
                    let image = c.get("image").and_then(Value::as_str).unwrap_or_default();
                    (name.to_string(), image.to_string())
                })
                .collect()
        })
        .unwrap_or_default()
}

fn pod_status(step: &PodStep, containers: &[(String, String)]) -> Option<Value> {
    let statuses = |ready: bool, state: Value| -> Vec<Value> {
        containers
            .iter()
            .map(|(name, image)| {
                json!({
                    "name": name,
                    "image": image,
                    "imageID": "",
                    "ready": ready,
                    "restartCount": 0,
                    "state": state.clone(),
                })
            })
            .collect()
    };
    let condition = |ready: bool| {
        let status = if ready { "True" } else { "False" };
        json!([{ "type": "Ready", "status": status }])
    };

    let status = match step {
        PodStep::Pending => json!({ "phase": "Pending" }),
        PodStep::Running { ready } => json!({
            "phase": "Running",
            "hostIP": NODE_ADDRESS,
            "conditions": condition(*ready),
            "containerStatuses": statuses(*ready, json!({ "running": {} })),
        }),
        PodStep::Waiting { reason } => json!({
            "phase": "Pending",
            "conditions": condition(false),
            "containerStatuses": statuses(false, json!({ "waiting": { "reason": reason } })),
        }),
        PodStep::Failed { reason } => json!({
            "phase": "Failed",
            "reason": reason,
            "conditions": condition(false),
        }),
        PodStep::Succeeded => json!({ "phase": "Succeeded", "conditions": condition(false) }),
        PodStep::Log(_) | PodStep::Delete => return None,
    };
    Some(status)
}

fn pod_is_running(object: &DynamicObject) -> bool {
    object.data.pointer("/status/phase").and_then(Value::as_str) == Some("Running")
}

fn pod_is_ready(object: &DynamicObject) -> bool {
    pod_is_running(object)
        && object
            .data
            .pointer("/status/conditions")
            .and_then(Value::as_array)
            .is_some_and(|conditions| {
                conditions.iter().any(|c| {
                    c.get("type").and_then(Value::as_str) == Some("Ready")
                        && c.get("status").and_then(Value::as_str) == Some("True")
                })
            })
}

/// Ready pods in `namespace` selected by `service`, sorted by name
fn backing_pods(state: &State, namespace: &str, service: &DynamicObject) -> Vec<ResourceRef> {
    let Some(selector) = service
        .data
        .pointer("/spec/selector")
        .and_then(Value::as_object)
        .filter(|s| !s.is_empty())
    else {
        return Vec::new();
    };

    let mut pods: Vec<ResourceRef> = state
        .objects
        .iter()
        .filter(|(r, _)| r.kind == ResourceKind::Pod && r.namespace == namespace)
        .filter(|(_, stored)| pod_is_ready(&stored.object))
        .filter(|(_, stored)| {
            let labels = stored.object.metadata.labels.as_ref();
            selector.iter().all(|(key, value)| {
                labels
                    .and_then(|l| l.get(key))
                    .is_some_and(|v| Some(v.as_str()) == value.as_str())
            })
        })
        .map(|(r, _)| r.clone())
        .collect();
    pods.sort_by(|a, b| a.name.cmp(&b.name));
    pods
}

fn ready_endpoints(state: &State, namespace: &str, service: &DynamicObject) -> usize {
    backing_pods(state, namespace, service).len()
}

/// Numeric `targetPort` of the service port matching `port`, or `port` itself
fn service_target_port(service: &DynamicObject, port: u16) -> u16 {
    service
        .data
        .pointer("/spec/ports")
        .and_then(Value::as_array)
        .and_then(|ports| {
            ports
                .iter()
                .find(|p| p.get("port").and_then(Value::as_u64) == Some(u64::from(port)))
        })
        .and_then(|p| p.get("targetPort").and_then(Value::as_u64))
        .and_then(|p| u16::try_from(p).ok())
        .unwrap_or(port)
}

/// One requirement of an equality-based label selector
#[derive(Debug, Clone, PartialEq, Eq)]
enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    Exists(String),
    NotExists(String),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::NotExists(k) => !labels.contains_key(k),
        }
    }
}

fn parse_selector(selector: &str) -> Result<Vec<Requirement>, ApiError> {
    selector
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let requirement = if let Some((k, v)) = part.split_once("!=") {
                Requirement::NotEquals(k.trim().to_string(), v.trim().to_string())
            } else if let Some((k, v)) = part.split_once("==").or_else(|| part.split_once('=')) {
                Requirement::Equals(k.trim().to_string(), v.trim().to_string())
            } else if let Some(k) = part.strip_prefix('!') {
                Requirement::NotExists(k.trim().to_string())
            } else {
                Requirement::Exists(part.to_string())
            };
            match &requirement {
                Requirement::Equals(k, _)
                | Requirement::NotEquals(k, _)
                | Requirement::Exists(k)
                | Requirement::NotExists(k)
                    if k.is_empty() =>
                {
                    Err(ApiError::terminal(format!("invalid label selector '{selector}'"))
                        .with_status(400, "BadRequest"))
                }
                _ => Ok(requirement),
            }
        })
        .collect()
}
