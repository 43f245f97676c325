//! # Readiness Predicates
//!
//! Per-kind readiness checks, a closed set:
//!
//! | Kind | Ready when |
//! |---|---|
//! | Pod (default) | phase `Running`, `Ready` condition true, selected containers ready |
//! | Pod, `Running` gate | phase `Running` |
//! | Pod, `Log` gate | phase `Running`, then the log pattern (checked by the watcher) |
//! | Service | at least one ready endpoint; no selector or `ExternalName` is ready at once |
//! | ConfigMap, Secret, Other | the object exists |
//!
//! A pod that failed, completed, or has a container stuck in a terminal
//! waiting reason fails immediately.

use crate::cluster::ResourceState;
use crate::constants::TERMINAL_WAITING_REASONS;
use crate::manifest::{ReadinessGate, ResourceKind};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod, Service};
use regex::Regex;

/// Outcome of checking one observed state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Ready,
    Waiting,
    Failed(String),
}

/// Gate applied when a pod spec names none
pub const DEFAULT_POD_GATE: ReadinessGate = ReadinessGate::ContainersReady {
    containers: Vec::new(),
};

/// Evaluate `state` of a `kind` object against `gate`
#[must_use]
pub fn evaluate(kind: &ResourceKind, gate: Option<&ReadinessGate>, state: &ResourceState) -> Verdict {
    match (kind, state) {
        (_, ResourceState::Absent) => Verdict::Waiting,
        (ResourceKind::Pod, ResourceState::Pod(pod)) => pod_verdict(pod, gate.unwrap_or(&DEFAULT_POD_GATE)),
        (
            ResourceKind::Service,
            ResourceState::Service {
                service,
                ready_endpoints,
            },
        ) => service_verdict(service, *ready_endpoints),
        (ResourceKind::Pod | ResourceKind::Service, _) => Verdict::Waiting,
        _ => Verdict::Ready,
    }
}

/// Pod readiness under `gate`
#[must_use]
pub fn pod_verdict(pod: &Pod, gate: &ReadinessGate) -> Verdict {
    if let Some(reason) = pod_failure(pod) {
        return Verdict::Failed(reason);
    }

    let status = pod.status.as_ref();
    let running = status.and_then(|s| s.phase.as_deref()) == Some("Running");
    if !running {
        return Verdict::Waiting;
    }

    match gate {
        ReadinessGate::Running | ReadinessGate::Log { .. } => Verdict::Ready,
        ReadinessGate::ContainersReady { containers } => {
            let condition_ready = status
                .and_then(|s| s.conditions.as_ref())
                .is_some_and(|conditions| {
                    conditions
                        .iter()
                        .any(|c| c.type_ == "Ready" && c.status == "True")
                });
            let statuses = status
                .and_then(|s| s.container_statuses.as_deref())
                .unwrap_or_default();
            let containers_ready = if containers.is_empty() {
                !statuses.is_empty() && statuses.iter().all(|c| c.ready)
            } else {
                containers.iter().all(|name| {
                    statuses
                        .iter()
                        .any(|c| &c.name == name && c.ready)
                })
            };
            if condition_ready && containers_ready {
                Verdict::Ready
            } else {
                Verdict::Waiting
            }
        }
    }
}

/// Reason a pod can never become ready, if any
#[must_use]
pub fn pod_failure(pod: &Pod) -> Option<String> {
    let status = pod.status.as_ref()?;
    match status.phase.as_deref() {
        Some("Failed") => {
            let detail = status
                .reason
                .as_deref()
                .or(status.message.as_deref())
                .unwrap_or("no reason reported");
            return Some(format!("pod failed: {detail}"));
        }
        Some("Succeeded") => return Some("pod completed before becoming ready".to_string()),
        _ => {}
    }

    let init = status.init_container_statuses.as_deref().unwrap_or_default();
    let main = status.container_statuses.as_deref().unwrap_or_default();
    init.iter().chain(main).find_map(terminal_waiting)
}

fn terminal_waiting(container: &ContainerStatus) -> Option<String> {
    let waiting = container.state.as_ref()?.waiting.as_ref()?;
    let reason = waiting.reason.as_deref()?;
    if !TERMINAL_WAITING_REASONS.contains(&reason) {
        return None;
    }
    Some(match waiting.message.as_deref() {
        Some(message) => format!("container {} is {reason}: {message}", container.name),
        None => format!("container {} is {reason}", container.name),
    })
}

/// Service readiness from its spec and the number of ready endpoints
#[must_use]
pub fn service_verdict(service: &Service, ready_endpoints: usize) -> Verdict {
    let spec = service.spec.as_ref();
    let external = spec.and_then(|s| s.type_.as_deref()) == Some("ExternalName");
    let selectorless = spec
        .and_then(|s| s.selector.as_ref())
        .is_none_or(|selector| selector.is_empty());

    if external || selectorless || ready_endpoints > 0 {
        Verdict::Ready
    } else {
        Verdict::Waiting
    }
}

/// Matches log lines by regex, or by plain substring when the pattern is not a valid regex
#[derive(Debug, Clone)]
pub enum LineMatcher {
    Regex(Regex),
    Literal(String),
}

impl LineMatcher {
    #[must_use]
    pub fn new(pattern: &str) -> Self {
        match Regex::new(pattern) {
            Ok(regex) => LineMatcher::Regex(regex),
            Err(_) => LineMatcher::Literal(pattern.to_string()),
        }
    }

    #[must_use]
    pub fn is_match(&self, line: &str) -> bool {
        match self {
            LineMatcher::Regex(regex) => regex.is_match(line),
            LineMatcher::Literal(text) => line.contains(text.as_str()),
        }
    }
}
