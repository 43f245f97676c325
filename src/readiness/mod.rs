//! # Readiness Watcher
//!
//! Waits until a tracked resource satisfies its readiness predicate, fails,
//! or runs out of time.
//!
//! - Already `Ready` resources return immediately
//! - Kinds the adapter can watch use a [`WatchSource`]; others poll
//! - A watch that errors or ends is replaced by polling for the remaining budget
//! - `Log` gates follow the container log once the pod is running, while
//!   still failing fast if the pod crashes
//! - The whole evaluation is bounded by the caller's timeout; on expiry every
//!   stream is dropped and [`ReadinessResult::TimedOut`] is returned

pub mod predicate;
pub mod source;

pub use predicate::{LineMatcher, Verdict};
pub use source::{PollSource, StateSource, WatchSource};

use crate::cluster::{ClusterApi, ResourceRef, StateChange};
use crate::config::FixtureConfig;
use crate::lifecycle::TrackedResource;
use crate::manifest::{ReadinessGate, ResourceKind};
use crate::observability::metrics;
use futures::StreamExt;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Terminal outcome of one readiness wait
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessResult {
    Ready,
    TimedOut,
    Failed(String),
}

impl fmt::Display for ReadinessResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessResult::Ready => f.write_str("ready"),
            ReadinessResult::TimedOut => f.write_str("timed out"),
            ReadinessResult::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Evaluates readiness predicates against observed cluster state
#[derive(Clone)]
pub struct ReadinessWatcher {
    cluster: Arc<dyn ClusterApi>,
    poll_interval: Duration,
    poll_jitter: Duration,
}

impl fmt::Debug for ReadinessWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadinessWatcher")
            .field("poll_interval", &self.poll_interval)
            .field("poll_jitter", &self.poll_jitter)
            .finish_non_exhaustive()
    }
}

impl ReadinessWatcher {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: &FixtureConfig) -> Self {
        Self {
            cluster,
            poll_interval: config.poll_interval(),
            poll_jitter: config.poll_jitter(),
        }
    }

    /// Wait at most `timeout` for `resource` to become ready
    pub async fn await_ready(&self, resource: &TrackedResource, timeout: Duration) -> ReadinessResult {
        if resource.is_ready() {
            return ReadinessResult::Ready;
        }

        let target = resource.resource_ref();
        let started = Instant::now();
        let result = tokio::time::timeout(timeout, self.evaluate(&target, resource.spec.gate.as_ref()))
            .await
            .unwrap_or(ReadinessResult::TimedOut);
        let waited = started.elapsed();
        metrics::observe_readiness_wait(waited.as_secs_f64());

        match &result {
            ReadinessResult::Ready => info!("✅ {} ready after {:?}", target, waited),
            ReadinessResult::TimedOut => warn!("⏱️  {} not ready within {:?}", target, timeout),
            ReadinessResult::Failed(reason) => warn!("❌ {} failed: {}", target, reason),
        }
        result
    }

    async fn evaluate(&self, target: &ResourceRef, gate: Option<&ReadinessGate>) -> ReadinessResult {
        let mut feed = self.feed(target).await;

        loop {
            let state = match feed.next().await {
                Ok(state) => state,
                Err(reason) => return ReadinessResult::Failed(reason),
            };
            match predicate::evaluate(&target.kind, gate, &state) {
                Verdict::Waiting => {}
                Verdict::Failed(reason) => return ReadinessResult::Failed(reason),
                Verdict::Ready => break,
            }
        }

        match gate {
            Some(ReadinessGate::Log {
                pattern,
                times,
                container,
            }) => {
                tokio::select! {
                    result = self.scan_log(target, pattern, *times, container.as_deref()) => result,
                    reason = watch_for_failure(&mut feed, target, gate) => ReadinessResult::Failed(reason),
                }
            }
            _ => ReadinessResult::Ready,
        }
    }

    async fn feed(&self, target: &ResourceRef) -> StateFeed {
        let poll = PollSource::new(
            Arc::clone(&self.cluster),
            target.clone(),
            self.poll_interval,
            self.poll_jitter,
        );
        if !self.cluster.supports_watch(&target.kind) {
            return StateFeed::new(Box::new(poll), None);
        }
        match self.cluster.watch(target).await {
            Ok(stream) => StateFeed::new(Box::new(WatchSource::new(stream)), Some(poll)),
            Err(e) => {
                debug!("Watch on {} unavailable, polling instead: {}", target, e);
                StateFeed::new(Box::new(poll), None)
            }
        }
    }

    async fn scan_log(
        &self,
        target: &ResourceRef,
        pattern: &str,
        times: usize,
        container: Option<&str>,
    ) -> ReadinessResult {
        let matcher = LineMatcher::new(pattern);
        let mut lines = match self.cluster.log_lines(target, container).await {
            Ok(lines) => lines,
            Err(e) => return ReadinessResult::Failed(format!("cannot read log: {e}")),
        };

        let mut seen = 0;
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) if matcher.is_match(&line) => {
                    seen += 1;
                    debug!("{} log matched ({}/{}): {}", target, seen, times, line);
                    if seen >= times {
                        return ReadinessResult::Ready;
                    }
                }
                Ok(_) => {}
                Err(e) => return ReadinessResult::Failed(format!("log stream failed: {e}")),
            }
        }
        ReadinessResult::Failed(format!(
            "log ended after {seen} of {times} lines matching '{pattern}'"
        ))
    }
}

/// Consume states until the resource fails or disappears
async fn watch_for_failure(
    feed: &mut StateFeed,
    target: &ResourceRef,
    gate: Option<&ReadinessGate>,
) -> String {
    loop {
        match feed.next().await {
            Ok(state) => {
                if let Verdict::Failed(reason) = predicate::evaluate(&target.kind, gate, &state) {
                    return reason;
                }
            }
            Err(reason) => return reason,
        }
    }
}

/// A primary state source with a one-time fallback to polling
struct StateFeed {
    source: Box<dyn StateSource>,
    fallback: Option<PollSource>,
}

impl StateFeed {
    fn new(source: Box<dyn StateSource>, fallback: Option<PollSource>) -> Self {
        Self { source, fallback }
    }

    /// Next observed state; `Err` carries a failure reason
    async fn next(&mut self) -> Result<crate::cluster::ResourceState, String> {
        loop {
            match self.source.next_state().await {
                Ok(Some(StateChange::Applied(state))) => return Ok(state),
                Ok(Some(StateChange::Deleted)) => {
                    return Err("resource was deleted before becoming ready".to_string())
                }
                Ok(None) => {
                    if !self.fall_back("ended") {
                        return Err(format!("{} source ended", self.source.describe()));
                    }
                }
                Err(e) if e.is_transient() && self.fallback.is_some() => {
                    debug!("watch failed: {}", e);
                    self.fall_back("failed");
                }
                Err(e) => return Err(e.to_string()),
            }
        }
    }

    fn fall_back(&mut self, why: &str) -> bool {
        match self.fallback.take() {
            Some(poll) => {
                debug!("{} source {}, continuing with polling", self.source.describe(), why);
                self.source = Box::new(poll);
                true
            }
            None => false,
        }
    }
}

impl ResourceKind {
    /// Whether readiness is plain existence for this kind
    #[must_use]
    pub fn ready_on_presence(&self) -> bool {
        !matches!(self, ResourceKind::Pod | ResourceKind::Service)
    }
}
