//! # State Sources
//!
//! Where the readiness watcher gets observed states from.
//!
//! - [`WatchSource`]: push updates from a cluster watch
//! - [`PollSource`]: `get` every interval plus random jitter
//!
//! A poll source never gives up on transient failures; a watch source ends
//! (returns `None`) or errors, and the watcher continues on a poll source.

use crate::cluster::{ApiError, ClusterApi, ResourceRef, ResourceState, StateChange};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Produces successive observed states of one object
#[async_trait]
pub trait StateSource: Send {
    /// Next state; `Ok(None)` when the source is exhausted
    async fn next_state(&mut self) -> Result<Option<StateChange>, ApiError>;

    /// Short label for logs
    fn describe(&self) -> &'static str;
}

/// States pushed by a cluster watch
pub struct WatchSource {
    stream: BoxStream<'static, Result<StateChange, ApiError>>,
}

impl std::fmt::Debug for WatchSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchSource").finish_non_exhaustive()
    }
}

impl WatchSource {
    #[must_use]
    pub fn new(stream: BoxStream<'static, Result<StateChange, ApiError>>) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl StateSource for WatchSource {
    async fn next_state(&mut self) -> Result<Option<StateChange>, ApiError> {
        self.stream.next().await.transpose()
    }

    fn describe(&self) -> &'static str {
        "watch"
    }
}

/// States read by periodic `get` calls
pub struct PollSource {
    cluster: Arc<dyn ClusterApi>,
    resource: ResourceRef,
    interval: Duration,
    jitter: Duration,
    first: bool,
}

impl std::fmt::Debug for PollSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollSource")
            .field("resource", &self.resource)
            .field("interval", &self.interval)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl PollSource {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        resource: ResourceRef,
        interval: Duration,
        jitter: Duration,
    ) -> Self {
        Self {
            cluster,
            resource,
            interval,
            jitter,
            first: true,
        }
    }

    fn next_delay(&self) -> Duration {
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return self.interval;
        }
        self.interval + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }
}

#[async_trait]
impl StateSource for PollSource {
    async fn next_state(&mut self) -> Result<Option<StateChange>, ApiError> {
        loop {
            if self.first {
                self.first = false;
            } else {
                let delay = self.next_delay();
                tokio::time::sleep(delay).await;
            }

            match self.cluster.get(&self.resource).await {
                Ok(ResourceState::Absent) => return Ok(Some(StateChange::Deleted)),
                Ok(state) => return Ok(Some(StateChange::Applied(state))),
                Err(e) if e.is_transient() => {
                    warn!("Polling {} failed, will retry: {}", self.resource, e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn describe(&self) -> &'static str {
        "poll"
    }
}
