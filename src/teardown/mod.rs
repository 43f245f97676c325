//! # Teardown Guarantor
//!
//! Removes everything a scope created.
//!
//! ## Order
//!
//! 1. Close every tunnel of the scope
//! 2. Delete tracked resources in reverse creation order
//! 3. Delete the scope anchor last, so the owner-reference cascade still
//!    covers anything a failed delete left behind
//!
//! Each delete retries transient failures. `NotFound` counts as deleted.
//! Deleted resources leave the scope; failures stay on it so a later
//! teardown can retry them.

pub mod reaper;

use crate::backoff::retry_transient;
use crate::cluster::{ApiError, ClusterApi, DeleteOutcome, ResourceRef};
use crate::config::{FixtureConfig, RetryPolicy};
use crate::error::{FixtureError, Result};
use crate::lifecycle::{ObservedPhase, Scope};
use crate::observability::metrics;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A delete that did not succeed
#[derive(Debug, Clone)]
pub struct TeardownFailure {
    pub resource: ResourceRef,
    pub error: ApiError,
}

impl std::fmt::Display for TeardownFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.resource, self.error)
    }
}

/// What one teardown pass achieved
#[derive(Debug, Clone, Default)]
pub struct TeardownOutcome {
    pub scope: String,
    /// Removed by this pass (or already gone), in deletion order
    pub deleted: Vec<ResourceRef>,
    pub failed: Vec<TeardownFailure>,
    pub tunnels_closed: usize,
}

impl TeardownOutcome {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// `TeardownIncomplete` if anything could not be deleted
    pub fn into_result(self) -> Result<Self> {
        if self.failed.is_empty() {
            Ok(self)
        } else {
            Err(FixtureError::TeardownIncomplete {
                scope: self.scope,
                failed: self.failed,
            })
        }
    }
}

/// Deletes the resources of a scope
#[derive(Clone)]
pub struct TeardownGuarantor {
    cluster: Arc<dyn ClusterApi>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for TeardownGuarantor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeardownGuarantor")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl TeardownGuarantor {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: &FixtureConfig) -> Self {
        Self {
            cluster,
            retry: config.teardown_retry(),
        }
    }

    /// Close tunnels and delete every resource of `scope`
    pub async fn teardown(&self, scope: &mut Scope) -> TeardownOutcome {
        let mut outcome = TeardownOutcome {
            scope: scope.id().to_string(),
            ..TeardownOutcome::default()
        };

        for tunnel in scope.take_tunnels() {
            tunnel.close();
            outcome.tunnels_closed += 1;
        }

        let targets: Vec<(String, ResourceRef)> = scope
            .resources()
            .iter()
            .rev()
            .map(|r| (r.uid.clone(), r.resource_ref()))
            .collect();
        for (uid, target) in targets {
            match self.delete(&target).await {
                Ok(()) => {
                    scope.set_phase(&uid, ObservedPhase::Deleted);
                    scope.remove_resource(&uid);
                    outcome.deleted.push(target);
                }
                Err(error) => outcome.failed.push(TeardownFailure {
                    resource: target,
                    error,
                }),
            }
        }

        scope.retain_node_ports();

        if let Some(anchor) = scope.take_anchor() {
            let target = anchor.resource_ref();
            match self.delete(&target).await {
                Ok(()) => outcome.deleted.push(target),
                Err(error) => {
                    outcome.failed.push(TeardownFailure {
                        resource: target,
                        error,
                    });
                    scope.set_anchor(anchor);
                }
            }
        }

        if outcome.is_complete() {
            if !outcome.deleted.is_empty() {
                info!(
                    "🧹 Scope {} torn down ({} objects, {} tunnels)",
                    outcome.scope,
                    outcome.deleted.len(),
                    outcome.tunnels_closed
                );
            }
        } else {
            warn!(
                "⚠️  Scope {} teardown incomplete: {} of {} deletes failed",
                outcome.scope,
                outcome.failed.len(),
                outcome.failed.len() + outcome.deleted.len()
            );
        }
        outcome
    }

    async fn delete(&self, target: &ResourceRef) -> std::result::Result<(), ApiError> {
        match retry_transient(self.retry, "delete", || self.cluster.delete(target)).await {
            Ok(DeleteOutcome::Deleted) => {
                debug!("deleted {}", target);
                metrics::increment_resources_deleted(target.kind.kind_name());
                Ok(())
            }
            Ok(DeleteOutcome::AlreadyGone) => {
                debug!("{} was already gone", target);
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                warn!("❌ Failed to delete {}: {}", target, e);
                metrics::increment_delete_failures(target.kind.kind_name());
                Err(e)
            }
        }
    }
}
