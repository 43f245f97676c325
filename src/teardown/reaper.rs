//! # Reaper
//!
//! Cleans up after test processes that died without tearing down.
//!
//! Every scope has an anchor Job annotated with an expiry time, and every
//! other object of the scope in the anchor's namespace is owned by it. The
//! cluster deletes the anchor on its own once its deadline passes; reaping
//! deletes expired anchors right away, for clusters without the Job TTL
//! controller and for callers that do not want to wait. Either way the
//! garbage collector removes the rest. [`sweep`] deletes managed objects
//! directly, kind by kind.

use super::{TeardownFailure, TeardownOutcome};
use crate::cluster::{ClusterApi, DeleteOutcome, ListedObject};
use crate::constants::*;
use crate::manifest::ResourceKind;
use crate::observability::metrics;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

/// Kinds visited by [`sweep`]; anchors (Jobs) go last
const SWEEP_ORDER: [ResourceKind; 5] = [
    ResourceKind::Pod,
    ResourceKind::Service,
    ResourceKind::Secret,
    ResourceKind::ConfigMap,
    ResourceKind::Job,
];

/// Anchors whose expiry is before `now`
pub async fn expired_anchors(
    cluster: &dyn ClusterApi,
    namespace: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Vec<ListedObject>, crate::cluster::ApiError> {
    let selector = format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE},{ANCHOR_LABEL}=true");
    let anchors = cluster
        .list(&ResourceKind::Job, namespace, &selector)
        .await?;
    Ok(anchors
        .into_iter()
        .filter(|anchor| match expires_at(anchor) {
            Some(expiry) => expiry <= now,
            None => {
                debug!("anchor {} has no valid expiry, skipping", anchor.resource);
                false
            }
        })
        .collect())
}

/// Delete every anchor that has expired
pub async fn reap_expired(
    cluster: &dyn ClusterApi,
    namespace: Option<&str>,
) -> Result<TeardownOutcome, crate::cluster::ApiError> {
    let expired = expired_anchors(cluster, namespace, Utc::now()).await?;
    let mut outcome = TeardownOutcome {
        scope: "expired".to_string(),
        ..TeardownOutcome::default()
    };
    for anchor in expired {
        let scope_id = anchor
            .annotations
            .get(SCOPE_ID_ANNOTATION)
            .cloned()
            .unwrap_or_default();
        delete_into(cluster, anchor, &mut outcome).await;
        debug!("reaped anchor of scope '{}'", scope_id);
    }
    if !outcome.deleted.is_empty() {
        info!("🪦 Reaped {} expired scope(s)", outcome.deleted.len());
    }
    Ok(outcome)
}

/// Delete every managed object matching `selector`
///
/// The managed-by label is always added to the selector, so objects this
/// crate did not create are never touched.
pub async fn sweep(
    cluster: &dyn ClusterApi,
    namespace: Option<&str>,
    selector: &str,
) -> Result<TeardownOutcome, crate::cluster::ApiError> {
    let managed = format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}");
    let selector = if selector.trim().is_empty() {
        managed
    } else {
        format!("{managed},{selector}")
    };

    let mut outcome = TeardownOutcome {
        scope: selector.clone(),
        ..TeardownOutcome::default()
    };
    for kind in &SWEEP_ORDER {
        for object in cluster.list(kind, namespace, &selector).await? {
            delete_into(cluster, object, &mut outcome).await;
        }
    }
    info!(
        "🧹 Swept {} object(s) matching '{}' ({} failed)",
        outcome.deleted.len(),
        selector,
        outcome.failed.len()
    );
    Ok(outcome)
}

async fn delete_into(cluster: &dyn ClusterApi, object: ListedObject, outcome: &mut TeardownOutcome) {
    let target = object.resource;
    match cluster.delete(&target).await {
        Ok(DeleteOutcome::Deleted) => {
            metrics::increment_resources_deleted(target.kind.kind_name());
            outcome.deleted.push(target);
        }
        Ok(DeleteOutcome::AlreadyGone) => outcome.deleted.push(target),
        Err(e) if e.is_not_found() => outcome.deleted.push(target),
        Err(error) => {
            warn!("Failed to delete {}: {}", target, error);
            metrics::increment_delete_failures(target.kind.kind_name());
            outcome.failed.push(TeardownFailure {
                resource: target,
                error,
            });
        }
    }
}

fn expires_at(anchor: &ListedObject) -> Option<DateTime<Utc>> {
    let raw = anchor.annotations.get(EXPIRES_AT_ANNOTATION)?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::InMemoryCluster;
    use crate::config::FixtureConfig;
    use crate::lifecycle::Scope;
    use crate::manifest::{ManifestResolver, ManifestSource};
    use crate::provisioner::{anchor_spec, Provisioner};
    use std::sync::Arc;
    use std::time::Duration;

    async fn provision(cluster: &InMemoryCluster, scope_id: &str, ttl_secs: u64) {
        let config = FixtureConfig {
            fallback_ttl_secs: ttl_secs,
            ..FixtureConfig::default()
        };
        let specs = ManifestResolver::new(scope_id, &config)
            .resolve(&ManifestSource::Yaml(
                "apiVersion: v1\nkind: Pod\nmetadata:\n  generateName: worker-\nspec:\n  containers:\n    - name: w\n      image: busybox\n"
                    .to_string(),
            ))
            .unwrap();
        let mut scope = Scope::new(scope_id);
        Provisioner::new(Arc::new(cluster.clone()), &config)
            .provision(&mut scope, specs)
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_anchor_cascades() {
        let cluster = InMemoryCluster::new();
        provision(&cluster, "crashed-run", 0).await;
        provision(&cluster, "live-run", 3600).await;
        assert_eq!(cluster.objects().len(), 4);

        let outcome = reap_expired(&cluster, None).await.unwrap();
        assert_eq!(outcome.deleted.len(), 1);
        assert!(outcome.is_complete());

        let remaining = cluster.objects();
        assert_eq!(remaining.len(), 2);
        let live_hash = crate::manifest::naming::scope_hash("live-run");
        assert_eq!(cluster.objects_labeled(SCOPE_LABEL, &live_hash).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_anchor_without_expiry_is_kept() {
        let cluster = InMemoryCluster::new();
        let mut spec = anchor_spec(
            "manual",
            "default",
            Duration::from_secs(0),
            DEFAULT_ANCHOR_IMAGE,
            &[],
        );
        spec.payload
            .metadata
            .annotations
            .as_mut()
            .unwrap()
            .insert(EXPIRES_AT_ANNOTATION.to_string(), "soon".to_string());
        cluster.create(&spec).await.unwrap();

        let expired = expired_anchors(&cluster, Some("default"), Utc::now()).await.unwrap();
        assert!(expired.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_by_scope_selector() {
        let cluster = InMemoryCluster::new();
        provision(&cluster, "one", 3600).await;
        provision(&cluster, "two", 3600).await;

        let selector = format!("{SCOPE_LABEL}={}", crate::manifest::naming::scope_hash("one"));
        let outcome = sweep(&cluster, Some("default"), &selector).await.unwrap();
        assert_eq!(outcome.deleted.len(), 2);
        assert_eq!(outcome.deleted[0].kind, ResourceKind::Pod);
        assert_eq!(cluster.objects().len(), 2);

        let all = sweep(&cluster, None, "").await.unwrap();
        assert_eq!(all.deleted.len(), 2);
        assert!(cluster.objects().is_empty());
    }
}
