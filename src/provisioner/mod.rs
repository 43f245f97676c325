//! # Resource Provisioner
//!
//! Submits resolved specs to the cluster in manifest order and records every
//! created object on its scope.
//!
//! ## Flow
//!
//! 1. Create the scope anchor on first use
//! 2. For each spec, attach an owner reference to the anchor and create it,
//!    retrying transient failures with exponential backoff
//! 3. Treat `AlreadyExists` on an object labeled with this scope and owned by
//!    this scope's anchor as a lost response and adopt the existing object
//! 4. On any failure, delete what this call created and report `ProvisionFailed`
//!
//! ## Anchor
//!
//! The anchor is a batch/v1 Job running one idle container with
//! `activeDeadlineSeconds` equal to the fallback TTL and
//! `ttlSecondsAfterFinished: 0`. When the deadline passes the job controller
//! fails the Job, the TTL controller deletes it and the garbage collector
//! removes everything it owns, with no process of ours alive. The
//! expires-at annotation lets [`crate::teardown::reaper`] do the same from
//! outside.

use crate::backoff::retry_transient;
use crate::cluster::{ApiError, ClusterApi, Created, DeleteOutcome, ResourceRef};
use crate::config::{FixtureConfig, RetryPolicy};
use crate::constants::*;
use crate::error::{FixtureError, Result};
use crate::lifecycle::{ObservedPhase, Scope, TrackedResource};
use crate::manifest::{naming, ResourceKind, ResourceSpec};
use crate::observability::metrics;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::DynamicObject;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Creates objects and rolls back partial work
#[derive(Clone)]
pub struct Provisioner {
    cluster: Arc<dyn ClusterApi>,
    create_retry: RetryPolicy,
    delete_retry: RetryPolicy,
    fallback_ttl: Duration,
    anchor_image: String,
    pull_secrets: Vec<String>,
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("create_retry", &self.create_retry)
            .field("fallback_ttl", &self.fallback_ttl)
            .finish_non_exhaustive()
    }
}

impl Provisioner {
    pub fn new(cluster: Arc<dyn ClusterApi>, config: &FixtureConfig) -> Self {
        Self {
            cluster,
            create_retry: config.create_retry(),
            delete_retry: config.teardown_retry(),
            fallback_ttl: config.fallback_ttl(),
            anchor_image: config.anchor_image.clone(),
            pull_secrets: config.pull_secrets.clone(),
        }
    }

    /// Create `specs` in order, pushing each onto `scope` as soon as it exists
    ///
    /// Returns the resources created by this call. On error, those resources
    /// have been deleted again (or, if a delete failed, left on the scope for
    /// teardown).
    pub async fn provision(
        &self,
        scope: &mut Scope,
        specs: Vec<ResourceSpec>,
    ) -> Result<Vec<TrackedResource>> {
        let Some(first) = specs.first() else {
            return Ok(Vec::new());
        };

        let anchor_created_here = if scope.anchor().is_none() {
            let anchor = self.create_anchor(scope.id(), &first.namespace).await?;
            scope.set_anchor(anchor);
            true
        } else {
            false
        };

        let mut created: Vec<TrackedResource> = Vec::with_capacity(specs.len());
        for mut spec in specs {
            if let Some(anchor) = scope.anchor() {
                attach_owner(&mut spec, anchor);
            }
            let resource = spec.resource_ref();

            match self.create_one(&spec).await {
                Ok(tracked) => {
                    info!("✅ Created {} ({})", resource, tracked.uid);
                    metrics::increment_resources_created(resource.kind.kind_name());
                    scope.push_resource(tracked.clone());
                    created.push(tracked);
                }
                Err(last_error) => {
                    warn!("❌ Failed to create {}: {}", resource, last_error);
                    self.rollback(scope, &created, anchor_created_here).await;
                    return Err(FixtureError::ProvisionFailed {
                        resource,
                        last_error,
                    });
                }
            }
        }
        Ok(created)
    }

    async fn create_one(&self, spec: &ResourceSpec) -> std::result::Result<TrackedResource, ApiError> {
        let result = retry_transient(self.create_retry, "create", || self.cluster.create(spec)).await;
        match result {
            Ok(created) => Ok(tracked(spec.clone(), created)),
            Err(e) if e.is_already_exists() => match self.adopt(spec).await? {
                Some(tracked) => Ok(tracked),
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }

    /// Find an existing object of this scope with the spec's name
    ///
    /// When the spec is owned by the scope anchor the object must carry the
    /// same owner reference; a same-named object of an earlier incarnation of
    /// the scope is not ours.
    async fn adopt(&self, spec: &ResourceSpec) -> std::result::Result<Option<TrackedResource>, ApiError> {
        let Some(scope_label) = spec.scope_label() else {
            return Ok(None);
        };
        let selector = format!("{SCOPE_LABEL}={scope_label}");
        let existing = self
            .cluster
            .list(&spec.kind, Some(&spec.namespace), &selector)
            .await?;
        let owners: Vec<&str> = spec
            .payload
            .metadata
            .owner_references
            .iter()
            .flatten()
            .map(|owner| owner.uid.as_str())
            .collect();
        let Some(object) = existing.into_iter().find(|o| {
            o.resource.name == spec.name
                && owners
                    .iter()
                    .all(|uid| o.owner_uids.iter().any(|owned| owned == uid))
        }) else {
            return Ok(None);
        };
        let Some(uid) = object.uid else {
            return Ok(None);
        };

        info!("♻️  Adopting existing {} ({})", spec.resource_ref(), uid);
        Ok(Some(tracked(
            spec.clone(),
            Created {
                uid,
                resource_version: None,
                creation_timestamp: object.creation_timestamp.unwrap_or_else(Utc::now),
            },
        )))
    }

    async fn create_anchor(&self, scope_id: &str, namespace: &str) -> Result<TrackedResource> {
        let spec = anchor_spec(
            scope_id,
            namespace,
            self.fallback_ttl,
            &self.anchor_image,
            &self.pull_secrets,
        );
        let resource = spec.resource_ref();
        match self.create_one(&spec).await {
            Ok(anchor) => {
                debug!("anchored scope {} at {}", scope_id, resource);
                metrics::increment_resources_created(resource.kind.kind_name());
                Ok(anchor)
            }
            Err(last_error) => Err(FixtureError::ProvisionFailed {
                resource,
                last_error,
            }),
        }
    }

    /// Delete `created` in reverse order; keep anything that will not go away on the scope
    async fn rollback(&self, scope: &mut Scope, created: &[TrackedResource], anchor_created_here: bool) {
        for resource in created.iter().rev() {
            let target = resource.resource_ref();
            if self.delete(&target).await {
                scope.remove_resource(&resource.uid);
            }
        }

        if anchor_created_here && scope.resources().is_empty() {
            if let Some(anchor) = scope.take_anchor() {
                if !self.delete(&anchor.resource_ref()).await {
                    scope.set_anchor(anchor);
                }
            }
        }
    }

    async fn delete(&self, target: &ResourceRef) -> bool {
        match retry_transient(self.delete_retry, "delete", || self.cluster.delete(target)).await {
            Ok(outcome) => {
                if outcome == DeleteOutcome::Deleted {
                    metrics::increment_resources_deleted(target.kind.kind_name());
                }
                debug!("rolled back {}", target);
                true
            }
            Err(e) => {
                warn!("Failed to roll back {}: {}", target, e);
                metrics::increment_delete_failures(target.kind.kind_name());
                false
            }
        }
    }
}

fn tracked(spec: ResourceSpec, created: Created) -> TrackedResource {
    TrackedResource {
        spec,
        uid: created.uid,
        created_at: created.creation_timestamp,
        resource_version: created.resource_version,
        phase: ObservedPhase::Pending,
    }
}

/// Owner references only work within one namespace
fn attach_owner(spec: &mut ResourceSpec, anchor: &TrackedResource) {
    if spec.namespace != anchor.spec.namespace {
        return;
    }
    let owner = OwnerReference {
        api_version: "batch/v1".to_string(),
        kind: "Job".to_string(),
        name: anchor.spec.name.clone(),
        uid: anchor.uid.clone(),
        block_owner_deletion: Some(false),
        controller: Some(false),
    };
    let owners = spec
        .payload
        .metadata
        .owner_references
        .get_or_insert_with(Vec::new);
    if !owners.iter().any(|o| o.uid == owner.uid) {
        owners.push(owner);
    }
}

/// The Job every other object of a scope is owned by
pub fn anchor_spec(
    scope_id: &str,
    namespace: &str,
    ttl: Duration,
    image: &str,
    pull_secrets: &[String],
) -> ResourceSpec {
    let scope_hash = naming::scope_hash(scope_id);
    let name = format!("{GENERATED_NAME_PREFIX}-anchor-{scope_hash}");
    let deadline_secs = ttl.as_secs().max(1);
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    let expires_at = Utc::now()
        .checked_add_signed(ttl)
        .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC);

    let labels = BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (SCOPE_LABEL.to_string(), scope_hash),
        (ANCHOR_LABEL.to_string(), "true".to_string()),
    ]);
    let annotations = BTreeMap::from([
        (SCOPE_ID_ANNOTATION.to_string(), scope_id.to_string()),
        (EXPIRES_AT_ANNOTATION.to_string(), expires_at.to_rfc3339()),
    ]);

    let kind = ResourceKind::Job;
    let mut payload = DynamicObject::new(&name, &kind.api_resource()).within(namespace);
    payload.metadata = ObjectMeta {
        name: Some(name.clone()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        annotations: Some(annotations),
        ..ObjectMeta::default()
    };
    let pull_secrets: Vec<_> = pull_secrets.iter().map(|s| json!({ "name": s })).collect();
    // The anchor's pod carries no scope or managed-by label so sweeps never kill it
    payload.data = json!({
        "spec": {
            "activeDeadlineSeconds": deadline_secs,
            "ttlSecondsAfterFinished": 0,
            "backoffLimit": 0,
            "template": {
                "metadata": { "labels": { ANCHOR_LABEL: "true" } },
                "spec": {
                    "restartPolicy": "Never",
                    "terminationGracePeriodSeconds": 0,
                    "automountServiceAccountToken": false,
                    "imagePullSecrets": pull_secrets,
                    "containers": [{
                        "name": ANCHOR_CONTAINER_NAME,
                        "image": image,
                        "resources": {
                            "requests": { "cpu": "1m", "memory": "8Mi" },
                            "limits": { "cpu": "10m", "memory": "16Mi" }
                        }
                    }]
                }
            }
        }
    });

    ResourceSpec {
        kind,
        namespace: namespace.to_string(),
        name,
        logical_name: "anchor".to_string(),
        payload,
        scope_id: scope_id.to_string(),
        gate: None,
        readiness_timeout: None,
        setup: Vec::new(),
    }
}
