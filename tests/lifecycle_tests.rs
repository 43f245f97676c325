//! # Lifecycle Integration Tests
//!
//! Drives the coordinator end to end against the in-memory cluster.
//!
//! These tests verify:
//! - Nothing is left behind after release
//! - Failed acquires roll back everything they created
//! - Release is idempotent
//! - Readiness timing (fast success, fast failure, timeouts)
//! - Concurrent scopes get distinct names and independent teardown
//! - Cancelled acquires still tear down
//! - The cluster reclaims scopes whose process never released them

mod common;

use common::{coordinator, coordinator_with, REDIS, REDIS_WITH_SERVICE};
use kube_fixtures::cluster::memory::{PodScript, PodStep};
use kube_fixtures::cluster::ApiError;
use kube_fixtures::config::FixtureConfig;
use kube_fixtures::constants::SCOPE_LABEL;
use kube_fixtures::error::FixtureError;
use kube_fixtures::lifecycle::{ExposurePlan, ObservedPhase, TrackedResource};
use kube_fixtures::manifest::{naming, ManifestSource, ResourceKind};
use kube_fixtures::readiness::{ReadinessResult, ReadinessWatcher};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test]
async fn test_no_leak_after_release() {
    let (cluster, coordinator) = coordinator();
    let scope = coordinator.begin_scope("no-leak").unwrap();
    let specs = coordinator
        .resolve(&scope, &ManifestSource::Yaml(REDIS_WITH_SERVICE.to_string()))
        .unwrap();

    let handle = coordinator
        .acquire(&scope, specs, &ExposurePlan::new().expose("redis", 6379))
        .await
        .unwrap();
    assert_eq!(handle.resources().len(), 3);
    // three objects plus the scope anchor
    assert_eq!(cluster.objects().len(), 4);

    let outcome = coordinator.release(&scope).await;
    assert!(outcome.is_complete());
    assert_eq!(outcome.deleted.len(), 4);
    assert!(cluster.objects().is_empty());
    assert!(scope.resources().await.is_empty());
}

#[tokio::test]
async fn test_release_is_idempotent() {
    let (cluster, coordinator) = coordinator();
    let scope = coordinator.begin_scope("idempotent").unwrap();
    let specs = coordinator
        .resolve(&scope, &ManifestSource::Yaml(REDIS.to_string()))
        .unwrap();
    coordinator
        .acquire(&scope, specs, &ExposurePlan::none())
        .await
        .unwrap();

    let first = coordinator.release(&scope).await;
    let deletions = cluster.deletion_count();
    let second = coordinator.release(&scope).await;
    let third = coordinator.release(&scope).await;

    assert!(first.is_complete() && second.is_complete() && third.is_complete());
    assert!(second.deleted.is_empty() && third.deleted.is_empty());
    assert_eq!(cluster.deletion_count(), deletions);
    assert!(cluster.objects().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_terminal_create_error_is_not_retried() {
    let (cluster, coordinator) = coordinator();
    cluster.fail_create(
        "redis",
        ApiError::terminal("admission webhook denied the request").with_status(403, "Forbidden"),
        1,
    );
    let scope = coordinator.begin_scope("rollback").unwrap();
    let specs = coordinator
        .resolve(&scope, &ManifestSource::Yaml(REDIS_WITH_SERVICE.to_string()))
        .unwrap();
    // the prefix also matches the ConfigMap, which is created first
    assert!(specs[0].name.starts_with("redis-conf-"));

    let err = coordinator
        .acquire(&scope, specs, &ExposurePlan::none())
        .await
        .unwrap_err();

    match err {
        FixtureError::ProvisionFailed {
            resource,
            last_error,
        } => {
            assert_eq!(resource.kind, ResourceKind::ConfigMap);
            assert!(!last_error.is_transient());
        }
        other => panic!("expected ProvisionFailed, got {other:?}"),
    }
    // only the anchor was ever created
    assert_eq!(cluster.create_count(), 1);
    assert!(cluster.objects().is_empty());
    assert!(scope.resources().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_partial_acquire_rolls_back_fully() {
    let (cluster, coordinator) = coordinator();
    let scope = coordinator.begin_scope("partial").unwrap();
    let specs = coordinator
        .resolve(&scope, &ManifestSource::Yaml(REDIS_WITH_SERVICE.to_string()))
        .unwrap();
    let service = specs[2].name.clone();
    cluster.fail_create(
        &service,
        ApiError::terminal("spec.ports: Required value").with_status(422, "Invalid"),
        1,
    );

    let err = coordinator
        .acquire(&scope, specs, &ExposurePlan::none())
        .await
        .unwrap_err();
    assert!(matches!(err, FixtureError::ProvisionFailed { ref resource, .. } if resource.name == service));
    assert!(cluster.objects().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_transient_create_failures_are_retried() {
    let (cluster, coordinator) = coordinator();
    cluster.fail_create(
        "redis",
        ApiError::transient("etcdserver: request timed out").with_status(503, "ServiceUnavailable"),
        2,
    );
    let scope = coordinator.begin_scope("retry").unwrap();
    let specs = coordinator
        .resolve(&scope, &ManifestSource::Yaml(REDIS.to_string()))
        .unwrap();

    let handle = coordinator
        .acquire(&scope, specs, &ExposurePlan::none())
        .await
        .unwrap();
    assert_eq!(handle.resources().len(), 1);
    coordinator.release(&scope).await;
}

#[tokio::test(start_paused = true)]
async fn test_lost_create_response_adopts_existing_object() {
    let (cluster, coordinator) = coordinator();
    cluster.fail_create_after_commit(
        "redis",
        ApiError::transient("connection reset by peer"),
        1,
    );
    let scope = coordinator.begin_scope("adopt").unwrap();
    let specs = coordinator
        .resolve(&scope, &ManifestSource::Yaml(REDIS.to_string()))
        .unwrap();

    let handle = coordinator
        .acquire(&scope, specs, &ExposurePlan::none())
        .await
        .unwrap();
    let pods: Vec<_> = cluster
        .objects()
        .into_iter()
        .filter(|r| r.kind == ResourceKind::Pod)
        .collect();
    assert_eq!(pods.len(), 1);
    assert_eq!(handle.resources()[0].name(), pods[0].name);

    coordinator.release(&scope).await;
    assert!(cluster.objects().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_fast_ready() {
    let (cluster, coordinator) = coordinator();
    cluster.script_pod("redis", PodScript::ready_after(Duration::from_secs(5)));
    let scope = coordinator.begin_scope("fast-ready").unwrap();
    let specs = coordinator
        .resolve(&scope, &ManifestSource::Yaml(REDIS.to_string()))
        .unwrap()
        .into_iter()
        .map(|s| s.with_readiness_timeout(Duration::from_secs(30)))
        .collect();

    let started = Instant::now();
    let handle = coordinator
        .acquire(&scope, specs, &ExposurePlan::none())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_secs(5));
    assert!(elapsed < Duration::from_secs(7), "took {elapsed:?}");
    assert_eq!(handle.resources()[0].phase, ObservedPhase::Ready);
    coordinator.release(&scope).await;
}

#[tokio::test(start_paused = true)]
async fn test_fast_failure_on_crash_loop() {
    let (cluster, coordinator) = coordinator();
    cluster.script_pod(
        "redis",
        PodScript::new()
            .then(Duration::from_secs(1), PodStep::Running { ready: false })
            .then(
                Duration::from_secs(2),
                PodStep::Waiting {
                    reason: "CrashLoopBackOff".to_string(),
                },
            ),
    );
    let scope = coordinator.begin_scope("crash-loop").unwrap();
    let specs = coordinator
        .resolve(&scope, &ManifestSource::Yaml(REDIS.to_string()))
        .unwrap()
        .into_iter()
        .map(|s| s.with_readiness_timeout(Duration::from_secs(120)))
        .collect();

    let started = Instant::now();
    let err = coordinator
        .acquire(&scope, specs, &ExposurePlan::none())
        .await
        .unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(
        matches!(err, FixtureError::ResourceFailed { ref reason, .. } if reason.contains("CrashLoopBackOff")),
        "unexpected error: {err:?}"
    );
    assert!(cluster.objects().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_reports_resource_and_budget() {
    let (cluster, coordinator) = coordinator();
    cluster.script_pod("redis", PodScript::stuck());
    let scope = coordinator.begin_scope("timeout").unwrap();
    let specs = coordinator
        .resolve(&scope, &ManifestSource::Yaml(REDIS.to_string()))
        .unwrap()
        .into_iter()
        .map(|s| s.with_readiness_timeout(Duration::from_secs(15)))
        .collect();

    let err = coordinator
        .acquire(&scope, specs, &ExposurePlan::none())
        .await
        .unwrap_err();
    match err {
        FixtureError::TimedOut { resource, timeout } => {
            assert_eq!(resource.kind, ResourceKind::Pod);
            assert_eq!(timeout, Duration::from_secs(15));
        }
        other => panic!("expected TimedOut, got {other:?}"),
    }
    assert!(cluster.objects().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_readiness_is_monotonic() {
    let (cluster, coordinator) = coordinator();
    let scope = coordinator.begin_scope("monotonic").unwrap();
    let specs = coordinator
        .resolve(&scope, &ManifestSource::Yaml(REDIS.to_string()))
        .unwrap();
    let handle = coordinator
        .acquire(&scope, specs, &ExposurePlan::none())
        .await
        .unwrap();
    let pod: TrackedResource = handle.resources()[0].clone();

    assert!(cluster.set_pod_step(&pod.spec.namespace, pod.name(), PodStep::Running { ready: false }));
    let watcher = ReadinessWatcher::new(coordinator.cluster(), coordinator.config());
    assert_eq!(
        watcher.await_ready(&pod, Duration::from_secs(1)).await,
        ReadinessResult::Ready
    );
    assert!(scope.resources().await[0].is_ready());
    coordinator.release(&scope).await;
}

#[tokio::test]
async fn test_concurrent_scopes_are_isolated() {
    let (cluster, coordinator) = coordinator();
    let a = coordinator.begin_scope("suite-a").unwrap();
    let b = coordinator.begin_scope("suite-b").unwrap();
    let specs_a = coordinator
        .resolve(&a, &ManifestSource::Yaml(REDIS.to_string()))
        .unwrap();
    let specs_b = coordinator
        .resolve(&b, &ManifestSource::Yaml(REDIS.to_string()))
        .unwrap();
    assert_ne!(specs_a[0].name, specs_b[0].name);

    let plan = ExposurePlan::new().expose("redis", 6379);
    let (handle_a, handle_b) = tokio::join!(
        coordinator.acquire(&a, specs_a, &plan),
        coordinator.acquire(&b, specs_b, &plan),
    );
    let (handle_a, handle_b) = (handle_a.unwrap(), handle_b.unwrap());
    assert_ne!(
        handle_a.endpoint("redis", 6379).unwrap(),
        handle_b.endpoint("redis", 6379).unwrap()
    );

    coordinator.end_scope(a).await;
    assert!(cluster
        .objects_labeled(SCOPE_LABEL, &naming::scope_hash("suite-a"))
        .is_empty());
    assert_eq!(cluster.objects_labeled(SCOPE_LABEL, b.scope_hash()).len(), 2);

    coordinator.end_scope(b).await;
    assert!(cluster.objects().is_empty());
}

#[tokio::test]
async fn test_fixed_names_do_not_collide_across_scopes() {
    let (cluster, coordinator) = coordinator();
    let a = coordinator.begin_scope("fixed-a").unwrap();
    let b = coordinator.begin_scope("fixed-b").unwrap();
    let specs_a = coordinator
        .resolve(&a, &ManifestSource::Yaml(REDIS_WITH_SERVICE.to_string()))
        .unwrap();
    let specs_b = coordinator
        .resolve(&b, &ManifestSource::Yaml(REDIS_WITH_SERVICE.to_string()))
        .unwrap();
    // the manifest names the pod `redis` and the service `redis-svc`
    assert_eq!(specs_a[1].logical_name, "redis");
    assert_eq!(specs_b[1].logical_name, "redis");
    assert_ne!(specs_a[1].name, specs_b[1].name);
    assert_ne!(specs_a[2].name, specs_b[2].name);

    let plan = ExposurePlan::new().expose("redis-svc", 6379);
    let (handle_a, handle_b) = tokio::join!(
        coordinator.acquire(&a, specs_a, &plan),
        coordinator.acquire(&b, specs_b, &plan),
    );
    let (handle_a, handle_b) = (handle_a.unwrap(), handle_b.unwrap());
    assert_ne!(
        handle_a.resource("redis").unwrap().name(),
        handle_b.resource("redis").unwrap().name()
    );
    // two scopes of three objects plus their anchors
    assert_eq!(cluster.objects().len(), 8);

    assert!(coordinator.end_scope(a).await.is_complete());
    assert_eq!(cluster.objects_labeled(SCOPE_LABEL, b.scope_hash()).len(), 4);
    assert!(coordinator.end_scope(b).await.is_complete());
    assert!(cluster.objects().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unreleased_scope_is_reclaimed_by_the_cluster() {
    let config = FixtureConfig {
        fallback_ttl_secs: 60,
        ..FixtureConfig::default()
    };
    let (cluster, coordinator) = coordinator_with(config);
    let scope = coordinator.begin_scope("crashed-suite").unwrap();
    let specs = coordinator
        .resolve(&scope, &ManifestSource::Yaml(REDIS_WITH_SERVICE.to_string()))
        .unwrap();
    let started = Instant::now();
    coordinator
        .acquire(&scope, specs, &ExposurePlan::none())
        .await
        .unwrap();
    assert_eq!(cluster.objects().len(), 4);

    // the suite dies without releasing; nothing on this side runs teardown
    drop(scope);
    tokio::time::sleep_until(started + Duration::from_secs(59)).await;
    assert_eq!(cluster.objects().len(), 4);

    tokio::time::sleep_until(started + Duration::from_secs(62)).await;
    assert!(cluster.objects().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_acquire_tears_down() {
    let (cluster, coordinator) = coordinator();
    cluster.script_pod("redis", PodScript::stuck());
    let scope = coordinator.begin_scope("cancelled").unwrap();
    let specs = coordinator
        .resolve(&scope, &ManifestSource::Yaml(REDIS.to_string()))
        .unwrap();

    let cancelled = tokio::time::timeout(
        Duration::from_secs(3),
        coordinator.acquire(&scope, specs, &ExposurePlan::none()),
    )
    .await;
    assert!(cancelled.is_err());

    // the teardown runs on a spawned task
    for _ in 0..50 {
        if cluster.objects().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(cluster.objects().is_empty());
}

#[tokio::test]
async fn test_manifest_from_file() {
    let (cluster, coordinator) = coordinator();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(REDIS_WITH_SERVICE.as_bytes()).unwrap();

    let scope = coordinator.begin_scope("from-file").unwrap();
    let specs = coordinator
        .resolve(&scope, &ManifestSource::File(file.path().to_path_buf()))
        .unwrap();
    assert_eq!(specs.len(), 3);

    coordinator
        .acquire(&scope, specs, &ExposurePlan::none())
        .await
        .unwrap();
    coordinator.end_scope(scope).await;
    assert!(cluster.objects().is_empty());
}

#[tokio::test]
async fn test_unknown_logical_name_in_plan_rolls_back() {
    let (cluster, coordinator) = coordinator();
    let scope = coordinator.begin_scope("bad-plan").unwrap();
    let specs = coordinator
        .resolve(&scope, &ManifestSource::Yaml(REDIS.to_string()))
        .unwrap();

    let err = coordinator
        .acquire(&scope, specs, &ExposurePlan::new().expose("postgres", 5432))
        .await
        .unwrap_err();
    assert!(matches!(err, FixtureError::UnknownResource(ref name) if name == "postgres"));
    assert!(cluster.objects().is_empty());
}

#[tokio::test]
async fn test_registry_teardown_all() {
    let cluster = kube_fixtures::cluster::memory::InMemoryCluster::new();
    let registry = Arc::new(kube_fixtures::lifecycle::ScopeRegistry::new());
    let coordinator = kube_fixtures::lifecycle::LifecycleCoordinator::with_registry(
        Arc::new(cluster.clone()),
        kube_fixtures::config::FixtureConfig::default(),
        Arc::clone(&registry),
    );
    for id in ["left-open-1", "left-open-2"] {
        let scope = coordinator.begin_scope(id).unwrap();
        let specs = coordinator
            .resolve(&scope, &ManifestSource::Yaml(REDIS.to_string()))
            .unwrap();
        coordinator
            .acquire(&scope, specs, &ExposurePlan::none())
            .await
            .unwrap();
    }
    assert_eq!(registry.active_scopes().len(), 2);

    let outcomes = registry.teardown_all().await;
    assert!(outcomes.iter().all(|o| o.is_complete()));
    assert!(registry.active_scopes().is_empty());
    assert!(cluster.objects().is_empty());
}
