//! # Tunnel Integration Tests
//!
//! Exposure through the coordinator: relaying, breakage reporting and
//! cleanup on release. NodePort publishing is covered last.

mod common;

use common::{coordinator, REDIS, REDIS_WITH_SERVICE};
use kube_fixtures::cluster::memory::PodStep;
use kube_fixtures::expose::{TunnelBroken, TunnelStatus};
use kube_fixtures::lifecycle::ExposurePlan;
use kube_fixtures::manifest::{ManifestSource, ResourceKind};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[tokio::test]
async fn test_exposed_pod_relays_traffic() {
    let (_cluster, coordinator) = coordinator();
    let scope = coordinator.begin_scope("relay").unwrap();
    let specs = coordinator
        .resolve(&scope, &ManifestSource::Yaml(REDIS.to_string()))
        .unwrap();
    let handle = coordinator
        .acquire(&scope, specs, &ExposurePlan::new().expose("redis", 6379))
        .await
        .unwrap();

    let tunnel = handle.tunnel("redis", 6379).unwrap();
    assert!(tunnel.endpoint().ip().is_loopback());
    let mut stream = tunnel.connect().await.unwrap();
    stream.write_all(b"PING\r\n").await.unwrap();
    let mut reply = [0u8; 6];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"PING\r\n");

    coordinator.end_scope(scope).await;
}

#[tokio::test]
async fn test_breakage_is_distinguishable_from_application_errors() {
    let (cluster, coordinator) = coordinator();
    let scope = coordinator.begin_scope("breakage").unwrap();
    let specs = coordinator
        .resolve(&scope, &ManifestSource::Yaml(REDIS.to_string()))
        .unwrap();
    let handle = coordinator
        .acquire(&scope, specs, &ExposurePlan::new().expose("redis", 6379))
        .await
        .unwrap();
    let tunnel = handle.tunnel("redis", 6379).unwrap().clone();
    let pod = handle.resource("redis").unwrap().clone();

    let mut stream = tunnel.connect().await.unwrap();
    stream.write_all(b"x").await.unwrap();
    let mut one = [0u8; 1];
    stream.read_exact(&mut one).await.unwrap();

    // evicted out from under the test
    assert!(cluster.set_pod_step(&pod.spec.namespace, pod.name(), PodStep::Delete));

    let mut buf = [0u8; 8];
    let err = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .unwrap()
        .unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    let broken = err
        .into_inner()
        .unwrap()
        .downcast::<TunnelBroken>()
        .unwrap();
    assert_eq!(broken.resource, pod.resource_ref().to_string());
    assert_eq!(broken.port, 6379);

    let reported = tunnel.wait_broken().await.unwrap();
    assert_eq!(reported.port, 6379);
    assert!(matches!(tunnel.status(), TunnelStatus::Broken(_)));

    let outcome = coordinator.release(&scope).await;
    assert!(outcome.is_complete());
    assert_eq!(outcome.tunnels_closed, 1);
}

#[tokio::test]
async fn test_release_closes_tunnels() {
    let (cluster, coordinator) = coordinator();
    let scope = coordinator.begin_scope("close-on-release").unwrap();
    let specs = coordinator
        .resolve(&scope, &ManifestSource::Yaml(REDIS_WITH_SERVICE.to_string()))
        .unwrap();
    let handle = coordinator
        .acquire(
            &scope,
            specs,
            &ExposurePlan::new().expose("redis", 6379).expose("redis-svc", 6379),
        )
        .await
        .unwrap();
    assert_eq!(handle.tunnels().len(), 2);
    let service_tunnel = handle.tunnel("redis-svc", 6379).unwrap().clone();
    assert_eq!(service_tunnel.resource().kind, ResourceKind::Service);

    coordinator.end_scope(scope).await;

    assert!(cluster.objects().is_empty());
    for tunnel in handle.tunnels() {
        assert!(tunnel.is_closed());
        assert_eq!(
            tunnel.connect().await.unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
    }
}

#[tokio::test]
async fn test_reacquire_reuses_open_tunnel() {
    let (_cluster, coordinator) = coordinator();
    let scope = coordinator.begin_scope("reuse").unwrap();
    let plan = ExposurePlan::new().expose("redis", 6379);

    let specs = coordinator
        .resolve(&scope, &ManifestSource::Yaml(REDIS.to_string()))
        .unwrap();
    let first = coordinator.acquire(&scope, specs, &plan).await.unwrap();
    let first_endpoint = first.endpoint("redis", 6379).unwrap();

    let second = coordinator.acquire(&scope, Vec::new(), &plan).await.unwrap();
    assert_eq!(second.endpoint("redis", 6379).unwrap(), first_endpoint);
    assert_eq!(second.tunnels().len(), 1);

    coordinator.end_scope(scope).await;
}

#[tokio::test]
async fn test_node_port_reaches_pod_without_a_tunnel() {
    let (cluster, coordinator) = coordinator();
    let scope = coordinator.begin_scope("node-port").unwrap();
    let specs = coordinator
        .resolve(&scope, &ManifestSource::Yaml(REDIS.to_string()))
        .unwrap();
    let handle = coordinator
        .acquire(&scope, specs, &ExposurePlan::new().expose_node_port("redis", 6379))
        .await
        .unwrap();
    assert!(handle.tunnels().is_empty());

    let published = handle.node_port("redis", 6379).unwrap().clone();
    assert_eq!(published.service().kind, ResourceKind::Service);
    let mut stream = tokio::net::TcpStream::connect(published.endpoint())
        .await
        .unwrap();
    stream.write_all(b"PING\r\n").await.unwrap();
    let mut reply = [0u8; 6];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"PING\r\n");

    assert!(coordinator.end_scope(scope).await.is_complete());
    assert!(!cluster.contains(published.service()));
    assert!(cluster.objects().is_empty());
}
