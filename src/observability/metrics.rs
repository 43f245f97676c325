//! # Metrics
//!
//! Prometheus metrics for monitoring fixture lifecycles.
//!
//! ## Metrics Exposed
//!
//! - `kube_fixtures_resources_created_total` - Objects created, by kind
//! - `kube_fixtures_resources_deleted_total` - Objects deleted during teardown or rollback, by kind
//! - `kube_fixtures_delete_failures_total` - Deletes that failed after all retries, by kind
//! - `kube_fixtures_acquire_failures_total` - Acquire calls that failed and were rolled back
//! - `kube_fixtures_readiness_wait_seconds` - Time spent waiting for readiness
//! - `kube_fixtures_tunnels_open` - Currently open tunnels

use anyhow::{Context, Result};
use prometheus::{Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::{LazyLock, OnceLock};

// Metrics
pub(crate) static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static RESOURCES_CREATED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "kube_fixtures_resources_created_total",
            "Total number of objects created",
        ),
        &["kind"],
    )
    .expect("Failed to create RESOURCES_CREATED_TOTAL metric - this should never happen")
});

static RESOURCES_DELETED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "kube_fixtures_resources_deleted_total",
            "Total number of objects deleted",
        ),
        &["kind"],
    )
    .expect("Failed to create RESOURCES_DELETED_TOTAL metric - this should never happen")
});

static DELETE_FAILURES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        prometheus::Opts::new(
            "kube_fixtures_delete_failures_total",
            "Total number of deletes that failed after all retries",
        ),
        &["kind"],
    )
    .expect("Failed to create DELETE_FAILURES_TOTAL metric - this should never happen")
});

static ACQUIRE_FAILURES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "kube_fixtures_acquire_failures_total",
        "Total number of failed acquire calls",
    )
    .expect("Failed to create ACQUIRE_FAILURES_TOTAL metric - this should never happen")
});

static READINESS_WAIT_SECONDS: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "kube_fixtures_readiness_wait_seconds",
            "Time spent waiting for readiness in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
    )
    .expect("Failed to create READINESS_WAIT_SECONDS metric - this should never happen")
});

static TUNNELS_OPEN: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("kube_fixtures_tunnels_open", "Number of open tunnels")
        .expect("Failed to create TUNNELS_OPEN metric - this should never happen")
});

static REGISTERED: OnceLock<()> = OnceLock::new();

/// Register every metric with the crate registry
///
/// Safe to call more than once; only the first call registers.
pub fn register_metrics() -> Result<()> {
    if REGISTERED.get().is_some() {
        return Ok(());
    }
    REGISTRY
        .register(Box::new(RESOURCES_CREATED_TOTAL.clone()))
        .context("Failed to register resources_created_total")?;
    REGISTRY
        .register(Box::new(RESOURCES_DELETED_TOTAL.clone()))
        .context("Failed to register resources_deleted_total")?;
    REGISTRY
        .register(Box::new(DELETE_FAILURES_TOTAL.clone()))
        .context("Failed to register delete_failures_total")?;
    REGISTRY
        .register(Box::new(ACQUIRE_FAILURES_TOTAL.clone()))
        .context("Failed to register acquire_failures_total")?;
    REGISTRY
        .register(Box::new(READINESS_WAIT_SECONDS.clone()))
        .context("Failed to register readiness_wait_seconds")?;
    REGISTRY
        .register(Box::new(TUNNELS_OPEN.clone()))
        .context("Failed to register tunnels_open")?;
    let _ = REGISTERED.set(());
    Ok(())
}

/// Render the registry in the Prometheus text format
pub fn gather_text() -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&REGISTRY.gather(), &mut buffer)
        .context("Failed to encode metrics")?;
    String::from_utf8(buffer).context("Metrics output is not UTF-8")
}

pub fn increment_resources_created(kind: &str) {
    RESOURCES_CREATED_TOTAL.with_label_values(&[kind]).inc();
}

pub fn increment_resources_deleted(kind: &str) {
    RESOURCES_DELETED_TOTAL.with_label_values(&[kind]).inc();
}

pub fn increment_delete_failures(kind: &str) {
    DELETE_FAILURES_TOTAL.with_label_values(&[kind]).inc();
}

pub fn increment_acquire_failures() {
    ACQUIRE_FAILURES_TOTAL.inc();
}

pub fn observe_readiness_wait(duration: f64) {
    READINESS_WAIT_SECONDS.observe(duration);
}

pub fn increment_tunnels_open() {
    TUNNELS_OPEN.inc();
}

pub fn decrement_tunnels_open() {
    TUNNELS_OPEN.dec();
}
