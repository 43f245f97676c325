//! # List Command
//!
//! Lists objects labeled as managed by kube-fixtures.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use kube_fixtures::cluster::{ClusterApi, ListedObject};
use kube_fixtures::constants::{
    ANCHOR_LABEL, EXPIRES_AT_ANNOTATION, MANAGED_BY_LABEL, MANAGED_BY_VALUE, SCOPE_ID_ANNOTATION,
    SCOPE_LABEL,
};
use kube_fixtures::manifest::{naming, ResourceKind};

const LISTED_KINDS: [ResourceKind; 5] = [
    ResourceKind::Job,
    ResourceKind::ConfigMap,
    ResourceKind::Pod,
    ResourceKind::Service,
    ResourceKind::Secret,
];

/// Label selector for managed objects, optionally narrowed to one scope id
pub fn managed_selector(scope: Option<&str>) -> String {
    match scope {
        Some(scope) => format!(
            "{MANAGED_BY_LABEL}={MANAGED_BY_VALUE},{SCOPE_LABEL}={}",
            naming::scope_hash(scope)
        ),
        None => format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}"),
    }
}

/// Managed objects of every listed kind
pub async fn managed_objects(
    cluster: &dyn ClusterApi,
    namespace: Option<&str>,
    scope: Option<&str>,
) -> Result<Vec<ListedObject>> {
    let selector = managed_selector(scope);
    let mut objects = Vec::new();
    for kind in &LISTED_KINDS {
        let listed = cluster
            .list(kind, namespace, &selector)
            .await
            .with_context(|| format!("Failed to list {kind} objects"))?;
        objects.extend(listed);
    }
    Ok(objects)
}

/// List managed objects
pub async fn list_command(
    cluster: &dyn ClusterApi,
    namespace: Option<&str>,
    scope: Option<&str>,
) -> Result<()> {
    match namespace {
        Some(ns) => println!("Listing kube-fixtures objects in namespace '{ns}'..."),
        None => println!("Listing kube-fixtures objects in all namespaces..."),
    }

    let objects = managed_objects(cluster, namespace, scope).await?;
    if objects.is_empty() {
        println!("No kube-fixtures objects found.");
        return Ok(());
    }

    println!(
        "\n{:<40} {:<12} {:<20} {:<24} {:<10} {:<12}",
        "NAME", "KIND", "NAMESPACE", "SCOPE", "AGE", "EXPIRES"
    );
    println!("{}", "-".repeat(123));

    let now = Utc::now();
    for object in &objects {
        let name = &object.resource.name;
        let kind = object.resource.kind.kind_name();
        let ns = &object.resource.namespace;
        let scope = object
            .annotations
            .get(SCOPE_ID_ANNOTATION)
            .or_else(|| object.labels.get(SCOPE_LABEL))
            .map_or("-", String::as_str);
        let age = object
            .creation_timestamp
            .map_or_else(|| "-".to_string(), |created| format_age(now - created));
        let expires = expiry_column(object, now);

        println!("{name:<40} {kind:<12} {ns:<20} {scope:<24} {age:<10} {expires:<12}");
    }

    Ok(())
}

fn expiry_column(object: &ListedObject, now: DateTime<Utc>) -> String {
    if object.labels.get(ANCHOR_LABEL).map(String::as_str) != Some("true") {
        return String::new();
    }
    match object
        .annotations
        .get(EXPIRES_AT_ANNOTATION)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
    {
        Some(expiry) => {
            let remaining = expiry.with_timezone(&Utc) - now;
            if remaining <= chrono::Duration::zero() {
                "expired".to_string()
            } else {
                format!("in {}", format_age(remaining))
            }
        }
        None => "unknown".to_string(),
    }
}

/// Compact age like `kubectl get` prints it
pub fn format_age(age: chrono::Duration) -> String {
    let secs = age.num_seconds().max(0);
    match secs {
        0..=119 => format!("{secs}s"),
        120..=7199 => format!("{}m", secs / 60),
        7200..=172_799 => format!("{}h", secs / 3600),
        _ => format!("{}d", secs / 86_400),
    }
}
