//! # Sweep Command
//!
//! Deletes managed objects left behind by test processes.

use anyhow::{Context, Result};
use kube_fixtures::cluster::ClusterApi;
use kube_fixtures::constants::SCOPE_LABEL;
use kube_fixtures::manifest::naming;
use kube_fixtures::teardown::{reaper, TeardownOutcome};

/// What to delete
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SweepTarget {
    /// Objects of one scope id
    Scope(String),
    /// Scopes whose anchor expiry has passed
    Expired,
    /// Every managed object
    All,
}

/// Delete the objects selected by `target`
pub async fn sweep_command(
    cluster: &dyn ClusterApi,
    namespace: Option<&str>,
    target: SweepTarget,
) -> Result<()> {
    let outcome = run_sweep(cluster, namespace, &target).await?;
    print_outcome(&outcome);
    if !outcome.is_complete() {
        anyhow::bail!("{} object(s) could not be deleted", outcome.failed.len());
    }
    Ok(())
}

pub async fn run_sweep(
    cluster: &dyn ClusterApi,
    namespace: Option<&str>,
    target: &SweepTarget,
) -> Result<TeardownOutcome> {
    match target {
        SweepTarget::Expired => {
            println!("Reaping expired kube-fixtures scopes...");
            reaper::reap_expired(cluster, namespace)
                .await
                .context("Failed to reap expired scopes")
        }
        SweepTarget::Scope(scope) => {
            println!("Sweeping objects of scope '{scope}'...");
            let selector = format!("{SCOPE_LABEL}={}", naming::scope_hash(scope));
            reaper::sweep(cluster, namespace, &selector)
                .await
                .with_context(|| format!("Failed to sweep scope '{scope}'"))
        }
        SweepTarget::All => {
            println!("Sweeping every kube-fixtures object...");
            reaper::sweep(cluster, namespace, "")
                .await
                .context("Failed to sweep managed objects")
        }
    }
}

fn print_outcome(outcome: &TeardownOutcome) {
    if outcome.deleted.is_empty() && outcome.failed.is_empty() {
        println!("Nothing to delete.");
        return;
    }
    for resource in &outcome.deleted {
        println!("  deleted  {resource}");
    }
    for failure in &outcome.failed {
        println!("  FAILED   {failure}");
    }
    println!(
        "\n{} deleted, {} failed",
        outcome.deleted.len(),
        outcome.failed.len()
    );
}
