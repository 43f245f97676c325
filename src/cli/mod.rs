//! # KFXCTL CLI
//!
//! Command-line companion for kube-fixtures.
//!
//! Test processes normally clean up after themselves; this tool is for the
//! cases where they could not (killed CI jobs, crashed debuggers).
//!
//! ## Usage
//!
//! ```bash
//! # List every managed object in the current namespace
//! kfxctl list
//!
//! # List the objects of one scope across all namespaces
//! kfxctl list --scope integration-suite --all-namespaces
//!
//! # Delete the objects of one scope
//! kfxctl sweep --scope integration-suite
//!
//! # Delete scopes whose expiry has passed
//! kfxctl sweep --expired
//!
//! # Delete every managed object in a namespace
//! kfxctl sweep --all --namespace ci
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kube_fixtures::cluster::kube::KubeClusterApi;
use kube_fixtures::config::FixtureConfig;

mod list;
mod sweep;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("BUILD_GIT_HASH"),
    ", built ",
    env!("BUILD_DATETIME"),
    ")"
);

/// kube-fixtures CLI
#[derive(Parser)]
#[command(name = "kfxctl")]
#[command(
    version = VERSION,
    about = "Inspect and clean up kube-fixtures test resources",
    long_about = None,
    after_help = "\
Examples:
  kfxctl list
  kfxctl list --scope my-suite --all-namespaces
  kfxctl sweep --scope my-suite
  kfxctl sweep --expired
"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Kubernetes namespace (defaults to KUBE_FIXTURES_NAMESPACE or 'default')
    #[arg(short, long, global = true)]
    namespace: Option<String>,

    /// Kubernetes context to use
    #[arg(short, long, global = true)]
    context: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List managed objects
    List {
        /// Only objects of this scope id
        #[arg(long, value_name = "SCOPE_ID")]
        scope: Option<String>,

        /// Look in every namespace
        #[arg(short = 'A', long)]
        all_namespaces: bool,
    },
    /// Delete managed objects
    Sweep {
        /// Delete the objects of this scope id
        #[arg(long, value_name = "SCOPE_ID", conflicts_with_all = ["expired", "all"])]
        scope: Option<String>,

        /// Delete only scopes whose expiry has passed
        #[arg(long, conflicts_with = "all")]
        expired: bool,

        /// Delete every managed object
        #[arg(long)]
        all: bool,

        /// Look in every namespace
        #[arg(short = 'A', long)]
        all_namespaces: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Configure rustls crypto provider FIRST, before any other operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .unwrap_or_else(|_| panic!("Failed to install rustls crypto provider"));

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kfxctl=info,kube_fixtures=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let mut config = FixtureConfig::from_env();
    if let Some(namespace) = cli.namespace {
        config.namespace = namespace;
    }
    if cli.context.is_some() {
        config.context = cli.context;
    }

    let cluster = KubeClusterApi::from_config(&config)
        .await
        .context("Failed to create Kubernetes client. Ensure kubeconfig is configured.")?;

    match cli.command {
        Commands::List {
            scope,
            all_namespaces,
        } => {
            let namespace = (!all_namespaces).then_some(config.namespace.as_str());
            list::list_command(&cluster, namespace, scope.as_deref()).await
        }
        Commands::Sweep {
            scope,
            expired,
            all,
            all_namespaces,
        } => {
            let namespace = (!all_namespaces).then_some(config.namespace.as_str());
            let target = match (scope, expired, all) {
                (Some(scope), _, _) => sweep::SweepTarget::Scope(scope),
                (None, true, _) => sweep::SweepTarget::Expired,
                (None, false, true) => sweep::SweepTarget::All,
                (None, false, false) => {
                    return Err(anyhow::anyhow!(
                        "Nothing to sweep.\n\n\
                        Pass one of:\n  \
                          --scope <SCOPE_ID>  objects of one scope\n  \
                          --expired           scopes past their expiry\n  \
                          --all               every managed object\n\n\
                        Example: kfxctl sweep --expired"
                    ));
                }
            };
            sweep::sweep_command(&cluster, namespace, target).await
        }
    }
}
