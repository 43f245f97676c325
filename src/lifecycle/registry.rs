//! # Scope Registry
//!
//! Process-wide table of active scopes, so that everything still provisioned
//! can be torn down from an exit hook or on Ctrl-C.

use super::Scope;
use crate::error::{FixtureError, Result};
use crate::teardown::{TeardownGuarantor, TeardownOutcome};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{info, warn};

static GLOBAL: LazyLock<Arc<ScopeRegistry>> = LazyLock::new(|| Arc::new(ScopeRegistry::new()));

#[derive(Clone)]
struct Registered {
    scope: Arc<tokio::sync::Mutex<Scope>>,
    teardown: TeardownGuarantor,
}

/// Active scopes by id
#[derive(Default)]
pub struct ScopeRegistry {
    scopes: Mutex<HashMap<String, Registered>>,
}

impl std::fmt::Debug for ScopeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeRegistry")
            .field("active", &self.active_scopes())
            .finish()
    }
}

impl ScopeRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every coordinator in this process
    #[must_use]
    pub fn global() -> Arc<ScopeRegistry> {
        Arc::clone(&GLOBAL)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Registered>> {
        self.scopes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn register(
        &self,
        id: &str,
        scope: Arc<tokio::sync::Mutex<Scope>>,
        teardown: TeardownGuarantor,
    ) -> Result<()> {
        let mut scopes = self.lock();
        if scopes.contains_key(id) {
            return Err(FixtureError::ScopeActive(id.to_string()));
        }
        scopes.insert(id.to_string(), Registered { scope, teardown });
        Ok(())
    }

    pub(crate) fn unregister(&self, id: &str) {
        self.lock().remove(id);
    }

    #[must_use]
    pub fn is_active(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Ids of every registered scope, sorted
    #[must_use]
    pub fn active_scopes(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Tear down every registered scope
    ///
    /// Scopes whose teardown completes are removed from the registry.
    pub async fn teardown_all(&self) -> Vec<TeardownOutcome> {
        let registered: Vec<(String, Registered)> = self
            .lock()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();

        let mut outcomes = Vec::with_capacity(registered.len());
        for (id, entry) in registered {
            let outcome = {
                let mut scope = entry.scope.lock().await;
                entry.teardown.teardown(&mut scope).await
            };
            if outcome.is_complete() {
                self.unregister(&id);
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Tear down every scope on Ctrl-C, then exit with status 130
    pub fn install_exit_handler(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("Cannot listen for Ctrl-C; scopes will rely on expiry reaping");
                return;
            }
            info!("Received interrupt, tearing down {} scope(s)...", registry.active_scopes().len());
            let outcomes = registry.teardown_all().await;
            for outcome in outcomes.iter().filter(|o| !o.is_complete()) {
                warn!(
                    "Scope {} left {} object(s) behind",
                    outcome.scope,
                    outcome.failed.len()
                );
            }
            std::process::exit(130);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::InMemoryCluster;
    use crate::config::FixtureConfig;

    fn guarantor() -> TeardownGuarantor {
        TeardownGuarantor::new(Arc::new(InMemoryCluster::new()), &FixtureConfig::default())
    }

    #[tokio::test]
    async fn test_duplicate_ids_rejected() {
        let registry = ScopeRegistry::new();
        let scope = Arc::new(tokio::sync::Mutex::new(Scope::new("a")));
        registry.register("a", Arc::clone(&scope), guarantor()).unwrap();

        let err = registry.register("a", scope, guarantor()).unwrap_err();
        assert!(matches!(err, FixtureError::ScopeActive(id) if id == "a"));
        assert_eq!(registry.active_scopes(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_teardown_all_clears_completed_scopes() {
        let registry = ScopeRegistry::new();
        for id in ["b", "a"] {
            registry
                .register(id, Arc::new(tokio::sync::Mutex::new(Scope::new(id))), guarantor())
                .unwrap();
        }
        let outcomes = registry.teardown_all().await;
        assert_eq!(outcomes.len(), 2);
        assert!(registry.active_scopes().is_empty());
        assert!(!registry.is_active("a"));
    }
}
