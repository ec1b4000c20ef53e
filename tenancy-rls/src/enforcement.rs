//! Process-wide enforcement toggle gated by policy validation

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tenancy_common::types::{EnforcementMode, EnforcementState};
use tenancy_common::{Error, Result};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::backend::CatalogSource;
use crate::inspector::PolicyInspector;

/// Where the enforcement state lives.
///
/// [`InMemoryEnforcementStore`] keeps one copy per process. Deployments with
/// several instances need an implementation backed by a shared store so every
/// instance observes the same flag.
#[async_trait]
pub trait EnforcementStore: Send + Sync {
    async fn load(&self) -> Result<EnforcementState>;

    async fn store(&self, state: EnforcementState) -> Result<()>;
}

/// Per-process enforcement state
#[derive(Debug, Default)]
pub struct InMemoryEnforcementStore {
    state: RwLock<EnforcementState>,
}

impl InMemoryEnforcementStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EnforcementStore for InMemoryEnforcementStore {
    async fn load(&self) -> Result<EnforcementState> {
        Ok(self.state.read().clone())
    }

    async fn store(&self, state: EnforcementState) -> Result<()> {
        *self.state.write() = state;
        Ok(())
    }
}

/// Decides whether tenant isolation is enforced.
///
/// Turning enforcement off always succeeds. Turning it on only succeeds when
/// every tenant table validates at the moment of the call; otherwise the
/// previous state is left exactly as it was.
pub struct EnforcementManager<C> {
    store: Arc<dyn EnforcementStore>,
    inspector: Arc<PolicyInspector<C>>,
    /// Serializes transitions; readers never take it
    transition: Mutex<()>,
}

impl<C: CatalogSource> EnforcementManager<C> {
    pub fn new(inspector: Arc<PolicyInspector<C>>) -> Self {
        Self::with_store(inspector, Arc::new(InMemoryEnforcementStore::new()))
    }

    pub fn with_store(inspector: Arc<PolicyInspector<C>>, store: Arc<dyn EnforcementStore>) -> Self {
        Self {
            store,
            inspector,
            transition: Mutex::new(()),
        }
    }

    /// Whether request paths should apply tenant scoping.
    /// A store that cannot be read counts as enforcing.
    pub async fn is_enabled(&self) -> bool {
        match self.store.load().await {
            Ok(state) => state.enabled,
            Err(err) => {
                error!(error = %err, "failed to read enforcement state, assuming enforcing");
                true
            }
        }
    }

    /// Current mode
    ///
    /// # Errors
    /// When the store cannot be read.
    pub async fn mode(&self) -> Result<EnforcementMode> {
        Ok(self.store.load().await?.mode())
    }

    /// Current state with audit fields
    ///
    /// # Errors
    /// When the store cannot be read.
    pub async fn status(&self) -> Result<EnforcementState> {
        self.store.load().await
    }

    /// Change the enforcement flag on behalf of `updated_by`
    ///
    /// # Errors
    /// `InvalidActor` for a blank actor, `ValidationFailed` naming every
    /// misconfigured table when enabling is refused, or the error raised while
    /// validating or storing. The state is unchanged whenever this fails.
    pub async fn set_enabled(&self, enabled: bool, updated_by: &str) -> Result<EnforcementState> {
        let updated_by = updated_by.trim();
        if updated_by.is_empty() {
            return Err(Error::InvalidActor);
        }

        let _guard = self.transition.lock().await;

        if enabled {
            let validation = self.inspector.validate_all().await?;
            if !validation.valid {
                let tables = validation.offending_tables();
                warn!(
                    by = updated_by,
                    tables = ?tables,
                    "refused to enable tenant isolation enforcement"
                );
                return Err(Error::ValidationFailed {
                    tables,
                    message: validation.error.unwrap_or_default(),
                });
            }
        }

        // Only for the log line; a failed read must not block a disable
        let previous = self.store.load().await.ok().map(|state| state.mode());
        let next = EnforcementState {
            enabled,
            updated_at: Utc::now(),
            updated_by: updated_by.to_string(),
        };
        self.store.store(next.clone()).await?;

        if enabled {
            info!(by = updated_by, was = ?previous, "tenant isolation enforcement enabled");
        } else {
            warn!(by = updated_by, was = ?previous, "tenant isolation enforcement bypassed");
        }
        Ok(next)
    }
}
