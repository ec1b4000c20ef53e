//! Tenant Isolation Control Plane
//!
//! Scopes every database transaction of a multi-tenant application to a
//! single tenant using PostgreSQL row level security.
//!
//! # Features
//!
//! - **Context executor** - Transaction-local tenant and admin-bypass settings
//! - **Policy inspector** - Live catalog checks of RLS flags and tenant policies
//! - **Enforcement gate** - Process-wide toggle that only re-enables after validation
//! - **Isolation prober** - Post-deploy smoke test of the isolation boundary

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub use tenancy_common as common;
pub use tenancy_rls as rls;

use std::sync::Arc;

use tracing::info;

use tenancy_common::config::{IsolationConfig, RlsConfig};
use tenancy_common::error::Result;
use tenancy_common::types::{
    EnforcementState, IsolationProbeResult, PolicyValidationResult, TableIsolationStatus,
};
use tenancy_rls::postgres::PgDatabase;
use tenancy_rls::{
    CatalogSource, ContextExecutor, EnforcementManager, EnforcementStore,
    InMemoryEnforcementStore, IsolationProber, PolicyInspector, RowCounter, TransactionBackend,
};

/// Administrative surface and executor for one database
pub struct IsolationService<B> {
    config: RlsConfig,
    executor: ContextExecutor<B>,
    inspector: Arc<PolicyInspector<B>>,
    enforcement: EnforcementManager<B>,
    prober: IsolationProber<B>,
}

impl IsolationService<PgDatabase> {
    /// Connect to PostgreSQL and assemble the service
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid or the pool cannot connect.
    pub async fn connect(config: &IsolationConfig) -> Result<Self> {
        config.rls.validate()?;
        let database = PgDatabase::connect(&config.database, &config.rls.schema).await?;
        Self::new(Arc::new(database), &config.rls)
    }
}

impl<B> IsolationService<B>
where
    B: TransactionBackend + RowCounter + CatalogSource + 'static,
{
    /// Assemble the service with a per-process enforcement store
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn new(backend: Arc<B>, config: &RlsConfig) -> Result<Self> {
        Self::with_store(backend, config, Arc::new(InMemoryEnforcementStore::new()))
    }

    /// Assemble the service with a caller-provided enforcement store
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn with_store(
        backend: Arc<B>,
        config: &RlsConfig,
        store: Arc<dyn EnforcementStore>,
    ) -> Result<Self> {
        config.validate()?;
        info!(
            schema = %config.schema,
            tables = config.tenant_tables.len(),
            probe_table = %config.probe_table,
            "initializing tenant isolation"
        );

        let inspector = Arc::new(PolicyInspector::new(backend.clone(), config));
        Ok(Self {
            config: config.clone(),
            executor: ContextExecutor::new(backend.clone()),
            enforcement: EnforcementManager::with_store(inspector.clone(), store),
            inspector,
            prober: IsolationProber::new(backend, &config.probe_table),
        })
    }

    /// Executor for tenant-scoped work
    #[must_use]
    pub fn executor(&self) -> &ContextExecutor<B> {
        &self.executor
    }

    #[must_use]
    pub fn enforcement(&self) -> &EnforcementManager<B> {
        &self.enforcement
    }

    #[must_use]
    pub fn config(&self) -> &RlsConfig {
        &self.config
    }

    /// Whether request paths should run through the executor
    pub async fn is_enforced(&self) -> bool {
        self.enforcement.is_enabled().await
    }

    /// # Errors
    /// When the enforcement store cannot be read.
    pub async fn status(&self) -> Result<EnforcementState> {
        self.enforcement.status().await
    }

    /// # Errors
    /// See [`EnforcementManager::set_enabled`].
    pub async fn set_enabled(&self, enabled: bool, updated_by: &str) -> Result<EnforcementState> {
        self.enforcement.set_enabled(enabled, updated_by).await
    }

    /// # Errors
    /// When a catalog query fails.
    pub async fn validate_all(&self) -> Result<PolicyValidationResult> {
        self.inspector.validate_all().await
    }

    /// # Errors
    /// When the name is invalid or a catalog query fails.
    pub async fn check_table(&self, table: &str) -> Result<TableIsolationStatus> {
        self.inspector.check_table(table).await
    }

    /// # Errors
    /// When the tenant id is malformed.
    pub async fn probe(&self, tenant_id: &str) -> Result<IsolationProbeResult> {
        self.prober.probe(tenant_id).await
    }
}
