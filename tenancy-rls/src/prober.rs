//! Live isolation smoke test

use std::sync::Arc;

use tenancy_common::types::IsolationProbeResult;
use tenancy_common::{Error, Result, TenantId};
use tracing::{info, warn};

use crate::backend::RowCounter;
use crate::context::ExecOptions;
use crate::executor::ContextExecutor;

/// Counts rows of a representative table twice, once with no tenant context
/// and once through the [`ContextExecutor`], and passes when the context-less
/// read sees nothing. Meant for post-deploy checks, not request paths.
pub struct IsolationProber<B> {
    executor: ContextExecutor<B>,
    table: String,
}

impl<B: RowCounter + 'static> IsolationProber<B> {
    pub fn new(backend: Arc<B>, table: &str) -> Self {
        Self {
            executor: ContextExecutor::new(backend),
            table: table.to_string(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Probe isolation for `tenant_id`
    ///
    /// # Errors
    /// Only `InvalidTenantId`, before any query runs. Database failures are
    /// reported inside the result.
    pub async fn probe(&self, tenant_id: &str) -> Result<IsolationProbeResult> {
        let tenant = TenantId::parse(tenant_id)?;

        let result = match self.count_without_context().await {
            Err(err) => Self::failed(0, &err),
            Ok(without_context) => match self.count_with_context(&tenant).await {
                Ok(with_context) => IsolationProbeResult {
                    passed: without_context == 0,
                    without_context_row_count: without_context,
                    with_context_row_count: with_context,
                    error: None,
                },
                // Keep what leaked even if the scoped count failed
                Err(err) => Self::failed(without_context, &err),
            },
        };

        if result.passed {
            info!(
                tenant = %tenant,
                table = %self.table,
                visible = result.with_context_row_count,
                "isolation probe passed"
            );
        } else {
            warn!(
                tenant = %tenant,
                table = %self.table,
                leaked = result.without_context_row_count,
                error = ?result.error,
                "isolation probe failed"
            );
        }
        Ok(result)
    }

    fn failed(without_context: i64, err: &Error) -> IsolationProbeResult {
        IsolationProbeResult {
            passed: false,
            without_context_row_count: without_context,
            with_context_row_count: 0,
            error: Some(Error::ProbeFailed(err.to_string()).to_string()),
        }
    }

    async fn count_with_context(&self, tenant: &TenantId) -> Result<i64> {
        let backend = Arc::clone(self.executor.backend());
        let table = self.table.clone();
        self.executor
            .run_as(tenant, ExecOptions::default(), move |txn| {
                Box::pin(async move { backend.count_rows(txn, &table).await })
            })
            .await
    }

    /// Read-only, so always rolled back
    async fn count_without_context(&self) -> Result<i64> {
        let backend = self.executor.backend();
        let mut txn = backend.begin().await?;
        let counted = backend.count_rows(&mut txn, &self.table).await;
        if let Err(err) = backend.rollback(txn).await {
            warn!(error = %err, "rollback of context-free probe failed");
        }
        counted
    }
}
