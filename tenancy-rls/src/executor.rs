//! Runs units of work inside tenant-scoped transactions

use std::sync::Arc;

use futures::future::BoxFuture;
use tenancy_common::{Error, TenantId};
use tracing::{debug, warn};

use crate::backend::TransactionBackend;
use crate::context::{ExecOptions, TenantContext};

/// Entry point for every tenant-scoped database operation.
///
/// Each call opens its own transaction, sets the tenant (and optionally the
/// admin bypass) with transaction-local scope, runs the operation, then
/// commits. Any error rolls the transaction back and is returned unchanged.
/// No retries are attempted.
pub struct ContextExecutor<B> {
    backend: Arc<B>,
}

impl<B> Clone for ContextExecutor<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
        }
    }
}

impl<B: TransactionBackend> ContextExecutor<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Run `operation` scoped to `tenant_id` without admin bypass
    ///
    /// # Errors
    /// `InvalidTenantId` before any I/O when the id is empty or malformed,
    /// otherwise whatever the transaction or the operation failed with.
    pub async fn run<T, E, F>(&self, tenant_id: &str, operation: F) -> Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut B::Txn) -> BoxFuture<'t, Result<T, E>> + Send,
        E: From<Error>,
    {
        self.run_with(tenant_id, ExecOptions::default(), operation)
            .await
    }

    /// Run `operation` scoped to `tenant_id` with explicit options
    ///
    /// # Errors
    /// See [`ContextExecutor::run`].
    pub async fn run_with<T, E, F>(
        &self,
        tenant_id: &str,
        options: ExecOptions,
        operation: F,
    ) -> Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut B::Txn) -> BoxFuture<'t, Result<T, E>> + Send,
        E: From<Error>,
    {
        let tenant = TenantId::parse(tenant_id)?;
        self.run_as(&tenant, options, operation).await
    }

    /// Run `operation` for an already validated tenant
    ///
    /// # Errors
    /// See [`ContextExecutor::run`].
    pub async fn run_as<T, E, F>(
        &self,
        tenant: &TenantId,
        options: ExecOptions,
        operation: F,
    ) -> Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut B::Txn) -> BoxFuture<'t, Result<T, E>> + Send,
        E: From<Error>,
    {
        let context = TenantContext::new(*tenant, options);
        debug!(tenant = %tenant, admin = context.is_admin, "opening tenant transaction");

        let mut txn = self.backend.begin().await?;

        if let Err(err) = self.apply(&mut txn, &context).await {
            self.abort(txn, &context).await;
            return Err(err.into());
        }

        let outcome = operation(&mut txn).await;
        match outcome {
            Ok(value) => {
                self.backend.commit(txn).await?;
                debug!(tenant = %tenant, "tenant transaction committed");
                Ok(value)
            }
            Err(err) => {
                self.abort(txn, &context).await;
                Err(err)
            }
        }
    }

    async fn apply(&self, txn: &mut B::Txn, context: &TenantContext) -> Result<(), Error> {
        for (name, value) in context.settings() {
            self.backend.set_local(txn, name, &value).await?;
        }
        Ok(())
    }

    /// Roll back, keeping the caller's error as the one that surfaces
    async fn abort(&self, txn: B::Txn, context: &TenantContext) {
        if let Err(err) = self.backend.rollback(txn).await {
            warn!(tenant = %context.tenant_id, error = %err, "rollback failed");
        } else {
            debug!(tenant = %context.tenant_id, "tenant transaction rolled back");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RowCounter;
    use crate::memory::{FailPoint, MemoryDatabase};
    use uuid::Uuid;

    const TENANT_A: &str = "11111111-1111-1111-1111-111111111111";
    const TENANT_B: &str = "22222222-2222-2222-2222-222222222222";

    fn setup() -> (ContextExecutor<MemoryDatabase>, Arc<MemoryDatabase>) {
        let db = Arc::new(MemoryDatabase::with_isolated_tables(&["workspaces"]));
        db.insert_row("workspaces", Uuid::parse_str(TENANT_A).unwrap())
            .unwrap();
        db.insert_row("workspaces", Uuid::parse_str(TENANT_B).unwrap())
            .unwrap();
        (ContextExecutor::new(db.clone()), db)
    }

    #[tokio::test]
    async fn test_empty_tenant_never_opens_transaction() {
        let (executor, db) = setup();
        let mut invoked = false;

        let result: Result<(), Error> = executor
            .run("", |_txn| {
                invoked = true;
                Box::pin(async { Ok(()) })
            })
            .await;

        assert!(matches!(result, Err(Error::InvalidTenantId(_))));
        assert!(!invoked);
        assert_eq!(db.stats().begun, 0);
    }

    #[tokio::test]
    async fn test_malformed_tenant_rejected() {
        let (executor, db) = setup();
        let result: Result<(), Error> = executor
            .run("not-a-uuid", |_txn| Box::pin(async { Ok(()) }))
            .await;

        assert!(matches!(result, Err(Error::InvalidTenantId(_))));
        assert_eq!(db.stats().begun, 0);
    }

    #[tokio::test]
    async fn test_context_scopes_rows_and_commits() {
        let (executor, db) = setup();
        let counter = db.clone();

        let count: i64 = executor
            .run(TENANT_A, move |txn| {
                Box::pin(async move { counter.count_rows(txn, "workspaces").await })
            })
            .await
            .unwrap();

        assert_eq!(count, 1);
        let stats = db.stats();
        assert_eq!(stats.committed, 1);
        assert_eq!(stats.rolled_back, 0);
    }

    #[tokio::test]
    async fn test_admin_bypass_sees_every_tenant() {
        let (executor, db) = setup();
        let counter = db.clone();

        let count: i64 = executor
            .run_with(TENANT_A, ExecOptions::admin(), move |txn| {
                Box::pin(async move { counter.count_rows(txn, "workspaces").await })
            })
            .await
            .unwrap();

        assert_eq!(count, 2);
    }

    #[derive(Debug)]
    #[allow(dead_code)]
    enum AppError {
        Isolation(Error),
        Conflict(&'static str),
    }

    impl From<Error> for AppError {
        fn from(err: Error) -> Self {
            Self::Isolation(err)
        }
    }

    #[tokio::test]
    async fn test_operation_error_rolls_back_and_propagates_unchanged() {
        let (executor, db) = setup();
        let writer = db.clone();

        let result: Result<(), AppError> = executor
            .run(TENANT_A, move |txn| {
                Box::pin(async move {
                    writer.insert_in(txn, "workspaces")?;
                    Err::<(), _>(AppError::Conflict("slug taken"))
                })
            })
            .await;

        assert!(matches!(result, Err(AppError::Conflict("slug taken"))));
        assert_eq!(db.row_count("workspaces"), 2);
        assert_eq!(db.stats().rolled_back, 1);
        assert_eq!(db.stats().committed, 0);
    }

    #[tokio::test]
    async fn test_failed_rollback_keeps_operation_error() {
        let (executor, db) = setup();
        db.fail_on(FailPoint::Rollback);
        let writer = db.clone();

        let result: Result<(), AppError> = executor
            .run(TENANT_A, move |txn| {
                Box::pin(async move {
                    writer.insert_in(txn, "workspaces")?;
                    Err::<(), _>(AppError::Conflict("slug taken"))
                })
            })
            .await;

        assert!(matches!(result, Err(AppError::Conflict("slug taken"))));
        assert_eq!(db.row_count("workspaces"), 2);
        assert_eq!(db.stats().committed, 0);
    }

    #[tokio::test]
    async fn test_context_failure_rolls_back_before_operation() {
        let (executor, db) = setup();
        db.fail_on(FailPoint::SetLocal);
        let mut invoked = false;

        let result: Result<(), Error> = executor
            .run(TENANT_A, |_txn| {
                invoked = true;
                Box::pin(async { Ok(()) })
            })
            .await;

        assert!(matches!(result, Err(Error::TransactionFailed(_))));
        assert!(!invoked);
        assert_eq!(db.stats().rolled_back, 1);
    }

    #[tokio::test]
    async fn test_commit_failure_surfaces() {
        let (executor, db) = setup();
        db.fail_on(FailPoint::Commit);

        let result: Result<(), Error> = executor
            .run(TENANT_A, |_txn| Box::pin(async { Ok(()) }))
            .await;

        assert!(matches!(result, Err(Error::TransactionFailed(_))));
    }

    #[tokio::test]
    async fn test_successful_write_is_visible_after_commit() {
        let (executor, db) = setup();
        let writer = db.clone();

        let _: () = executor
            .run(TENANT_B, move |txn| {
                Box::pin(async move { writer.insert_in(txn, "workspaces") })
            })
            .await
            .unwrap();

        assert_eq!(db.row_count("workspaces"), 3);
    }
}
