//! Catalog inspection of tenant tables

use std::sync::Arc;

use futures::future::try_join_all;
use tenancy_common::config::{is_valid_table_name, RlsConfig};
use tenancy_common::types::{PolicyValidationResult, TableIsolationStatus};
use tenancy_common::{Error, Result};
use tracing::{debug, warn};

use crate::backend::CatalogSource;
use crate::policy::policy_name_for;

/// Answers whether tenant tables enforce isolation, straight from the catalog.
/// Nothing is cached: every call re-reads live configuration.
pub struct PolicyInspector<C> {
    catalog: Arc<C>,
    tables: Vec<String>,
    tenant_column: String,
}

impl<C: CatalogSource> PolicyInspector<C> {
    pub fn new(catalog: Arc<C>, config: &RlsConfig) -> Self {
        Self {
            catalog,
            tables: config.tenant_tables.clone(),
            tenant_column: config.tenant_column.clone(),
        }
    }

    /// Tables checked by [`Self::validate_all`]
    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    /// Inspect a single table
    ///
    /// # Errors
    /// `InvalidTableName` for names that are not plain identifiers,
    /// `TransactionFailed` when a catalog query fails.
    pub async fn check_table(&self, table: &str) -> Result<TableIsolationStatus> {
        if !is_valid_table_name(table) {
            return Err(Error::InvalidTableName(table.to_string()));
        }
        let policy_name = policy_name_for(table);

        let rls_enabled = self.catalog.rls_enabled(table).await?;
        let policy_exists = self.catalog.policy_exists(table, &policy_name).await?;
        debug!(table, rls_enabled, policy_exists, "checked table isolation");

        Ok(TableIsolationStatus {
            table_name: table.to_string(),
            rls_enabled,
            policy_exists,
            policy_name: policy_exists.then_some(policy_name),
        })
    }

    /// Inspect every configured tenant table
    ///
    /// # Errors
    /// `TransactionFailed` when a catalog query fails. Misconfiguration is not
    /// an error; it is reported through the result.
    pub async fn validate_all(&self) -> Result<PolicyValidationResult> {
        let statuses =
            try_join_all(self.tables.iter().map(|table| self.check_table(table))).await?;

        let unlisted: Vec<String> = self
            .catalog
            .tables_with_column(&self.tenant_column)
            .await?
            .into_iter()
            .filter(|table| !self.tables.contains(table))
            .collect();
        if !unlisted.is_empty() {
            warn!(
                tables = ?unlisted,
                column = %self.tenant_column,
                "tables carry the tenant column but are not validated"
            );
        }

        let result = PolicyValidationResult::from_tables(statuses, unlisted);
        if let Some(error) = &result.error {
            warn!(%error, "tenant policy validation failed");
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{FailPoint, MemoryDatabase};

    fn inspector(db: &Arc<MemoryDatabase>) -> PolicyInspector<MemoryDatabase> {
        PolicyInspector::new(db.clone(), &RlsConfig::default())
    }

    fn configured() -> Arc<MemoryDatabase> {
        let tables = RlsConfig::default().tenant_tables;
        let names: Vec<&str> = tables.iter().map(String::as_str).collect();
        Arc::new(MemoryDatabase::with_isolated_tables(&names))
    }

    #[tokio::test]
    async fn test_check_configured_table() {
        let db = configured();
        let status = inspector(&db).check_table("users").await.unwrap();

        assert!(status.rls_enabled);
        assert!(status.policy_exists);
        assert_eq!(status.policy_name.as_deref(), Some("rls_users_tenant"));
    }

    #[tokio::test]
    async fn test_misnamed_policy_is_distinct_state() {
        let db = configured();
        db.drop_policy("invites", "rls_invites_tenant").unwrap();
        db.create_policy("invites", "invites_by_account").unwrap();

        let status = inspector(&db).check_table("invites").await.unwrap();
        assert!(status.rls_enabled);
        assert!(!status.policy_exists);
        assert!(status.policy_name.is_none());
    }

    #[tokio::test]
    async fn test_unknown_table_reports_nothing_configured() {
        let db = configured();
        let status = inspector(&db).check_table("projects").await.unwrap();
        assert!(!status.rls_enabled);
        assert!(!status.policy_exists);
    }

    #[tokio::test]
    async fn test_check_rejects_bad_name() {
        let db = configured();
        let err = inspector(&db)
            .check_table("users where 1=1")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTableName(_)));

        let err = inspector(&db)
            .check_table(&"t".repeat(53))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTableName(_)));
    }

    #[tokio::test]
    async fn test_validate_preserves_table_order() {
        let db = configured();
        let result = inspector(&db).validate_all().await.unwrap();

        let names: Vec<&str> = result.tables.iter().map(|t| t.table_name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "workspaces",
                "users",
                "audit_logs",
                "subscriptions",
                "invites",
                "workspace_memberships"
            ]
        );
    }

    #[tokio::test]
    async fn test_validate_reports_unlisted_tables() {
        let db = configured();
        db.create_table("projects");
        db.create_plain_table("countries");

        let result = inspector(&db).validate_all().await.unwrap();
        assert!(result.valid);
        assert_eq!(result.unlisted_tables, vec!["projects"]);
    }

    #[tokio::test]
    async fn test_catalog_failure_is_an_error() {
        let db = configured();
        db.fail_on(FailPoint::Catalog);

        let err = inspector(&db).validate_all().await.unwrap_err();
        assert!(matches!(err, Error::TransactionFailed(_)));
    }
}
