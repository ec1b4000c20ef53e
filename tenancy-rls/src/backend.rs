//! Seams between the isolation components and the database driver

use async_trait::async_trait;
use tenancy_common::Result;

/// Opens transactions and sets transaction-local settings on them.
///
/// Implementations must scope `set_local` to the transaction: once the
/// transaction commits or rolls back, nothing set through it may be visible
/// to any later transaction, including one on the same pooled connection.
#[async_trait]
pub trait TransactionBackend: Send + Sync {
    /// Driver transaction handle handed to operations
    type Txn: Send;

    async fn begin(&self) -> Result<Self::Txn>;

    async fn set_local(&self, txn: &mut Self::Txn, name: &str, value: &str) -> Result<()>;

    async fn commit(&self, txn: Self::Txn) -> Result<()>;

    async fn rollback(&self, txn: Self::Txn) -> Result<()>;
}

/// Counts rows visible to a transaction, after RLS has been applied
#[async_trait]
pub trait RowCounter: TransactionBackend {
    async fn count_rows(&self, txn: &mut Self::Txn, table: &str) -> Result<i64>;
}

/// Read-only access to catalog metadata for the configured schema
#[async_trait]
pub trait CatalogSource: Send + Sync {
    /// Whether row level security is turned on for the table.
    /// A table that does not exist reports `false`.
    async fn rls_enabled(&self, table: &str) -> Result<bool>;

    async fn policy_exists(&self, table: &str, policy_name: &str) -> Result<bool>;

    /// Tables having a column with this name, sorted by name
    async fn tables_with_column(&self, column: &str) -> Result<Vec<String>>;
}
