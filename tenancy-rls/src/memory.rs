//! In-memory database that models PostgreSQL row level security.
//!
//! Tables carry a RLS flag, a set of named tenant policies and rows owned by a
//! tenant. Visibility follows the same rules the generated policies encode:
//! - RLS off: every row is visible
//! - RLS on, no policy: nothing is visible
//! - RLS on with a policy: rows whose owner matches the transaction's tenant
//!   setting, or every row when the admin bypass is set
//!
//! Settings live on the transaction handle and vanish with it, which is the
//! contract [`TransactionBackend::set_local`] asks of real backends.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tenancy_common::{Error, Result};
use uuid::Uuid;

use crate::backend::{CatalogSource, RowCounter, TransactionBackend};
use crate::context::{ADMIN_BYPASS_SETTING, TENANT_ID_SETTING};
use crate::policy::policy_name_for;

/// Tenant column given to tables created with [`MemoryDatabase::create_table`]
pub const MEMORY_TENANT_COLUMN: &str = "account_id";

/// Operations that can be told to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Begin,
    SetLocal,
    Count,
    Commit,
    Rollback,
    Catalog,
}

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("relation \"{0}\" does not exist")]
    UndefinedTable(String),

    #[error("no tenant context set for insert into \"{0}\"")]
    MissingContext(String),

    #[error("injected failure at {0:?}")]
    Injected(FailPoint),
}

#[derive(Debug, Default, Clone)]
struct MemoryTable {
    rls_enabled: bool,
    policies: Vec<String>,
    tenant_column: Option<String>,
    rows: Vec<Uuid>,
}

impl MemoryTable {
    fn is_visible(&self, owner: Uuid, settings: &HashMap<String, String>) -> bool {
        if !self.rls_enabled {
            return true;
        }
        if self.policies.is_empty() {
            return false;
        }
        if settings.get(ADMIN_BYPASS_SETTING).map(String::as_str) == Some("true") {
            return true;
        }
        settings
            .get(TENANT_ID_SETTING)
            .and_then(|raw| Uuid::parse_str(raw).ok())
            == Some(owner)
    }
}

/// Transaction handle for [`MemoryDatabase`]
#[derive(Debug)]
pub struct MemoryTxn {
    settings: HashMap<String, String>,
    pending: Vec<(String, Uuid)>,
}

impl MemoryTxn {
    /// Equivalent of `current_setting(name, true)`
    #[must_use]
    pub fn current_setting(&self, name: &str) -> Option<&str> {
        self.settings.get(name).map(String::as_str)
    }
}

/// Transaction counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub begun: u64,
    pub committed: u64,
    pub rolled_back: u64,
}

/// In-memory catalog and row store
#[derive(Default)]
pub struct MemoryDatabase {
    tables: RwLock<HashMap<String, MemoryTable>>,
    failures: Mutex<HashSet<FailPoint>>,
    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
}

impl MemoryDatabase {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Database where every listed table has RLS on and its conventional policy
    #[must_use]
    pub fn with_isolated_tables(tables: &[&str]) -> Self {
        let db = Self::new();
        {
            let mut catalog = db.tables.write();
            for table in tables {
                catalog.insert(
                    (*table).to_string(),
                    MemoryTable {
                        tenant_column: Some(MEMORY_TENANT_COLUMN.to_string()),
                        rls_enabled: true,
                        policies: vec![policy_name_for(table)],
                        ..MemoryTable::default()
                    },
                );
            }
        }
        db
    }

    /// Create a table carrying the tenant column
    pub fn create_table(&self, table: &str) {
        self.tables
            .write()
            .entry(table.to_string())
            .or_insert_with(|| MemoryTable {
                tenant_column: Some(MEMORY_TENANT_COLUMN.to_string()),
                ..MemoryTable::default()
            });
    }

    /// Create a table with no tenant column
    pub fn create_plain_table(&self, table: &str) {
        self.tables.write().entry(table.to_string()).or_default();
    }

    /// Enable RLS on a table
    pub fn enable_rls(&self, table: &str) {
        if let Some(t) = self.tables.write().get_mut(table) {
            t.rls_enabled = true;
        }
    }

    /// Disable RLS on a table
    pub fn disable_rls(&self, table: &str) {
        if let Some(t) = self.tables.write().get_mut(table) {
            t.rls_enabled = false;
        }
    }

    /// Create a tenant policy
    ///
    /// # Errors
    /// When the table is unknown or the policy name is taken.
    pub fn create_policy(&self, table: &str, name: &str) -> std::result::Result<(), String> {
        let mut tables = self.tables.write();
        let t = tables
            .get_mut(table)
            .ok_or_else(|| format!("Table '{table}' not found"))?;

        if t.policies.iter().any(|p| p == name) {
            return Err(format!("Policy '{name}' already exists"));
        }
        t.policies.push(name.to_string());
        Ok(())
    }

    /// Drop a policy
    ///
    /// # Errors
    /// When the table or the policy is unknown.
    pub fn drop_policy(&self, table: &str, name: &str) -> std::result::Result<(), String> {
        let mut tables = self.tables.write();
        let t = tables
            .get_mut(table)
            .ok_or_else(|| format!("No policies found for {table}"))?;

        let original_len = t.policies.len();
        t.policies.retain(|p| p != name);
        if t.policies.len() == original_len {
            return Err(format!("Policy '{name}' not found"));
        }
        Ok(())
    }

    /// Insert a committed row owned by `tenant`, bypassing RLS
    ///
    /// # Errors
    /// When the table is unknown.
    pub fn insert_row(&self, table: &str, tenant: Uuid) -> std::result::Result<(), String> {
        let mut tables = self.tables.write();
        let t = tables
            .get_mut(table)
            .ok_or_else(|| format!("Table '{table}' not found"))?;
        t.rows.push(tenant);
        Ok(())
    }

    /// Insert a row owned by the transaction's tenant; visible to others on commit
    ///
    /// # Errors
    /// When the table is unknown or no tenant setting is present.
    pub fn insert_in(&self, txn: &mut MemoryTxn, table: &str) -> Result<()> {
        if !self.tables.read().contains_key(table) {
            return Err(Error::transaction(MemoryError::UndefinedTable(
                table.to_string(),
            )));
        }
        let owner = txn
            .current_setting(TENANT_ID_SETTING)
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .ok_or_else(|| Error::transaction(MemoryError::MissingContext(table.to_string())))?;
        txn.pending.push((table.to_string(), owner));
        Ok(())
    }

    /// Committed rows in a table, ignoring RLS
    #[must_use]
    pub fn row_count(&self, table: &str) -> usize {
        self.tables.read().get(table).map_or(0, |t| t.rows.len())
    }

    /// Make every later call to `point` fail until [`Self::clear_failures`]
    pub fn fail_on(&self, point: FailPoint) {
        self.failures.lock().insert(point);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    #[must_use]
    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            begun: self.begun.load(Ordering::SeqCst),
            committed: self.committed.load(Ordering::SeqCst),
            rolled_back: self.rolled_back.load(Ordering::SeqCst),
        }
    }

    fn check(&self, point: FailPoint) -> Result<()> {
        if self.failures.lock().contains(&point) {
            return Err(Error::transaction(MemoryError::Injected(point)));
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionBackend for MemoryDatabase {
    type Txn = MemoryTxn;

    async fn begin(&self) -> Result<MemoryTxn> {
        self.check(FailPoint::Begin)?;
        self.begun.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryTxn {
            settings: HashMap::new(),
            pending: Vec::new(),
        })
    }

    async fn set_local(&self, txn: &mut MemoryTxn, name: &str, value: &str) -> Result<()> {
        self.check(FailPoint::SetLocal)?;
        txn.settings.insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn commit(&self, txn: MemoryTxn) -> Result<()> {
        self.check(FailPoint::Commit)?;
        let mut tables = self.tables.write();
        for (table, owner) in txn.pending {
            if let Some(t) = tables.get_mut(&table) {
                t.rows.push(owner);
            }
        }
        self.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self, _txn: MemoryTxn) -> Result<()> {
        self.check(FailPoint::Rollback)?;
        self.rolled_back.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl RowCounter for MemoryDatabase {
    async fn count_rows(&self, txn: &mut MemoryTxn, table: &str) -> Result<i64> {
        self.check(FailPoint::Count)?;
        let tables = self.tables.read();
        let t = tables
            .get(table)
            .ok_or_else(|| Error::transaction(MemoryError::UndefinedTable(table.to_string())))?;

        let committed = t.rows.iter().copied();
        let pending = txn
            .pending
            .iter()
            .filter(|(name, _)| name == table)
            .map(|(_, owner)| *owner);

        let visible = committed
            .chain(pending)
            .filter(|owner| t.is_visible(*owner, &txn.settings))
            .count();
        Ok(i64::try_from(visible).unwrap_or(i64::MAX))
    }
}

#[async_trait]
impl CatalogSource for MemoryDatabase {
    async fn rls_enabled(&self, table: &str) -> Result<bool> {
        self.check(FailPoint::Catalog)?;
        Ok(self.tables.read().get(table).is_some_and(|t| t.rls_enabled))
    }

    async fn policy_exists(&self, table: &str, policy_name: &str) -> Result<bool> {
        self.check(FailPoint::Catalog)?;
        Ok(self
            .tables
            .read()
            .get(table)
            .is_some_and(|t| t.policies.iter().any(|p| p == policy_name)))
    }

    async fn tables_with_column(&self, column: &str) -> Result<Vec<String>> {
        self.check(FailPoint::Catalog)?;
        let mut names: Vec<String> = self
            .tables
            .read()
            .iter()
            .filter(|(_, t)| t.tenant_column.as_deref() == Some(column))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_store() {
        let db = MemoryDatabase::new();
        db.create_table("users");

        db.create_policy("users", "rls_users_tenant").unwrap();
        assert!(db.create_policy("users", "rls_users_tenant").is_err());

        db.drop_policy("users", "rls_users_tenant").unwrap();
        assert!(db.drop_policy("users", "rls_users_tenant").is_err());
        assert!(db.create_policy("missing", "x").is_err());
    }

    #[tokio::test]
    async fn test_isolated_tables_come_configured() {
        let db = MemoryDatabase::with_isolated_tables(&["users", "invites"]);

        assert!(db.rls_enabled("invites").await.unwrap());
        assert!(db.policy_exists("invites", "rls_invites_tenant").await.unwrap());
        assert!(db.create_policy("users", "rls_users_tenant").is_err());
        assert_eq!(
            db.tables_with_column(MEMORY_TENANT_COLUMN).await.unwrap(),
            vec!["invites", "users"]
        );
    }

    #[tokio::test]
    async fn test_enable_rls() {
        let db = MemoryDatabase::new();
        db.create_table("users");

        assert!(!db.rls_enabled("users").await.unwrap());
        db.enable_rls("users");
        assert!(db.rls_enabled("users").await.unwrap());
        assert!(!db.rls_enabled("nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_rls_without_policy_hides_everything() {
        let db = MemoryDatabase::new();
        db.create_table("invites");
        db.enable_rls("invites");
        let owner = Uuid::new_v4();
        db.insert_row("invites", owner).unwrap();

        let mut txn = db.begin().await.unwrap();
        db.set_local(&mut txn, TENANT_ID_SETTING, &owner.to_string())
            .await
            .unwrap();
        assert_eq!(db.count_rows(&mut txn, "invites").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rls_off_shows_everything() {
        let db = MemoryDatabase::new();
        db.create_table("invites");
        db.insert_row("invites", Uuid::new_v4()).unwrap();
        db.insert_row("invites", Uuid::new_v4()).unwrap();

        let mut txn = db.begin().await.unwrap();
        assert_eq!(db.count_rows(&mut txn, "invites").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_pending_rows_discarded_on_rollback() {
        let db = MemoryDatabase::with_isolated_tables(&["workspaces"]);
        let owner = Uuid::new_v4();

        let mut txn = db.begin().await.unwrap();
        db.set_local(&mut txn, TENANT_ID_SETTING, &owner.to_string())
            .await
            .unwrap();
        db.insert_in(&mut txn, "workspaces").unwrap();
        assert_eq!(db.count_rows(&mut txn, "workspaces").await.unwrap(), 1);
        db.rollback(txn).await.unwrap();

        assert_eq!(db.row_count("workspaces"), 0);
    }

    #[tokio::test]
    async fn test_tables_with_column_sorted() {
        let db = MemoryDatabase::new();
        db.create_table("users");
        db.create_table("audit_logs");
        db.create_plain_table("countries");

        assert_eq!(
            db.tables_with_column(MEMORY_TENANT_COLUMN).await.unwrap(),
            vec!["audit_logs", "users"]
        );
    }

    #[tokio::test]
    async fn test_fail_points() {
        let db = MemoryDatabase::new();
        db.fail_on(FailPoint::Begin);
        assert!(matches!(db.begin().await, Err(Error::TransactionFailed(_))));

        db.clear_failures();
        assert!(db.begin().await.is_ok());
        assert_eq!(db.stats().begun, 1);
    }
}
