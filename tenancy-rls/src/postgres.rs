//! PostgreSQL backend over a `sqlx` pool

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use tenancy_common::config::{is_valid_identifier, DatabaseConfig};
use tenancy_common::{Error, Result};
use tracing::{debug, info};

use crate::backend::{CatalogSource, RowCounter, TransactionBackend};
use crate::policy::TenantPolicy;

/// Pooled PostgreSQL connection scoped to one schema
#[derive(Clone)]
pub struct PgDatabase {
    pool: PgPool,
    schema: String,
}

impl PgDatabase {
    /// Wrap an existing pool
    ///
    /// # Errors
    /// `ConfigError` when the schema is not a plain identifier.
    pub fn new(pool: PgPool, schema: &str) -> Result<Self> {
        if !is_valid_identifier(schema) {
            return Err(Error::ConfigError(format!("invalid schema {schema:?}")));
        }
        Ok(Self {
            pool,
            schema: schema.to_string(),
        })
    }

    /// Open a pool from configuration
    ///
    /// # Errors
    /// When the schema is invalid or the first connection cannot be made.
    pub async fn connect(config: &DatabaseConfig, schema: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await
            .map_err(Error::transaction)?;
        info!(max_connections = config.max_connections, schema, "connected to database");
        Self::new(pool, schema)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Install policies in a single transaction; all or nothing
    ///
    /// # Errors
    /// The first failing statement's error, after rolling back.
    pub async fn install_policies(&self, policies: &[TenantPolicy]) -> Result<()> {
        let mut txn = self.pool.begin().await.map_err(Error::transaction)?;
        for policy in policies {
            for statement in policy.statements() {
                debug!(%statement, "applying policy DDL");
                sqlx::query(&statement)
                    .execute(&mut *txn)
                    .await
                    .map_err(Error::transaction)?;
            }
            info!(table = %policy.qualified_table(), policy = %policy.name(), "installed tenant policy");
        }
        txn.commit().await.map_err(Error::transaction)
    }
}

#[async_trait]
impl TransactionBackend for PgDatabase {
    type Txn = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Txn> {
        self.pool.begin().await.map_err(Error::transaction)
    }

    /// `set_config(.., true)` is the transaction-local form of `SET LOCAL`,
    /// and unlike `SET` it accepts bind parameters.
    async fn set_local(&self, txn: &mut Self::Txn, name: &str, value: &str) -> Result<()> {
        sqlx::query("SELECT set_config($1, $2, true)")
            .bind(name)
            .bind(value)
            .execute(&mut **txn)
            .await
            .map_err(Error::transaction)?;
        Ok(())
    }

    async fn commit(&self, txn: Self::Txn) -> Result<()> {
        txn.commit().await.map_err(Error::transaction)
    }

    async fn rollback(&self, txn: Self::Txn) -> Result<()> {
        txn.rollback().await.map_err(Error::transaction)
    }
}

#[async_trait]
impl RowCounter for PgDatabase {
    async fn count_rows(&self, txn: &mut Self::Txn, table: &str) -> Result<i64> {
        if !is_valid_identifier(table) {
            return Err(Error::InvalidTableName(table.to_string()));
        }
        let sql = format!("SELECT count(*) FROM {}.{table}", self.schema);
        sqlx::query_scalar::<_, i64>(&sql)
            .fetch_one(&mut **txn)
            .await
            .map_err(Error::transaction)
    }
}

#[async_trait]
impl CatalogSource for PgDatabase {
    async fn rls_enabled(&self, table: &str) -> Result<bool> {
        let enabled = sqlx::query_scalar::<_, bool>(
            "SELECT c.relrowsecurity \
             FROM pg_catalog.pg_class c \
             JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
             WHERE n.nspname = $1::name AND c.relname = $2::name AND c.relkind IN ('r', 'p')",
        )
        .bind(&self.schema)
        .bind(table)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::transaction)?;
        Ok(enabled.unwrap_or(false))
    }

    async fn policy_exists(&self, table: &str, policy_name: &str) -> Result<bool> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (\
                SELECT 1 FROM pg_catalog.pg_policies \
                WHERE schemaname = $1::name AND tablename = $2::name AND policyname = $3::name\
             )",
        )
        .bind(&self.schema)
        .bind(table)
        .bind(policy_name)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::transaction)
    }

    async fn tables_with_column(&self, column: &str) -> Result<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT c.relname::text \
             FROM pg_catalog.pg_class c \
             JOIN pg_catalog.pg_namespace n ON n.oid = c.relnamespace \
             JOIN pg_catalog.pg_attribute a ON a.attrelid = c.oid \
             WHERE n.nspname = $1::name AND a.attname = $2::name \
               AND a.attnum > 0 AND NOT a.attisdropped AND c.relkind IN ('r', 'p') \
             ORDER BY 1",
        )
        .bind(&self.schema)
        .bind(column)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::transaction)
    }
}
