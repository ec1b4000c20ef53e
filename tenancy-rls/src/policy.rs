//! Tenant policy definitions and the DDL that installs them

use serde::{Deserialize, Serialize};
use tenancy_common::config::{is_valid_identifier, is_valid_table_name, RlsConfig};
use tenancy_common::{Error, Result};

use crate::context::{ADMIN_BYPASS_SETTING, TENANT_ID_SETTING};

/// Conventional name of the tenant policy on `table`
#[must_use]
pub fn policy_name_for(table: &str) -> String {
    format!("rls_{table}_tenant")
}

/// RLS Policy command types
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PolicyCommand {
    #[default]
    All,
    Select,
    Insert,
    Update,
    Delete,
}

impl PolicyCommand {
    #[must_use]
    pub fn as_sql(&self) -> &'static str {
        match self {
            PolicyCommand::All => "ALL",
            PolicyCommand::Select => "SELECT",
            PolicyCommand::Insert => "INSERT",
            PolicyCommand::Update => "UPDATE",
            PolicyCommand::Delete => "DELETE",
        }
    }

    /// INSERT policies only take WITH CHECK
    fn has_using(self) -> bool {
        !matches!(self, PolicyCommand::Insert)
    }

    /// SELECT and DELETE policies only take USING
    fn has_check(self) -> bool {
        matches!(
            self,
            PolicyCommand::All | PolicyCommand::Insert | PolicyCommand::Update
        )
    }
}

/// Tenant isolation policy for one table.
///
/// The predicate reads exactly [`TENANT_ID_SETTING`] and
/// [`ADMIN_BYPASS_SETTING`], the settings the executor writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantPolicy {
    pub schema: String,
    pub table: String,
    /// Column holding the owning tenant id
    pub tenant_column: String,
    pub command: PolicyCommand,
    /// Apply the policy to the table owner as well
    pub force: bool,
}

impl TenantPolicy {
    /// Create a policy for `table`
    ///
    /// # Errors
    /// `InvalidTableName` when any identifier is not a plain lowercase name.
    pub fn new(schema: &str, table: &str, tenant_column: &str) -> Result<Self> {
        if !is_valid_table_name(table) {
            return Err(Error::InvalidTableName(table.to_string()));
        }
        for name in [schema, tenant_column] {
            if !is_valid_identifier(name) {
                return Err(Error::InvalidTableName(name.to_string()));
            }
        }
        Ok(Self {
            schema: schema.to_string(),
            table: table.to_string(),
            tenant_column: tenant_column.to_string(),
            command: PolicyCommand::All,
            force: true,
        })
    }

    /// One policy per configured tenant table
    ///
    /// # Errors
    /// See [`TenantPolicy::new`].
    pub fn for_config(config: &RlsConfig) -> Result<Vec<Self>> {
        config
            .tenant_tables
            .iter()
            .map(|table| Self::new(&config.schema, table, &config.tenant_column))
            .collect()
    }

    /// Restrict to a single command
    #[must_use]
    pub fn for_command(mut self, command: PolicyCommand) -> Self {
        self.command = command;
        self
    }

    /// Leave the table owner exempt
    #[must_use]
    pub fn without_force(mut self) -> Self {
        self.force = false;
        self
    }

    #[must_use]
    pub fn name(&self) -> String {
        policy_name_for(&self.table)
    }

    /// Get the qualified table name
    #[must_use]
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// Row predicate. `current_setting(.., true)` yields `''` rather than NULL
    /// once a setting has been defined earlier in the session, hence `nullif`.
    #[must_use]
    pub fn predicate(&self) -> String {
        format!(
            "{column} = nullif(current_setting('{tenant}', true), '')::uuid \
             OR coalesce(nullif(current_setting('{admin}', true), '')::boolean, false)",
            column = self.tenant_column,
            tenant = TENANT_ID_SETTING,
            admin = ADMIN_BYPASS_SETTING,
        )
    }

    /// Statements that (re)install the policy, in order
    #[must_use]
    pub fn statements(&self) -> Vec<String> {
        let table = self.qualified_table();
        let name = self.name();
        let mut statements = vec![format!("ALTER TABLE {table} ENABLE ROW LEVEL SECURITY")];
        if self.force {
            statements.push(format!("ALTER TABLE {table} FORCE ROW LEVEL SECURITY"));
        }
        statements.push(format!("DROP POLICY IF EXISTS {name} ON {table}"));

        let mut create = format!(
            "CREATE POLICY {name} ON {table} FOR {}",
            self.command.as_sql()
        );
        let predicate = self.predicate();
        if self.command.has_using() {
            create.push_str(&format!(" USING ({predicate})"));
        }
        if self.command.has_check() {
            create.push_str(&format!(" WITH CHECK ({predicate})"));
        }
        statements.push(create);
        statements
    }
}
