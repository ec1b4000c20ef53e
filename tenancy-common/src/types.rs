//! Shared types for the tenant isolation layer

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Validated tenant (account) identifier.
///
/// Only ever constructed from a well-formed, non-nil UUID, so its string form
/// is safe to hand to `set_config`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(Uuid);

impl TenantId {
    /// Parse and validate a tenant id
    pub fn parse(raw: &str) -> Result<Self, Error> {
        if raw.is_empty() {
            return Err(Error::InvalidTenantId(String::new()));
        }
        let id = Uuid::parse_str(raw).map_err(|_| Error::InvalidTenantId(raw.to_string()))?;
        Self::try_from(id)
    }
}

impl TryFrom<Uuid> for TenantId {
    type Error = Error;

    fn try_from(id: Uuid) -> Result<Self, Self::Error> {
        if id.is_nil() {
            return Err(Error::InvalidTenantId(id.to_string()));
        }
        Ok(Self(id))
    }
}

impl FromStr for TenantId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for TenantId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TenantId> for String {
    fn from(id: TenantId) -> Self {
        id.to_string()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Canonical lowercase hyphenated form, whatever the input looked like
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Process-wide enforcement toggle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnforcementState {
    pub enabled: bool,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
}

impl EnforcementState {
    /// State a process starts in: enforcing
    #[must_use]
    pub fn initial() -> Self {
        Self {
            enabled: true,
            updated_at: Utc::now(),
            updated_by: "system".to_string(),
        }
    }

    #[must_use]
    pub fn mode(&self) -> EnforcementMode {
        if self.enabled {
            EnforcementMode::Enforcing
        } else {
            EnforcementMode::Bypassed
        }
    }
}

impl Default for EnforcementState {
    fn default() -> Self {
        Self::initial()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnforcementMode {
    Enforcing,
    Bypassed,
}

/// Per-table isolation snapshot, read live from the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableIsolationStatus {
    pub table_name: String,
    pub rls_enabled: bool,
    pub policy_exists: bool,
    pub policy_name: Option<String>,
}

/// Aggregate validation over every tenant-scoped table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyValidationResult {
    pub valid: bool,
    pub tables: Vec<TableIsolationStatus>,
    pub missing_policies: Vec<String>,
    pub rls_disabled: Vec<String>,
    /// Tables carrying the tenant column that are not in the configured list
    pub unlisted_tables: Vec<String>,
    pub error: Option<String>,
}

impl PolicyValidationResult {
    /// Aggregate table snapshots, in the order given
    #[must_use]
    pub fn from_tables(tables: Vec<TableIsolationStatus>, unlisted_tables: Vec<String>) -> Self {
        let rls_disabled: Vec<String> = tables
            .iter()
            .filter(|t| !t.rls_enabled)
            .map(|t| t.table_name.clone())
            .collect();
        let missing_policies: Vec<String> = tables
            .iter()
            .filter(|t| !t.policy_exists)
            .map(|t| t.table_name.clone())
            .collect();

        let valid = rls_disabled.is_empty() && missing_policies.is_empty();
        let error = if valid {
            None
        } else {
            let mut parts = Vec::new();
            if !rls_disabled.is_empty() {
                parts.push(format!("RLS disabled on: {}", rls_disabled.join(", ")));
            }
            if !missing_policies.is_empty() {
                parts.push(format!(
                    "missing policies on: {}",
                    missing_policies.join(", ")
                ));
            }
            Some(parts.join("; "))
        };

        Self {
            valid,
            tables,
            missing_policies,
            rls_disabled,
            unlisted_tables,
            error,
        }
    }

    /// Every offending table, each named once
    #[must_use]
    pub fn offending_tables(&self) -> Vec<String> {
        let mut tables = self.rls_disabled.clone();
        for table in &self.missing_policies {
            if !tables.contains(table) {
                tables.push(table.clone());
            }
        }
        tables
    }
}

/// Outcome of a live isolation smoke test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IsolationProbeResult {
    pub passed: bool,
    pub without_context_row_count: i64,
    pub with_context_row_count: i64,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(name: &str, rls: bool, policy: bool) -> TableIsolationStatus {
        TableIsolationStatus {
            table_name: name.to_string(),
            rls_enabled: rls,
            policy_exists: policy,
            policy_name: policy.then(|| format!("rls_{name}_tenant")),
        }
    }

    #[test]
    fn test_tenant_id_rejects_empty_and_garbage() {
        assert!(matches!(TenantId::parse(""), Err(Error::InvalidTenantId(_))));
        assert!(matches!(
            TenantId::parse("'; reset all; --"),
            Err(Error::InvalidTenantId(_))
        ));
        assert!(TenantId::parse("00000000-0000-0000-0000-000000000000").is_err());
    }

    #[test]
    fn test_tenant_id_from_uuid_rejects_nil() {
        assert!(matches!(
            TenantId::try_from(Uuid::nil()),
            Err(Error::InvalidTenantId(_))
        ));

        let raw = Uuid::parse_str("11111111-1111-1111-1111-111111111111").unwrap();
        let id = TenantId::try_from(raw).unwrap();
        assert_eq!(id, TenantId::parse("11111111-1111-1111-1111-111111111111").unwrap());
    }

    #[test]
    fn test_tenant_id_canonical_form() {
        let id = TenantId::parse("11111111111111111111111111111111").unwrap();
        assert_eq!(id.to_string(), "11111111-1111-1111-1111-111111111111");

        let upper = TenantId::parse("AAAAAAAA-BBBB-4CCC-8DDD-EEEEEEEEEEEE").unwrap();
        assert_eq!(upper.to_string(), "aaaaaaaa-bbbb-4ccc-8ddd-eeeeeeeeeeee");
    }

    #[test]
    fn test_tenant_id_serde() {
        let id: TenantId =
            serde_json::from_str("\"11111111-1111-1111-1111-111111111111\"").unwrap();
        assert_eq!(
            serde_json::to_string(&id).unwrap(),
            "\"11111111-1111-1111-1111-111111111111\""
        );
        assert!(serde_json::from_str::<TenantId>("\"nope\"").is_err());
    }

    #[test]
    fn test_validation_all_good() {
        let result = PolicyValidationResult::from_tables(
            vec![status("users", true, true), status("invites", true, true)],
            vec![],
        );
        assert!(result.valid);
        assert!(result.error.is_none());
    }

    #[test]
    fn test_validation_names_every_offender() {
        let result = PolicyValidationResult::from_tables(
            vec![
                status("users", true, true),
                status("invites", false, true),
                status("audit_logs", true, false),
            ],
            vec![],
        );
        assert!(!result.valid);
        assert_eq!(result.rls_disabled, vec!["invites"]);
        assert_eq!(result.missing_policies, vec!["audit_logs"]);
        assert_eq!(
            result.error.as_deref(),
            Some("RLS disabled on: invites; missing policies on: audit_logs")
        );
        assert_eq!(result.offending_tables(), vec!["invites", "audit_logs"]);
    }

    #[test]
    fn test_unlisted_tables_do_not_invalidate() {
        let result = PolicyValidationResult::from_tables(
            vec![status("users", true, true)],
            vec!["projects".to_string()],
        );
        assert!(result.valid);
        assert_eq!(result.unlisted_tables, vec!["projects"]);
    }

    #[test]
    fn test_enforcement_state_starts_enforcing() {
        let state = EnforcementState::initial();
        assert!(state.enabled);
        assert_eq!(state.mode(), EnforcementMode::Enforcing);
        assert_eq!(state.updated_by, "system");
    }
}
