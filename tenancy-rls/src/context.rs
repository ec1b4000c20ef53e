//! Tenant context carried into a transaction as session settings

use tenancy_common::TenantId;

/// Setting read by every tenant policy to find the owning account
pub const TENANT_ID_SETTING: &str = "app.current_account_id";

/// Setting read by every tenant policy to let administrators through
pub const ADMIN_BYPASS_SETTING: &str = "app.is_admin";

/// Per-call executor options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOptions {
    /// Request the admin bypass for this transaction only
    pub is_admin: bool,
}

impl ExecOptions {
    #[must_use]
    pub fn admin() -> Self {
        Self { is_admin: true }
    }
}

/// Context injected into a single transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantContext {
    pub tenant_id: TenantId,
    pub is_admin: bool,
}

impl TenantContext {
    #[must_use]
    pub fn new(tenant_id: TenantId, options: ExecOptions) -> Self {
        Self {
            tenant_id,
            is_admin: options.is_admin,
        }
    }

    /// Check if policies should let every row through
    #[must_use]
    pub fn bypasses_rls(&self) -> bool {
        self.is_admin
    }

    /// Settings to apply, in order. The bypass flag is only ever set, never
    /// written as `false`, so an unset flag and a non-admin look the same.
    #[must_use]
    pub fn settings(&self) -> Vec<(&'static str, String)> {
        let mut settings = vec![(TENANT_ID_SETTING, self.tenant_id.to_string())];
        if self.bypasses_rls() {
            settings.push((ADMIN_BYPASS_SETTING, "true".to_string()));
        }
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> TenantId {
        TenantId::parse("11111111-1111-1111-1111-111111111111").unwrap()
    }

    #[test]
    fn test_tenant_only_settings() {
        let ctx = TenantContext::new(tenant(), ExecOptions::default());
        assert!(!ctx.bypasses_rls());
        assert_eq!(
            ctx.settings(),
            vec![(
                TENANT_ID_SETTING,
                "11111111-1111-1111-1111-111111111111".to_string()
            )]
        );
    }

    #[test]
    fn test_admin_settings() {
        let ctx = TenantContext::new(tenant(), ExecOptions::admin());
        assert!(ctx.bypasses_rls());

        let settings = ctx.settings();
        assert_eq!(settings.len(), 2);
        assert_eq!(settings[1], (ADMIN_BYPASS_SETTING, "true".to_string()));
    }
}
