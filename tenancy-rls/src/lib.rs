//! Tenant Isolation Engine
//!
//! Scopes database work to a single tenant using PostgreSQL row level security:
//! - Transaction-local tenant context injection
//! - Catalog inspection of per-table RLS flags and policies
//! - A validated, process-wide enforcement toggle
//! - Live isolation probing

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod context;
pub mod enforcement;
pub mod executor;
pub mod inspector;
pub mod memory;
pub mod policy;
pub mod postgres;
pub mod prober;

pub use backend::{CatalogSource, RowCounter, TransactionBackend};
pub use context::{ExecOptions, TenantContext, ADMIN_BYPASS_SETTING, TENANT_ID_SETTING};
pub use enforcement::{EnforcementManager, EnforcementStore, InMemoryEnforcementStore};
pub use executor::ContextExecutor;
pub use inspector::PolicyInspector;
pub use policy::{policy_name_for, PolicyCommand, TenantPolicy};
pub use prober::IsolationProber;
