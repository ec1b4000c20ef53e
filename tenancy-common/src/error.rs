//! Error types for the tenant isolation layer

use thiserror::Error;

/// Boxed driver error carried by [`Error::TransactionFailed`]
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Tenant isolation error types
#[derive(Error, Debug)]
pub enum Error {
    // Caller Errors
    #[error("Invalid tenant id: {0:?}")]
    InvalidTenantId(String),

    #[error("Enforcement changes must name the operator making them")]
    InvalidActor,

    #[error("Invalid table name: {0:?}")]
    InvalidTableName(String),

    // Policy Errors
    #[error("Policy validation failed: {message}")]
    ValidationFailed {
        /// Every table that is missing a policy or has RLS disabled
        tables: Vec<String>,
        message: String,
    },

    // Database Errors
    #[error("Transaction failed: {0}")]
    TransactionFailed(#[source] BoxError),

    #[error("Isolation probe failed: {0}")]
    ProbeFailed(String),

    // General Errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    TomlError(#[from] toml::de::Error),
}

/// Result type alias for tenant isolation operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap a driver error without altering it
    pub fn transaction<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::TransactionFailed(Box::new(err))
    }

    /// HTTP status code an admin endpoint should answer with
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            // 400 Bad Request
            Self::InvalidTenantId(_) | Self::InvalidActor | Self::InvalidTableName(_) => 400,

            // 409 Conflict
            Self::ValidationFailed { .. } => 409,

            // 500 Internal Server Error
            Self::TransactionFailed(_)
            | Self::ProbeFailed(_)
            | Self::ConfigError(_)
            | Self::IoError(_)
            | Self::TomlError(_) => 500,
        }
    }

    /// Stable error code for API responses
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidTenantId(_) => "invalid_tenant_id",
            Self::InvalidActor => "invalid_actor",
            Self::InvalidTableName(_) => "invalid_table_name",
            Self::ValidationFailed { .. } => "validation_failed",
            Self::TransactionFailed(_) => "transaction_failed",
            Self::ProbeFailed(_) => "probe_failed",
            Self::ConfigError(_) => "config_error",
            Self::IoError(_) => "io_error",
            Self::TomlError(_) => "toml_error",
        }
    }
}
