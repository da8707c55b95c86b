//! Billing error types

use thiserror::Error;

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("External provider error: {0}")]
    ExternalProvider(String),

    #[error("Concurrent modification detected: {0}")]
    ConcurrencyConflict(String),

    #[error("Invalid subscription state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Tenant is archived and cannot be modified: {0}")]
    TenantArchived(String),

    #[error("Restoration window has expired for tenant: {0}")]
    RestorationExpired(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        BillingError::ExternalProvider(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
