//! Sheet Tools API Library
//!
//! HTTP surface over the billing core: effective-state and gate reads for
//! the UI, admin state overrides, and the billing-provider webhook.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
