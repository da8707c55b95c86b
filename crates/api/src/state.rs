//! Shared application state

use sqlx::PgPool;
use std::sync::Arc;

use crate::config::Config;
use sheettools_billing::{
    ArchiveService, AuditLogger, SnapshotCrypto, SubscriptionLifecycle, SubscriptionStore,
};

/// State handed to every request handler
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
    pub store: SubscriptionStore,
    pub audit: AuditLogger,
    pub lifecycle: SubscriptionLifecycle,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config, crypto: SnapshotCrypto) -> Self {
        let store = SubscriptionStore::new(pool.clone());
        let audit = AuditLogger::new(pool.clone());
        let archive = ArchiveService::new(pool.clone(), crypto);
        let lifecycle = SubscriptionLifecycle::new(store.clone(), audit.clone(), archive);

        Self {
            pool,
            config: Arc::new(config),
            store,
            audit,
            lifecycle,
        }
    }
}
