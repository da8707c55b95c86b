use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sheettools_api::{routes, AppState, Config};
use sheettools_billing::SnapshotCrypto;
use sheettools_shared::db;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "sheettools_api=info,sheettools_billing=info,tower_http=info".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let crypto = SnapshotCrypto::from_env().map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let pool = db::create_pool(&config.database_url).await?;
    db::run_migrations(&pool).await?;

    let port = config.port;
    let state = AppState::new(pool, config, crypto);
    let app = routes::router(state);

    let addr = format!("0.0.0.0:{}", port);
    tracing::info!(addr = %addr, "Sheet Tools API listening");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind listener")?;
    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
