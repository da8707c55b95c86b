//! API route handlers

pub mod admin;
pub mod health;
pub mod subscription;
pub mod webhooks;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

/// Build the full application router
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(
            state
                .config
                .frontend_url
                .parse::<axum::http::HeaderValue>()
                .unwrap_or_else(|_| axum::http::HeaderValue::from_static("http://localhost:3000")),
        )
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route(
            "/api/v1/users/:user_id/trial",
            post(subscription::start_trial),
        )
        .route(
            "/api/v1/users/:user_id/subscription",
            get(subscription::get_effective_state),
        )
        .route(
            "/api/v1/users/:user_id/features/:key",
            get(subscription::check_feature_access),
        )
        .route(
            "/api/v1/users/:user_id/limits/:kind",
            get(subscription::check_limit_access),
        )
        .route(
            "/api/v1/users/:user_id/audit",
            get(subscription::list_audit_entries),
        )
        .route("/api/v1/admin/users/:user_id/state", post(admin::set_state))
        .route(
            "/api/v1/admin/users/:user_id/restore",
            post(admin::restore_tenant),
        )
        .route("/webhooks/billing", post(webhooks::billing_webhook))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
