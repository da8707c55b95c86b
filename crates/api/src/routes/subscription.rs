//! Subscription read endpoints for the dashboard
//!
//! Every response is derived through the pure evaluator at request time, so
//! the UI sees expiry the moment it happens even if the scheduled job has
//! not advanced the stored state yet.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use sheettools_billing::{
    check_feature, check_limit, evaluate, AuditLogEntry, EffectiveState, GateDecision,
    LimitDecision, LimitKind, Profile, UsageCounters,
};
use sheettools_shared::FeatureKey;

#[derive(Debug, Deserialize)]
pub struct StartTrialRequest {
    pub email: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// POST /api/v1/users/:user_id/trial
///
/// Signup path: creates the tenant profile with trial defaults.
pub async fn start_trial(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(request): Json<StartTrialRequest>,
) -> ApiResult<(StatusCode, Json<Profile>)> {
    if !request.email.contains('@') {
        return Err(ApiError::Validation("A valid email is required".to_string()));
    }

    let profile = state
        .lifecycle
        .create_trial(
            user_id,
            &request.email,
            request.display_name.as_deref(),
            OffsetDateTime::now_utc(),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(profile)))
}

/// GET /api/v1/users/:user_id/subscription
pub async fn get_effective_state(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<EffectiveState>> {
    let effective = load_effective_state(&state, user_id).await?;
    Ok(Json(effective))
}

/// GET /api/v1/users/:user_id/features/:key
pub async fn check_feature_access(
    State(state): State<AppState>,
    Path((user_id, key)): Path<(Uuid, String)>,
) -> ApiResult<Json<GateDecision>> {
    let key: FeatureKey = key
        .parse()
        .map_err(|e: String| ApiError::BadRequest(e))?;
    let effective = load_effective_state(&state, user_id).await?;
    Ok(Json(check_feature(key, &effective)))
}

/// GET /api/v1/users/:user_id/limits/:kind
pub async fn check_limit_access(
    State(state): State<AppState>,
    Path((user_id, kind)): Path<(Uuid, String)>,
) -> ApiResult<Json<LimitDecision>> {
    let kind: LimitKind = kind
        .parse()
        .map_err(|e: String| ApiError::BadRequest(e))?;

    let record = state.store.get_record(user_id).await?;
    let stored = state.store.get_usage_counters(user_id).await?;

    // Effective limits come from the subscription (tenant override, else
    // plan default); the counters table only contributes usage.
    let (campaign_limit, store_limit) = match &record {
        Some(r) => (r.effective_campaign_limit(), r.effective_store_limit()),
        None => {
            let profile = state
                .store
                .get_profile(user_id)
                .await?
                .ok_or(ApiError::NotFound)?;
            (
                profile.subscription_plan.campaign_limit(),
                profile.subscription_plan.store_limit(),
            )
        }
    };

    let counters = match stored {
        Some(c) => UsageCounters {
            campaigns_limit: campaign_limit,
            stores_limit: store_limit,
            ..c
        },
        None => UsageCounters {
            campaigns_used: 0,
            campaigns_limit: campaign_limit,
            stores_used: 0,
            stores_limit: store_limit,
            reset_at: None,
        },
    };

    Ok(Json(check_limit(kind, &counters)))
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default = "default_audit_limit")]
    pub limit: i64,
}

fn default_audit_limit() -> i64 {
    50
}

/// GET /api/v1/users/:user_id/audit
pub async fn list_audit_entries(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<Vec<AuditLogEntry>>> {
    let limit = query.limit.clamp(1, 200);
    let entries = state.audit.get_entries_for_user(user_id, limit).await?;
    Ok(Json(entries))
}

async fn load_effective_state(state: &AppState, user_id: Uuid) -> ApiResult<EffectiveState> {
    let record = state.store.get_record(user_id).await?;
    let profile = state.store.get_profile(user_id).await?;

    if record.is_none() && profile.is_none() {
        return Err(ApiError::NotFound);
    }

    Ok(evaluate(
        record.as_ref(),
        profile.as_ref(),
        OffsetDateTime::now_utc(),
    ))
}
