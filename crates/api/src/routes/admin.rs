//! Admin endpoints: state overrides and archive restore

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use sheettools_shared::SubscriptionState;

#[derive(Debug, Deserialize)]
pub struct SetStateRequest {
    pub new_state: String,
    pub reason: String,
    pub actor_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct SetStateResponse {
    pub user_id: Uuid,
    pub state: SubscriptionState,
    pub readonly_mode: bool,
}

/// POST /api/v1/admin/users/:user_id/state
pub async fn set_state(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(request): Json<SetStateRequest>,
) -> ApiResult<Json<SetStateResponse>> {
    if request.reason.trim().is_empty() {
        return Err(ApiError::Validation(
            "A reason is required for admin state changes".to_string(),
        ));
    }

    let new_state: SubscriptionState = request
        .new_state
        .parse()
        .map_err(|e: String| ApiError::BadRequest(e))?;

    let record = state
        .lifecycle
        .set_subscription_state(
            user_id,
            new_state,
            &request.reason,
            request.actor_id,
            OffsetDateTime::now_utc(),
        )
        .await?;

    Ok(Json(SetStateResponse {
        user_id,
        state: record.state,
        readonly_mode: record.readonly_mode,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    pub actor_id: Uuid,
}

/// POST /api/v1/admin/users/:user_id/restore
pub async fn restore_tenant(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Json(request): Json<RestoreRequest>,
) -> ApiResult<Json<SetStateResponse>> {
    let record = state
        .lifecycle
        .restore_tenant(user_id, request.actor_id, OffsetDateTime::now_utc())
        .await?;

    Ok(Json(SetStateResponse {
        user_id,
        state: record.state,
        readonly_mode: record.readonly_mode,
    }))
}
