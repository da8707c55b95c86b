//! Billing provider webhook
//!
//! Payloads are authenticated with an HMAC-SHA256 signature over the raw
//! body before any JSON parsing happens. State only ever moves back to
//! `active` through this path; everything downward is the scheduled job's.

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    Json,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use sheettools_billing::BillingEventUpdate;
use sheettools_shared::{BillingPeriod, SubscriptionPlan};

const SIGNATURE_HEADER: &str = "x-webhook-signature";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    event_type: String,
    user_id: Uuid,
    #[serde(default)]
    plan: Option<String>,
    #[serde(default)]
    billing_period: Option<String>,
    #[serde(default)]
    status: Option<String>,
    /// Unix seconds
    #[serde(default)]
    current_period_start: Option<i64>,
    #[serde(default)]
    current_period_end: Option<i64>,
    #[serde(default)]
    provider_customer_id: Option<String>,
    #[serde(default)]
    provider_subscription_id: Option<String>,
}

/// POST /webhooks/billing
pub async fn billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::InvalidSignature)?;

    verify_signature(&state.config.webhook_secret, &body, signature)?;

    let payload: WebhookPayload = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid webhook payload: {}", e)))?;

    let now = OffsetDateTime::now_utc();

    match payload.event_type.as_str() {
        "payment_succeeded" | "subscription_renewed" => {
            let update = billing_update(&payload)?;
            state.lifecycle.apply_payment_succeeded(&update, now).await?;
            Ok(Json(json!({ "received": true, "handled": true })))
        }
        "subscription_updated" => {
            let period_end = parse_timestamp(payload.current_period_end)?;
            state
                .lifecycle
                .apply_period_update(payload.user_id, payload.status.as_deref(), period_end, now)
                .await?;
            Ok(Json(json!({ "received": true, "handled": true })))
        }
        other => {
            tracing::info!(event_type = other, user_id = %payload.user_id, "Ignoring webhook event");
            Ok(Json(json!({ "received": true, "handled": false })))
        }
    }
}

fn billing_update(payload: &WebhookPayload) -> ApiResult<BillingEventUpdate> {
    let plan: SubscriptionPlan = payload
        .plan
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("Missing plan".to_string()))?
        .parse()
        .map_err(|e: String| ApiError::BadRequest(e))?;

    let billing_period: BillingPeriod = payload
        .billing_period
        .as_deref()
        .unwrap_or("monthly")
        .parse()
        .map_err(|e: String| ApiError::BadRequest(e))?;

    Ok(BillingEventUpdate {
        user_id: payload.user_id,
        plan,
        billing_period,
        status: payload.status.clone().unwrap_or_else(|| "active".to_string()),
        current_period_start: parse_timestamp(payload.current_period_start)?,
        current_period_end: parse_timestamp(payload.current_period_end)?,
        provider_customer_id: payload.provider_customer_id.clone(),
        provider_subscription_id: payload.provider_subscription_id.clone(),
    })
}

fn parse_timestamp(unix: Option<i64>) -> ApiResult<Option<OffsetDateTime>> {
    unix.map(|ts| {
        OffsetDateTime::from_unix_timestamp(ts)
            .map_err(|_| ApiError::BadRequest(format!("Invalid timestamp: {}", ts)))
    })
    .transpose()
}

/// Constant-time HMAC-SHA256 check of the raw body against the hex signature
fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> ApiResult<()> {
    let expected = hex::decode(signature_hex).map_err(|_| ApiError::InvalidSignature)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| ApiError::Internal)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| ApiError::InvalidSignature)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn sign(body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn test_valid_signature_accepted() {
        let body = br#"{"event_type":"payment_succeeded"}"#;
        let sig = sign(body);
        assert!(verify_signature(SECRET, body, &sig).is_ok());
    }

    #[test]
    fn test_tampered_body_rejected() {
        let sig = sign(br#"{"event_type":"payment_succeeded"}"#);
        assert!(verify_signature(SECRET, br#"{"event_type":"evil"}"#, &sig).is_err());
    }

    #[test]
    fn test_non_hex_signature_rejected() {
        assert!(verify_signature(SECRET, b"body", "not-hex!").is_err());
    }
}
