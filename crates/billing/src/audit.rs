//! Audit log sink
//!
//! Append-only record of every subscription state transition and privileged
//! action. Rows are written once and only ever read back for display and
//! export; nothing in this crate updates or deletes them.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use sheettools_shared::SubscriptionState;

/// Types of audit events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    // Subscription lifecycle
    SubscriptionCreated,
    StateChanged,
    PaymentSucceeded,

    // Trial
    TrialStarted,
    TrialEnded,

    // Retention
    RetentionEmailSent,

    // Archival
    TenantArchived,
    TenantRestored,

    // Admin actions
    AdminStateOverride,
    AdminAdded,
    AdminRemoved,
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuditEventType::SubscriptionCreated => "SUBSCRIPTION_CREATED",
            AuditEventType::StateChanged => "STATE_CHANGED",
            AuditEventType::PaymentSucceeded => "PAYMENT_SUCCEEDED",
            AuditEventType::TrialStarted => "TRIAL_STARTED",
            AuditEventType::TrialEnded => "TRIAL_ENDED",
            AuditEventType::RetentionEmailSent => "RETENTION_EMAIL_SENT",
            AuditEventType::TenantArchived => "TENANT_ARCHIVED",
            AuditEventType::TenantRestored => "TENANT_RESTORED",
            AuditEventType::AdminStateOverride => "ADMIN_STATE_OVERRIDE",
            AuditEventType::AdminAdded => "ADMIN_ADDED",
            AuditEventType::AdminRemoved => "ADMIN_REMOVED",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    /// End user through UI
    User,
    /// Admin user
    Admin,
    /// Scheduled job or other automation
    System,
    /// Billing-provider webhook
    Webhook,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::Admin => write!(f, "admin"),
            ActorType::System => write!(f, "system"),
            ActorType::Webhook => write!(f, "webhook"),
        }
    }
}

/// One immutable audit row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub event_type: String,
    pub old_state: Option<String>,
    pub new_state: Option<String>,
    pub event_data: serde_json::Value,
    pub actor_id: Option<Uuid>,
    pub actor_type: String,
    pub created_at: OffsetDateTime,
}

/// Builder for audit entries
pub struct AuditLogBuilder {
    user_id: Uuid,
    event_type: AuditEventType,
    old_state: Option<SubscriptionState>,
    new_state: Option<SubscriptionState>,
    event_data: serde_json::Value,
    actor_id: Option<Uuid>,
    actor_type: ActorType,
}

impl AuditLogBuilder {
    pub fn new(user_id: Uuid, event_type: AuditEventType) -> Self {
        Self {
            user_id,
            event_type,
            old_state: None,
            new_state: None,
            event_data: serde_json::json!({}),
            actor_id: None,
            actor_type: ActorType::System,
        }
    }

    /// Record the state transition this entry documents
    pub fn transition(mut self, old: SubscriptionState, new: SubscriptionState) -> Self {
        self.old_state = Some(old);
        self.new_state = Some(new);
        self
    }

    /// Attach free-form metadata (kept open for forward compatibility)
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event_data = data;
        self
    }

    /// Set the actor who triggered the event
    pub fn actor(mut self, actor_id: Uuid, actor_type: ActorType) -> Self {
        self.actor_id = Some(actor_id);
        self.actor_type = actor_type;
        self
    }

    /// Set the actor type without a specific user
    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }
}

/// Service for writing and querying audit entries
#[derive(Clone)]
pub struct AuditLogger {
    pool: PgPool,
}

impl AuditLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append one audit entry, returning its ID
    pub async fn log(&self, builder: AuditLogBuilder) -> BillingResult<Uuid> {
        let id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO audit_logs (
                user_id, event_type, old_state, new_state,
                event_data, actor_id, actor_type
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(builder.user_id)
        .bind(builder.event_type.to_string())
        .bind(builder.old_state.map(|s| s.to_string()))
        .bind(builder.new_state.map(|s| s.to_string()))
        .bind(&builder.event_data)
        .bind(builder.actor_id)
        .bind(builder.actor_type.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(id.0)
    }

    /// Shorthand for a system-driven state transition entry
    pub async fn log_transition(
        &self,
        user_id: Uuid,
        old: SubscriptionState,
        new: SubscriptionState,
        reason: &str,
    ) -> BillingResult<Uuid> {
        self.log(
            AuditLogBuilder::new(user_id, AuditEventType::StateChanged)
                .transition(old, new)
                .data(serde_json::json!({ "reason": reason })),
        )
        .await
    }

    /// Recent entries for a tenant, newest first
    pub async fn get_entries_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<AuditLogEntry>> {
        let entries: Vec<AuditLogEntry> = sqlx::query_as(
            r#"
            SELECT id, user_id, event_type, old_state, new_state,
                   event_data, actor_id, actor_type, created_at
            FROM audit_logs
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }

    /// Entries of one type for a tenant, newest first
    pub async fn get_entries_by_type(
        &self,
        user_id: Uuid,
        event_type: AuditEventType,
        limit: i64,
    ) -> BillingResult<Vec<AuditLogEntry>> {
        let entries: Vec<AuditLogEntry> = sqlx::query_as(
            r#"
            SELECT id, user_id, event_type, old_state, new_state,
                   event_data, actor_id, actor_type, created_at
            FROM audit_logs
            WHERE user_id = $1 AND event_type = $2
            ORDER BY created_at DESC
            LIMIT $3
            "#,
        )
        .bind(user_id)
        .bind(event_type.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }
}

// Implement FromRow for AuditLogEntry
impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for AuditLogEntry {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            event_type: row.try_get("event_type")?,
            old_state: row.try_get("old_state")?,
            new_state: row.try_get("new_state")?,
            event_data: row.try_get("event_data")?,
            actor_id: row.try_get("actor_id")?,
            actor_type: row.try_get("actor_type")?,
            created_at: row.try_get("created_at")?,
        })
    }
}
