//! Subscription record store
//!
//! Persistence layer for the per-tenant `subscriptions` row, the `profiles`
//! row read as a secondary signal for trial users, and `usage_counters`.
//!
//! State mutations go through a compare-and-set on `(state, last_state_change_at)`
//! so the scheduled job and a billing webhook cannot race each other into
//! conflicting transitions.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gate::UsageCounters;
use sheettools_shared::{BillingPeriod, SubscriptionPlan, SubscriptionState};

/// Trial window granted at signup
pub const TRIAL_DAYS: i64 = 14;

/// Persisted billing/access state for one tenant
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan: SubscriptionPlan,
    pub billing_period: BillingPeriod,
    pub state: SubscriptionState,
    /// Raw billing-provider status string (e.g. Stripe `past_due`)
    pub status: Option<String>,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub grace_period_ends_at: Option<OffsetDateTime>,
    pub archive_scheduled_at: Option<OffsetDateTime>,
    pub archived_at: Option<OffsetDateTime>,
    pub readonly_mode: bool,
    /// Per-tenant override; falls back to the plan default when `None`
    pub campaign_limit: Option<i64>,
    pub store_limit: Option<i64>,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub last_state_change_at: OffsetDateTime,
    pub state_change_reason: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl SubscriptionRecord {
    /// Effective campaign limit: tenant override, else plan default
    pub fn effective_campaign_limit(&self) -> Option<i64> {
        self.campaign_limit.or_else(|| self.plan.campaign_limit())
    }

    /// Effective store limit: tenant override, else plan default
    pub fn effective_store_limit(&self) -> Option<i64> {
        self.store_limit.or_else(|| self.plan.store_limit())
    }
}

/// Tenant metadata read alongside the subscription.
///
/// Trial users who never reached checkout have a profile but no
/// subscription row, so the evaluator falls back to `trial_ends_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: Uuid,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub subscription_plan: SubscriptionPlan,
    pub subscription_status: Option<String>,
    pub trial_ends_at: Option<OffsetDateTime>,
    pub anonymized_at: Option<OffsetDateTime>,
}

/// Field updates applied together with a CAS-guarded state change
#[derive(Debug, Clone)]
pub struct StateChange {
    pub to: SubscriptionState,
    pub readonly_mode: bool,
    pub grace_period_ends_at: Option<OffsetDateTime>,
    pub archive_scheduled_at: Option<OffsetDateTime>,
    pub archived_at: Option<OffsetDateTime>,
    pub reason: String,
}

/// One tenant due for evaluation by the transition job
#[derive(Debug, Clone)]
pub struct LifecycleCandidate {
    pub record: SubscriptionRecord,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

/// Store for subscription records and tenant profiles
#[derive(Clone)]
pub struct SubscriptionStore {
    pool: PgPool,
}

impl SubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Load a tenant's subscription record, if one exists
    pub async fn get_record(&self, user_id: Uuid) -> BillingResult<Option<SubscriptionRecord>> {
        let record: Option<SubscriptionRecord> = sqlx::query_as(
            r#"
            SELECT
                id, user_id, plan_code, billing_period, state, status,
                current_period_start, current_period_end, cancel_at_period_end,
                grace_period_ends_at, archive_scheduled_at, archived_at,
                readonly_mode, campaign_limit, store_limit,
                stripe_customer_id, stripe_subscription_id,
                last_state_change_at, state_change_reason, created_at, updated_at
            FROM subscriptions
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Find the subscription mapped to a billing-provider subscription ID
    pub async fn find_by_provider_subscription(
        &self,
        stripe_subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record: Option<SubscriptionRecord> = sqlx::query_as(
            r#"
            SELECT
                id, user_id, plan_code, billing_period, state, status,
                current_period_start, current_period_end, cancel_at_period_end,
                grace_period_ends_at, archive_scheduled_at, archived_at,
                readonly_mode, campaign_limit, store_limit,
                stripe_customer_id, stripe_subscription_id,
                last_state_change_at, state_change_reason, created_at, updated_at
            FROM subscriptions
            WHERE stripe_subscription_id = $1
            "#,
        )
        .bind(stripe_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Load a tenant profile
    pub async fn get_profile(&self, user_id: Uuid) -> BillingResult<Option<Profile>> {
        let profile: Option<Profile> = sqlx::query_as(
            r#"
            SELECT
                user_id, email, display_name, subscription_plan,
                subscription_status, trial_ends_at, anonymized_at
            FROM profiles
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(profile)
    }

    /// Create a tenant profile with trial defaults (signup path)
    pub async fn create_trial_profile(
        &self,
        user_id: Uuid,
        email: &str,
        display_name: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<Profile> {
        let trial_ends_at = now + Duration::days(TRIAL_DAYS);

        sqlx::query(
            r#"
            INSERT INTO profiles (
                user_id, email, display_name, subscription_plan,
                subscription_status, trial_ends_at, created_at, updated_at
            ) VALUES ($1, $2, $3, 'trial', 'trialing', $4, $5, $5)
            "#,
        )
        .bind(user_id)
        .bind(email)
        .bind(display_name)
        .bind(trial_ends_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Profile {
            user_id,
            email: Some(email.to_string()),
            display_name: display_name.map(str::to_string),
            subscription_plan: SubscriptionPlan::Trial,
            subscription_status: Some("trialing".to_string()),
            trial_ends_at: Some(trial_ends_at),
            anonymized_at: None,
        })
    }

    /// Create or replace the subscription row when a tenant first becomes paid
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_record(
        &self,
        user_id: Uuid,
        plan: SubscriptionPlan,
        billing_period: BillingPeriod,
        status: &str,
        period_start: Option<OffsetDateTime>,
        period_end: Option<OffsetDateTime>,
        stripe_customer_id: Option<&str>,
        stripe_subscription_id: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<SubscriptionRecord> {
        let record: SubscriptionRecord = sqlx::query_as(
            r#"
            INSERT INTO subscriptions (
                user_id, plan_code, billing_period, state, status,
                current_period_start, current_period_end,
                stripe_customer_id, stripe_subscription_id,
                last_state_change_at, state_change_reason, created_at, updated_at
            ) VALUES ($1, $2, $3, 'active', $4, $5, $6, $7, $8, $9, 'subscription created', $9, $9)
            ON CONFLICT (user_id) DO UPDATE SET
                plan_code = EXCLUDED.plan_code,
                billing_period = EXCLUDED.billing_period,
                state = 'active',
                status = EXCLUDED.status,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                grace_period_ends_at = NULL,
                archive_scheduled_at = NULL,
                readonly_mode = FALSE,
                stripe_customer_id = COALESCE(EXCLUDED.stripe_customer_id, subscriptions.stripe_customer_id),
                stripe_subscription_id = COALESCE(EXCLUDED.stripe_subscription_id, subscriptions.stripe_subscription_id),
                last_state_change_at = EXCLUDED.last_state_change_at,
                state_change_reason = 'subscription renewed',
                updated_at = EXCLUDED.updated_at
            RETURNING
                id, user_id, plan_code, billing_period, state, status,
                current_period_start, current_period_end, cancel_at_period_end,
                grace_period_ends_at, archive_scheduled_at, archived_at,
                readonly_mode, campaign_limit, store_limit,
                stripe_customer_id, stripe_subscription_id,
                last_state_change_at, state_change_reason, created_at, updated_at
            "#,
        )
        .bind(user_id)
        .bind(plan)
        .bind(billing_period)
        .bind(status)
        .bind(period_start)
        .bind(period_end)
        .bind(stripe_customer_id)
        .bind(stripe_subscription_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    /// Apply a state change guarded by a compare-and-set on
    /// `(state, last_state_change_at)`.
    ///
    /// Returns `Ok(false)` when another writer won the race; the caller
    /// re-reads and retries once before surfacing `ConcurrencyConflict`.
    pub async fn apply_state_change(
        &self,
        user_id: Uuid,
        expected_state: SubscriptionState,
        expected_changed_at: OffsetDateTime,
        change: &StateChange,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        if expected_state.is_terminal() && change.to != expected_state {
            return Err(BillingError::TenantArchived(user_id.to_string()));
        }

        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET state = $1,
                readonly_mode = $2,
                grace_period_ends_at = $3,
                archive_scheduled_at = $4,
                archived_at = $5,
                last_state_change_at = $6,
                state_change_reason = $7,
                updated_at = $6
            WHERE user_id = $8
              AND state = $9
              AND last_state_change_at = $10
            "#,
        )
        .bind(change.to)
        .bind(change.readonly_mode)
        .bind(change.grace_period_ends_at)
        .bind(change.archive_scheduled_at)
        .bind(change.archived_at)
        .bind(now)
        .bind(&change.reason)
        .bind(user_id)
        .bind(expected_state)
        .bind(expected_changed_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Move an archived subscription back to `suspended`.
    ///
    /// The CAS path refuses to leave the terminal state, so the explicit
    /// restore flow is the only writer allowed to do this. The tenant gets a
    /// fresh archive window and stays readonly until a payment lands.
    pub async fn reinstate_archived(
        &self,
        user_id: Uuid,
        archive_scheduled_at: OffsetDateTime,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET state = 'suspended',
                readonly_mode = TRUE,
                archived_at = NULL,
                archive_scheduled_at = $1,
                last_state_change_at = $2,
                state_change_reason = 'tenant restored from archive',
                updated_at = $2
            WHERE user_id = $3
              AND state = 'archived'
            "#,
        )
        .bind(archive_scheduled_at)
        .bind(now)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Update period boundaries and raw provider status without a state change
    pub async fn update_period(
        &self,
        user_id: Uuid,
        status: Option<&str>,
        period_end: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE subscriptions
            SET status = COALESCE($1, status),
                current_period_end = COALESCE($2, current_period_end),
                updated_at = $3
            WHERE user_id = $4
            "#,
        )
        .bind(status)
        .bind(period_end)
        .bind(now)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// All non-archived tenants, joined with the profile contact fields the
    /// transition job needs for retention emails
    pub async fn list_lifecycle_candidates(&self) -> BillingResult<Vec<LifecycleCandidate>> {
        let rows: Vec<LifecycleCandidate> = sqlx::query_as(
            r#"
            SELECT
                s.id, s.user_id, s.plan_code, s.billing_period, s.state, s.status,
                s.current_period_start, s.current_period_end, s.cancel_at_period_end,
                s.grace_period_ends_at, s.archive_scheduled_at, s.archived_at,
                s.readonly_mode, s.campaign_limit, s.store_limit,
                s.stripe_customer_id, s.stripe_subscription_id,
                s.last_state_change_at, s.state_change_reason, s.created_at, s.updated_at,
                p.email, p.display_name
            FROM subscriptions s
            LEFT JOIN profiles p ON p.user_id = s.user_id
            WHERE s.state != 'archived'
            ORDER BY s.user_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Current usage counters for a tenant, if tracked
    pub async fn get_usage_counters(&self, user_id: Uuid) -> BillingResult<Option<UsageCounters>> {
        let counters: Option<(i64, Option<i64>, i64, Option<i64>, Option<OffsetDateTime>)> =
            sqlx::query_as(
                r#"
                SELECT campaigns_used, campaigns_limit, stores_used, stores_limit, reset_at
                FROM usage_counters
                WHERE user_id = $1
                "#,
            )
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(counters.map(
            |(campaigns_used, campaigns_limit, stores_used, stores_limit, reset_at)| {
                UsageCounters {
                    campaigns_used,
                    campaigns_limit,
                    stores_used,
                    stores_limit,
                    reset_at,
                }
            },
        ))
    }
}

// Implement FromRow for SubscriptionRecord
impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for SubscriptionRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        let plan_code: String = row.try_get("plan_code")?;
        let plan = plan_code
            .parse()
            .map_err(|e: String| sqlx::Error::Decode(e.into()))?;
        let billing_period: String = row.try_get("billing_period")?;
        let billing_period = billing_period
            .parse()
            .map_err(|e: String| sqlx::Error::Decode(e.into()))?;
        let state: String = row.try_get("state")?;
        let state = state
            .parse()
            .map_err(|e: String| sqlx::Error::Decode(e.into()))?;

        Ok(Self {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            plan,
            billing_period,
            state,
            status: row.try_get("status")?,
            current_period_start: row.try_get("current_period_start")?,
            current_period_end: row.try_get("current_period_end")?,
            cancel_at_period_end: row.try_get("cancel_at_period_end")?,
            grace_period_ends_at: row.try_get("grace_period_ends_at")?,
            archive_scheduled_at: row.try_get("archive_scheduled_at")?,
            archived_at: row.try_get("archived_at")?,
            readonly_mode: row.try_get("readonly_mode")?,
            campaign_limit: row.try_get("campaign_limit")?,
            store_limit: row.try_get("store_limit")?,
            stripe_customer_id: row.try_get("stripe_customer_id")?,
            stripe_subscription_id: row.try_get("stripe_subscription_id")?,
            last_state_change_at: row.try_get("last_state_change_at")?,
            state_change_reason: row.try_get("state_change_reason")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

// Implement FromRow for LifecycleCandidate
impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for LifecycleCandidate {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        Ok(Self {
            record: SubscriptionRecord::from_row(row)?,
            email: row.try_get("email")?,
            display_name: row.try_get("display_name")?,
        })
    }
}

// Implement FromRow for Profile
impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for Profile {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        let plan: String = row.try_get("subscription_plan")?;
        let subscription_plan = plan
            .parse()
            .map_err(|e: String| sqlx::Error::Decode(e.into()))?;

        Ok(Self {
            user_id: row.try_get("user_id")?,
            email: row.try_get("email")?,
            display_name: row.try_get("display_name")?,
            subscription_plan,
            subscription_status: row.try_get("subscription_status")?,
            trial_ends_at: row.try_get("trial_ends_at")?,
            anonymized_at: row.try_get("anonymized_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_record() -> SubscriptionRecord {
        let now = OffsetDateTime::now_utc();
        SubscriptionRecord {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            plan: SubscriptionPlan::Beginner,
            billing_period: BillingPeriod::Monthly,
            state: SubscriptionState::Active,
            status: Some("active".to_string()),
            current_period_start: Some(now),
            current_period_end: Some(now + Duration::days(30)),
            cancel_at_period_end: false,
            grace_period_ends_at: None,
            archive_scheduled_at: None,
            archived_at: None,
            readonly_mode: false,
            campaign_limit: None,
            store_limit: None,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            last_state_change_at: now,
            state_change_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_effective_limits_fall_back_to_plan() {
        let record = base_record();
        assert_eq!(record.effective_campaign_limit(), Some(10));
        assert_eq!(record.effective_store_limit(), Some(1));
    }

    #[test]
    fn test_tenant_override_wins_over_plan() {
        let mut record = base_record();
        record.campaign_limit = Some(25);
        assert_eq!(record.effective_campaign_limit(), Some(25));
    }

    #[test]
    fn test_pro_override_none_means_unlimited() {
        let mut record = base_record();
        record.plan = SubscriptionPlan::Pro;
        assert_eq!(record.effective_campaign_limit(), None);
    }
}
