//! Subscription lifecycle service
//!
//! Event-driven entry points into the state machine: billing-provider
//! webhooks, admin overrides, trial signup, and archive restore. The
//! time-driven side lives in [`crate::transition`]; both funnel every state
//! write through the store's CAS guard and leave an audit row behind.

use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::archive::ArchiveService;
use crate::audit::{ActorType, AuditEventType, AuditLogBuilder, AuditLogger};
use crate::error::{BillingError, BillingResult};
use crate::record::{Profile, StateChange, SubscriptionRecord, SubscriptionStore};
use crate::transition::{ARCHIVE_DELAY_DAYS, GRACE_PERIOD_DAYS};
use sheettools_shared::{BillingPeriod, SubscriptionPlan, SubscriptionState};

/// Normalized payment/renewal event from the billing provider
#[derive(Debug, Clone)]
pub struct BillingEventUpdate {
    pub user_id: Uuid,
    pub plan: SubscriptionPlan,
    pub billing_period: BillingPeriod,
    /// Raw provider status string, stored verbatim
    pub status: String,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub provider_customer_id: Option<String>,
    pub provider_subscription_id: Option<String>,
}

/// Service coordinating event-driven subscription state changes
#[derive(Clone)]
pub struct SubscriptionLifecycle {
    store: SubscriptionStore,
    audit: AuditLogger,
    archive: ArchiveService,
}

impl SubscriptionLifecycle {
    pub fn new(store: SubscriptionStore, audit: AuditLogger, archive: ArchiveService) -> Self {
        Self {
            store,
            audit,
            archive,
        }
    }

    pub fn store(&self) -> &SubscriptionStore {
        &self.store
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    /// Signup path: create the profile with trial defaults
    pub async fn create_trial(
        &self,
        user_id: Uuid,
        email: &str,
        display_name: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<Profile> {
        let profile = self
            .store
            .create_trial_profile(user_id, email, display_name, now)
            .await?;

        self.audit
            .log(
                AuditLogBuilder::new(user_id, AuditEventType::TrialStarted)
                    .data(serde_json::json!({ "trial_ends_at": profile.trial_ends_at }))
                    .actor(user_id, ActorType::User),
            )
            .await?;

        tracing::info!(user_id = %user_id, "Trial profile created");
        Ok(profile)
    }

    /// Successful payment or renewal: the one path that resets a tenant to
    /// `active`, clearing grace and archive schedules.
    ///
    /// Cannot revive an archived tenant; those go through [`Self::restore_tenant`]
    /// first.
    pub async fn apply_payment_succeeded(
        &self,
        update: &BillingEventUpdate,
        now: OffsetDateTime,
    ) -> BillingResult<SubscriptionRecord> {
        let previous = self.store.get_record(update.user_id).await?;

        if let Some(prev) = &previous {
            if prev.state == SubscriptionState::Archived {
                return Err(BillingError::TenantArchived(update.user_id.to_string()));
            }
        }

        let record = self
            .store
            .upsert_record(
                update.user_id,
                update.plan,
                update.billing_period,
                &update.status,
                update.current_period_start,
                update.current_period_end,
                update.provider_customer_id.as_deref(),
                update.provider_subscription_id.as_deref(),
                now,
            )
            .await?;

        let (event_type, old_state) = match &previous {
            None => (AuditEventType::SubscriptionCreated, None),
            Some(prev) => (AuditEventType::PaymentSucceeded, Some(prev.state)),
        };
        let mut builder = AuditLogBuilder::new(update.user_id, event_type)
            .data(serde_json::json!({
                "plan": update.plan.to_string(),
                "status": update.status,
                "period_end": update.current_period_end,
            }))
            .actor_type(ActorType::Webhook);
        if let Some(old) = old_state {
            builder = builder.transition(old, SubscriptionState::Active);
        }
        self.audit.log(builder).await?;

        tracing::info!(
            user_id = %update.user_id,
            plan = %update.plan,
            "Payment applied, subscription active"
        );
        Ok(record)
    }

    /// Period/status refresh that does not change the lifecycle state
    pub async fn apply_period_update(
        &self,
        user_id: Uuid,
        status: Option<&str>,
        period_end: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        self.store
            .update_period(user_id, status, period_end, now)
            .await
    }

    /// Admin override: force a tenant into a specific state.
    ///
    /// Entering `archived` this way is refused (the scheduled job owns
    /// archival, with its snapshot side effects), as is leaving it (use
    /// [`Self::restore_tenant`]).
    pub async fn set_subscription_state(
        &self,
        user_id: Uuid,
        new_state: SubscriptionState,
        reason: &str,
        actor_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<SubscriptionRecord> {
        let record = self
            .store
            .get_record(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(user_id.to_string()))?;

        // Archival has snapshot side effects and belongs to the scheduled job
        if new_state == SubscriptionState::Archived {
            return Err(BillingError::InvalidTransition {
                from: record.state.to_string(),
                to: new_state.to_string(),
            });
        }

        if record.state == new_state {
            return Ok(record);
        }

        let change = Self::override_change(&record, new_state, reason, now);

        let won = self
            .store
            .apply_state_change(user_id, record.state, record.last_state_change_at, &change, now)
            .await?;

        let record = if won {
            record
        } else {
            // Raced with the job or a webhook; re-read and try once more
            let fresh = self
                .store
                .get_record(user_id)
                .await?
                .ok_or_else(|| BillingError::NotFound(user_id.to_string()))?;
            if fresh.state == new_state {
                // Another writer already landed the same state; nothing to log
                return Ok(fresh);
            } else {
                let change = Self::override_change(&fresh, new_state, reason, now);
                let won = self
                    .store
                    .apply_state_change(
                        user_id,
                        fresh.state,
                        fresh.last_state_change_at,
                        &change,
                        now,
                    )
                    .await?;
                if !won {
                    return Err(BillingError::ConcurrencyConflict(format!(
                        "State override for tenant {} lost the race twice",
                        user_id
                    )));
                }
                fresh
            }
        };

        self.audit
            .log(
                AuditLogBuilder::new(user_id, AuditEventType::AdminStateOverride)
                    .transition(record.state, new_state)
                    .data(serde_json::json!({ "reason": reason }))
                    .actor(actor_id, ActorType::Admin),
            )
            .await?;

        tracing::info!(
            user_id = %user_id,
            from = %record.state,
            to = %new_state,
            actor = %actor_id,
            "Admin state override applied"
        );

        self.store
            .get_record(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(user_id.to_string()))
    }

    /// Restore an archived tenant: decrypt the snapshot, reinstate the
    /// profile, and return the subscription to `suspended` pending payment.
    pub async fn restore_tenant(
        &self,
        user_id: Uuid,
        actor_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<SubscriptionRecord> {
        let snapshot = self.archive.restore_tenant(user_id, now).await?;

        let archive_scheduled_at = now + Duration::days(ARCHIVE_DELAY_DAYS);
        let reinstated = self
            .store
            .reinstate_archived(user_id, archive_scheduled_at, now)
            .await?;
        if !reinstated {
            return Err(BillingError::NotFound(format!(
                "No archived subscription for tenant {}",
                user_id
            )));
        }

        self.audit
            .log(
                AuditLogBuilder::new(user_id, AuditEventType::TenantRestored)
                    .transition(SubscriptionState::Archived, SubscriptionState::Suspended)
                    .data(serde_json::json!({ "plan": snapshot.plan.to_string() }))
                    .actor(actor_id, ActorType::Admin),
            )
            .await?;

        self.store
            .get_record(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(user_id.to_string()))
    }

    fn override_change(
        record: &SubscriptionRecord,
        new_state: SubscriptionState,
        reason: &str,
        now: OffsetDateTime,
    ) -> StateChange {
        let reason = format!("admin override: {}", reason);
        match new_state {
            SubscriptionState::Active => StateChange {
                to: SubscriptionState::Active,
                readonly_mode: false,
                grace_period_ends_at: None,
                archive_scheduled_at: None,
                archived_at: None,
                reason,
            },
            SubscriptionState::Expired => StateChange {
                to: SubscriptionState::Expired,
                readonly_mode: true,
                grace_period_ends_at: Some(now + Duration::days(GRACE_PERIOD_DAYS)),
                archive_scheduled_at: None,
                archived_at: None,
                reason,
            },
            SubscriptionState::Suspended => StateChange {
                to: SubscriptionState::Suspended,
                readonly_mode: true,
                grace_period_ends_at: record.grace_period_ends_at,
                archive_scheduled_at: Some(now + Duration::days(ARCHIVE_DELAY_DAYS)),
                archived_at: None,
                reason,
            },
            // Rejected before we get here
            SubscriptionState::Archived => StateChange {
                to: SubscriptionState::Archived,
                readonly_mode: true,
                grace_period_ends_at: record.grace_period_ends_at,
                archive_scheduled_at: record.archive_scheduled_at,
                archived_at: Some(now),
                reason,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_to_active_clears_lifecycle_timestamps() {
        let now = OffsetDateTime::now_utc();
        let record = sample_record(SubscriptionState::Suspended, now);
        let change =
            SubscriptionLifecycle::override_change(&record, SubscriptionState::Active, "comp", now);
        assert_eq!(change.to, SubscriptionState::Active);
        assert!(!change.readonly_mode);
        assert_eq!(change.grace_period_ends_at, None);
        assert_eq!(change.archive_scheduled_at, None);
    }

    #[test]
    fn test_override_to_expired_opens_grace() {
        let now = OffsetDateTime::now_utc();
        let record = sample_record(SubscriptionState::Active, now);
        let change =
            SubscriptionLifecycle::override_change(&record, SubscriptionState::Expired, "test", now);
        assert!(change.readonly_mode);
        assert_eq!(
            change.grace_period_ends_at,
            Some(now + Duration::days(GRACE_PERIOD_DAYS))
        );
    }

    fn sample_record(state: SubscriptionState, now: OffsetDateTime) -> SubscriptionRecord {
        SubscriptionRecord {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            plan: SubscriptionPlan::Standard,
            billing_period: BillingPeriod::Monthly,
            state,
            status: None,
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            grace_period_ends_at: Some(now),
            archive_scheduled_at: Some(now),
            archived_at: None,
            readonly_mode: state.is_readonly(),
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
}
