//! Subscription transition state machine and scheduled job
//!
//! The one place the active → expired → suspended → archived rules live.
//! `next_transition()` is the pure transition table; [`TransitionJob`] is the
//! cron-driven batch that applies it to every tenant, sends retention emails
//! at fixed day offsets, and archives long-suspended tenants.
//!
//! Tenants are processed independently: one tenant's failure is recorded in
//! the job summary and never aborts the rest of the batch.

use serde::Serialize;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::archive::ArchiveService;
use crate::audit::{ActorType, AuditEventType, AuditLogBuilder, AuditLogger};
use crate::email::{RetentionEmailService, RetentionOffset};
use crate::error::{BillingError, BillingResult};
use crate::record::{LifecycleCandidate, StateChange, SubscriptionRecord, SubscriptionStore};
use sheettools_shared::SubscriptionState;

/// Read-only window after expiry before suspension
pub const GRACE_PERIOD_DAYS: i64 = 7;

/// Window after suspension before archival (14 days post-expiry in total)
pub const ARCHIVE_DELAY_DAYS: i64 = 7;

/// One forward step in the subscription lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// active → expired, opening the grace window
    Expire { grace_period_ends_at: OffsetDateTime },
    /// expired → suspended, scheduling archival
    Suspend { archive_scheduled_at: OffsetDateTime },
    /// suspended → archived (terminal)
    Archive,
}

impl Transition {
    pub fn target(&self) -> SubscriptionState {
        match self {
            Self::Expire { .. } => SubscriptionState::Expired,
            Self::Suspend { .. } => SubscriptionState::Suspended,
            Self::Archive => SubscriptionState::Archived,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::Expire { .. } => "billing period ended without renewal",
            Self::Suspend { .. } => "grace period ended without renewal",
            Self::Archive => "retention window ended, tenant archived",
        }
    }

    /// Field updates this transition applies on top of `record`
    pub fn state_change(&self, record: &SubscriptionRecord, now: OffsetDateTime) -> StateChange {
        match *self {
            Self::Expire { grace_period_ends_at } => StateChange {
                to: SubscriptionState::Expired,
                readonly_mode: true,
                grace_period_ends_at: Some(grace_period_ends_at),
                archive_scheduled_at: None,
                archived_at: None,
                reason: self.reason().to_string(),
            },
            Self::Suspend { archive_scheduled_at } => StateChange {
                to: SubscriptionState::Suspended,
                readonly_mode: true,
                grace_period_ends_at: record.grace_period_ends_at,
                archive_scheduled_at: Some(archive_scheduled_at),
                archived_at: None,
                reason: self.reason().to_string(),
            },
            Self::Archive => StateChange {
                to: SubscriptionState::Archived,
                readonly_mode: true,
                grace_period_ends_at: record.grace_period_ends_at,
                archive_scheduled_at: record.archive_scheduled_at,
                archived_at: Some(now),
                reason: self.reason().to_string(),
            },
        }
    }
}

/// The transition table: which step, if any, is due for `record` at `now`.
///
/// Re-applying on an already-advanced record is a no-op (returns `None` or a
/// later step), which is what makes job reruns safe.
pub fn next_transition(record: &SubscriptionRecord, now: OffsetDateTime) -> Option<Transition> {
    match record.state {
        SubscriptionState::Active => match record.current_period_end {
            Some(period_end) if now > period_end => Some(Transition::Expire {
                grace_period_ends_at: now + Duration::days(GRACE_PERIOD_DAYS),
            }),
            _ => None,
        },
        SubscriptionState::Expired => {
            let grace_ends_at = record.grace_period_ends_at.or_else(|| {
                record
                    .current_period_end
                    .map(|end| end + Duration::days(GRACE_PERIOD_DAYS))
            });
            match grace_ends_at {
                Some(grace) if now > grace => Some(Transition::Suspend {
                    archive_scheduled_at: now + Duration::days(ARCHIVE_DELAY_DAYS),
                }),
                Some(_) => None,
                // No grace deadline at all is malformed data; converge
                // downward rather than leaving the tenant expired forever
                None => Some(Transition::Suspend {
                    archive_scheduled_at: now + Duration::days(ARCHIVE_DELAY_DAYS),
                }),
            }
        }
        SubscriptionState::Suspended => match record.archive_scheduled_at {
            Some(archive_at) if now > archive_at => Some(Transition::Archive),
            _ => None,
        },
        SubscriptionState::Archived => None,
    }
}

/// Whole days elapsed since the billing period ended, or `None` before expiry
pub fn days_since_expiry(
    current_period_end: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> Option<i64> {
    let period_end = current_period_end?;
    if now < period_end {
        return None;
    }
    Some((now - period_end).whole_days())
}

/// One failed tenant in a job run
#[derive(Debug, Clone, Serialize)]
pub struct TenantFailure {
    pub user_id: Uuid,
    pub error: String,
}

/// Result summary of one transition job run
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobSummary {
    pub processed: u64,
    pub transitions: u64,
    pub emails_sent: u64,
    pub emails_skipped: u64,
    pub errors: Vec<TenantFailure>,
}

/// Scheduled batch job advancing every tenant's subscription state
pub struct TransitionJob {
    store: SubscriptionStore,
    audit: AuditLogger,
    email: RetentionEmailService,
    archive: ArchiveService,
}

impl TransitionJob {
    pub fn new(
        store: SubscriptionStore,
        audit: AuditLogger,
        email: RetentionEmailService,
        archive: ArchiveService,
    ) -> Self {
        Self {
            store,
            audit,
            email,
            archive,
        }
    }

    /// Single sequential pass over all non-archived tenants.
    ///
    /// `now` is injected so tests and backfills control the clock.
    pub async fn run(&self, now: OffsetDateTime) -> JobSummary {
        let mut summary = JobSummary::default();

        let candidates = match self.store.list_lifecycle_candidates().await {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load lifecycle candidates");
                summary.errors.push(TenantFailure {
                    user_id: Uuid::nil(),
                    error: e.to_string(),
                });
                return summary;
            }
        };

        for candidate in candidates {
            summary.processed += 1;
            let user_id = candidate.record.user_id;
            if let Err(e) = self.process_tenant(&candidate, now, &mut summary).await {
                tracing::warn!(user_id = %user_id, error = %e, "Tenant processing failed");
                summary.errors.push(TenantFailure {
                    user_id,
                    error: e.to_string(),
                });
            }
        }

        tracing::info!(
            processed = summary.processed,
            transitions = summary.transitions,
            emails_sent = summary.emails_sent,
            emails_skipped = summary.emails_skipped,
            errors = summary.errors.len(),
            "Transition job finished"
        );
        summary
    }

    async fn process_tenant(
        &self,
        candidate: &LifecycleCandidate,
        now: OffsetDateTime,
        summary: &mut JobSummary,
    ) -> BillingResult<()> {
        let mut record = candidate.record.clone();

        if let Some(transition) = next_transition(&record, now) {
            record = self.apply_with_retry(record, transition, candidate, now).await?;
            summary.transitions += 1;
        }

        if record.state == SubscriptionState::Expired {
            self.maybe_send_retention_email(&record, candidate, now, summary)
                .await?;
        }

        Ok(())
    }

    /// Apply one transition under the CAS guard, re-reading and retrying once
    /// if a webhook raced us
    async fn apply_with_retry(
        &self,
        record: SubscriptionRecord,
        transition: Transition,
        candidate: &LifecycleCandidate,
        now: OffsetDateTime,
    ) -> BillingResult<SubscriptionRecord> {
        if let Some(updated) = self.apply_once(&record, transition, candidate, now).await? {
            return Ok(updated);
        }

        let fresh = self
            .store
            .get_record(record.user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(record.user_id.to_string()))?;

        match next_transition(&fresh, now) {
            // Other writer already converged (e.g. payment reset to active)
            None => Ok(fresh),
            Some(transition) => self
                .apply_once(&fresh, transition, candidate, now)
                .await?
                .ok_or_else(|| {
                    BillingError::ConcurrencyConflict(format!(
                        "Transition for tenant {} lost the race twice",
                        fresh.user_id
                    ))
                }),
        }
    }

    async fn apply_once(
        &self,
        record: &SubscriptionRecord,
        transition: Transition,
        candidate: &LifecycleCandidate,
        now: OffsetDateTime,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let change = transition.state_change(record, now);
        let won = self
            .store
            .apply_state_change(
                record.user_id,
                record.state,
                record.last_state_change_at,
                &change,
                now,
            )
            .await?;
        if !won {
            return Ok(None);
        }

        tracing::info!(
            user_id = %record.user_id,
            from = %record.state,
            to = %change.to,
            "Subscription state advanced"
        );

        self.audit
            .log_transition(record.user_id, record.state, change.to, &change.reason)
            .await?;

        if matches!(transition, Transition::Archive) {
            let usage = self.store.get_usage_counters(record.user_id).await?;
            self.archive
                .archive_tenant(
                    record.user_id,
                    candidate.email.as_deref(),
                    candidate.display_name.as_deref(),
                    record.plan,
                    usage,
                    now,
                )
                .await?;
            self.audit
                .log(
                    AuditLogBuilder::new(record.user_id, AuditEventType::TenantArchived)
                        .transition(record.state, SubscriptionState::Archived)
                        .actor_type(ActorType::System),
                )
                .await?;
        }

        let updated = self
            .store
            .get_record(record.user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(record.user_id.to_string()))?;
        Ok(Some(updated))
    }

    /// Send the retention email for the current day offset, at most once.
    ///
    /// The processed marker is claimed before the provider call, so a rerun
    /// on the same day can never double-send. A claim whose send then fails
    /// is reported in the summary rather than retried.
    async fn maybe_send_retention_email(
        &self,
        record: &SubscriptionRecord,
        candidate: &LifecycleCandidate,
        now: OffsetDateTime,
        summary: &mut JobSummary,
    ) -> BillingResult<()> {
        let Some(days) = days_since_expiry(record.current_period_end, now) else {
            return Ok(());
        };
        let Some(offset) = RetentionOffset::from_days_since_expiry(days) else {
            return Ok(());
        };
        // Checked above: days_since_expiry returned Some, so period_end exists
        let Some(period_end) = record.current_period_end else {
            return Ok(());
        };

        let claimed = self
            .claim_retention_marker(record.user_id, period_end, offset)
            .await?;
        if !claimed {
            summary.emails_skipped += 1;
            return Ok(());
        }

        let Some(email) = candidate.email.as_deref() else {
            tracing::warn!(user_id = %record.user_id, "No email on file, skipping retention email");
            summary.emails_skipped += 1;
            return Ok(());
        };

        let sent = self
            .email
            .send_retention_email(
                email,
                candidate.display_name.as_deref(),
                record.plan.display_name(),
                offset,
            )
            .await?;

        if sent {
            summary.emails_sent += 1;
            self.audit
                .log(
                    AuditLogBuilder::new(record.user_id, AuditEventType::RetentionEmailSent)
                        .data(serde_json::json!({
                            "offset_day": offset.days(),
                            "tag": offset.tag(),
                        }))
                        .actor_type(ActorType::System),
                )
                .await?;
        } else {
            summary.errors.push(TenantFailure {
                user_id: record.user_id,
                error: format!("retention email delivery failed (D+{})", offset.days()),
            });
        }

        Ok(())
    }

    /// Insert the `(user_id, expiry cycle, offset)` marker; `false` means
    /// this offset was already handled
    async fn claim_retention_marker(
        &self,
        user_id: Uuid,
        period_end: OffsetDateTime,
        offset: RetentionOffset,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO retention_email_log (user_id, expired_on, offset_day)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, expired_on, offset_day) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(period_end.date())
        .bind(offset.days() as i32)
        .execute(self.store.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use sheettools_shared::{BillingPeriod, SubscriptionPlan};
    use time::macros::datetime;

    fn record(state: SubscriptionState) -> SubscriptionRecord {
        let created = datetime!(2025-01-01 00:00 UTC);
        SubscriptionRecord {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            plan: SubscriptionPlan::Standard,
            billing_period: BillingPeriod::Monthly,
            state,
            status: None,
            current_period_start: Some(created),
            current_period_end: Some(datetime!(2025-02-01 00:00 UTC)),
            cancel_at_period_end: false,
            grace_period_ends_at: None,
            archive_scheduled_at: None,
            archived_at: None,
            readonly_mode: state.is_readonly(),
            campaign_limit: None,
            store_limit: None,
            stripe_customer_id: None,
            stripe_subscription_id: None,
            last_state_change_at: created,
            state_change_reason: None,
            created_at: created,
            updated_at: created,
        }
    }

    /// Mirror the store's CAS update on an in-memory record
    fn apply_in_memory(
        record: &mut SubscriptionRecord,
        transition: Transition,
        now: OffsetDateTime,
    ) {
        let change = transition.state_change(record, now);
        record.state = change.to;
        record.readonly_mode = change.readonly_mode;
        record.grace_period_ends_at = change.grace_period_ends_at;
        record.archive_scheduled_at = change.archive_scheduled_at;
        record.archived_at = change.archived_at;
        record.last_state_change_at = now;
    }

    #[test]
    fn test_active_before_period_end_is_stable() {
        let r = record(SubscriptionState::Active);
        assert_eq!(next_transition(&r, datetime!(2025-01-15 00:00 UTC)), None);
    }

    #[test]
    fn test_expire_opens_seven_day_grace() {
        let r = record(SubscriptionState::Active);
        let now = datetime!(2025-02-02 00:00 UTC);
        match next_transition(&r, now) {
            Some(Transition::Expire { grace_period_ends_at }) => {
                assert_eq!(grace_period_ends_at, now + Duration::days(7));
            }
            other => panic!("Expected Expire, got {:?}", other),
        }
    }

    #[test]
    fn test_suspend_waits_for_grace_to_pass() {
        let mut r = record(SubscriptionState::Expired);
        r.grace_period_ends_at = Some(datetime!(2025-02-08 00:00 UTC));
        assert_eq!(next_transition(&r, datetime!(2025-02-05 00:00 UTC)), None);

        let now = datetime!(2025-02-09 00:00 UTC);
        match next_transition(&r, now) {
            Some(Transition::Suspend { archive_scheduled_at }) => {
                assert_eq!(archive_scheduled_at, now + Duration::days(7));
            }
            other => panic!("Expected Suspend, got {:?}", other),
        }
    }

    #[test]
    fn test_expired_without_grace_falls_back_to_period_end() {
        // Grace not stamped yet: deadline derives from period_end + 7d
        let r = record(SubscriptionState::Expired);
        assert_eq!(next_transition(&r, datetime!(2025-02-05 00:00 UTC)), None);
        assert!(matches!(
            next_transition(&r, datetime!(2025-02-09 00:00 UTC)),
            Some(Transition::Suspend { .. })
        ));
    }

    #[test]
    fn test_archive_fires_after_schedule() {
        let mut r = record(SubscriptionState::Suspended);
        r.archive_scheduled_at = Some(datetime!(2025-02-15 00:00 UTC));
        assert_eq!(next_transition(&r, datetime!(2025-02-14 00:00 UTC)), None);
        assert_eq!(
            next_transition(&r, datetime!(2025-02-16 00:00 UTC)),
            Some(Transition::Archive)
        );
    }

    #[test]
    fn test_archived_is_terminal() {
        let r = record(SubscriptionState::Archived);
        assert_eq!(next_transition(&r, datetime!(2030-01-01 00:00 UTC)), None);
    }

    #[test]
    fn test_progression_is_monotonic() {
        // With no payment event, repeated runs at increasing times only ever
        // move the state forward through the lifecycle.
        let mut r = record(SubscriptionState::Active);
        let checkpoints = [
            datetime!(2025-01-20 00:00 UTC),
            datetime!(2025-02-02 00:00 UTC),
            datetime!(2025-02-05 00:00 UTC),
            datetime!(2025-02-10 00:00 UTC),
            datetime!(2025-02-14 00:00 UTC),
            datetime!(2025-02-18 00:00 UTC),
            datetime!(2025-03-01 00:00 UTC),
        ];

        let mut last_rank = r.state.rank();
        for now in checkpoints {
            if let Some(transition) = next_transition(&r, now) {
                apply_in_memory(&mut r, transition, now);
            }
            assert!(r.state.rank() >= last_rank, "state went backward at {}", now);
            last_rank = r.state.rank();
        }
        assert_eq!(r.state, SubscriptionState::Archived);
    }

    #[test]
    fn test_total_window_is_fourteen_days() {
        // Expiry on Feb 1, job runs daily: suspension after 7 days of grace,
        // archival 7 days later.
        let mut r = record(SubscriptionState::Active);

        let expire = next_transition(&r, datetime!(2025-02-01 00:00:01 UTC)).unwrap();
        apply_in_memory(&mut r, expire, datetime!(2025-02-01 00:00:01 UTC));
        assert_eq!(r.state, SubscriptionState::Expired);

        let suspend_time = datetime!(2025-02-08 00:01 UTC);
        let suspend = next_transition(&r, suspend_time).unwrap();
        apply_in_memory(&mut r, suspend, suspend_time);
        assert_eq!(r.state, SubscriptionState::Suspended);
        assert_eq!(
            r.archive_scheduled_at,
            Some(suspend_time + Duration::days(7))
        );
    }

    #[test]
    fn test_days_since_expiry() {
        let end = Some(datetime!(2025-02-01 00:00 UTC));
        assert_eq!(days_since_expiry(end, datetime!(2025-01-31 00:00 UTC)), None);
        assert_eq!(days_since_expiry(end, datetime!(2025-02-01 00:00 UTC)), Some(0));
        assert_eq!(days_since_expiry(end, datetime!(2025-02-01 23:59 UTC)), Some(0));
        assert_eq!(days_since_expiry(end, datetime!(2025-02-06 12:00 UTC)), Some(5));
        assert_eq!(days_since_expiry(end, datetime!(2025-02-11 00:00 UTC)), Some(10));
        assert_eq!(days_since_expiry(None, datetime!(2025-02-11 00:00 UTC)), None);
    }

    #[test]
    fn test_retention_offsets_hit_only_exact_days() {
        let end = Some(datetime!(2025-02-01 00:00 UTC));
        let mut hits = Vec::new();
        for day in 0..20 {
            let now = datetime!(2025-02-01 12:00 UTC) + Duration::days(day);
            if let Some(days) = days_since_expiry(end, now) {
                if RetentionOffset::from_days_since_expiry(days).is_some() {
                    hits.push(days);
                }
            }
        }
        assert_eq!(hits, vec![0, 5, 10]);
    }
}
