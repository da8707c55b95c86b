//! Access state evaluator
//!
//! Provides the single answer to "what can this tenant do right now?".
//! `evaluate()` is a pure function of the stored record, the profile, and an
//! injected `now`, so the API, the worker, and tests all derive access the
//! same way without touching the wall clock.
//!
//! ## Design Principles
//!
//! 1. **Single Source of Truth**: `evaluate()` is THE function that determines access
//! 2. **Deterministic**: Same inputs always produce same outputs
//! 3. **Fail-closed**: missing or malformed data degrades to read-only, never to full access

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::record::{Profile, SubscriptionRecord};
use crate::transition::{ARCHIVE_DELAY_DAYS, GRACE_PERIOD_DAYS};
use sheettools_shared::{PlanFeatures, SubscriptionPlan, SubscriptionState};

/// Effective access level, derived from stored state plus time.
///
/// Distinct from the raw `state` column: a record can still say `active`
/// while its period end has already passed and the cron has not caught up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessState {
    /// Trial window still open, full Standard-tier access
    TrialActive,
    /// Trial over, read-only with upgrade banner
    TrialExpiredReadonly,
    /// Paid and in good standing
    Active,
    /// Past period end, inside the grace window
    ExpiredReadonly,
    /// Grace window over, awaiting archival
    SuspendedReadonly,
    /// Terminal; all access blocked pending restore
    ArchivedBlocked,
}

impl AccessState {
    pub fn is_readonly(&self) -> bool {
        !matches!(self, Self::TrialActive | Self::Active)
    }
}

impl std::fmt::Display for AccessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TrialActive => "trial-active",
            Self::TrialExpiredReadonly => "trial-expired-readonly",
            Self::Active => "active",
            Self::ExpiredReadonly => "expired-readonly",
            Self::SuspendedReadonly => "suspended-readonly",
            Self::ArchivedBlocked => "archived-blocked",
        };
        write!(f, "{}", s)
    }
}

/// Complete access decision for one tenant at one instant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveState {
    pub state: AccessState,
    pub readonly: bool,
    pub show_banner: bool,
    /// Days left in the grace window (only while expired)
    pub days_until_suspension: Option<i64>,
    /// Days until archival (only while suspended)
    pub days_until_archive: Option<i64>,
    pub plan: SubscriptionPlan,
    pub plan_name: String,
    pub features: PlanFeatures,
}

impl EffectiveState {
    fn new(state: AccessState, plan: SubscriptionPlan, features: PlanFeatures) -> Self {
        Self {
            state,
            readonly: state.is_readonly(),
            show_banner: !matches!(state, AccessState::Active),
            days_until_suspension: None,
            days_until_archive: None,
            plan,
            plan_name: plan.display_name().to_string(),
            features,
        }
    }

    /// Most restrictive outcome, used whenever inputs are missing or malformed
    fn blocked(state: AccessState, plan: SubscriptionPlan) -> Self {
        Self::new(state, plan, PlanFeatures::none())
    }
}

/// Whole days until `deadline`, rounded up, floored at zero
fn days_until(deadline: OffsetDateTime, now: OffsetDateTime) -> i64 {
    let seconds = (deadline - now).whole_seconds();
    if seconds <= 0 {
        0
    } else {
        (seconds + 86_399) / 86_400
    }
}

/// Derive the effective access state for one tenant.
///
/// `record` is absent for pure-trial tenants who never reached checkout;
/// `profile` is absent only when tenant data itself is missing, which
/// resolves to the most restrictive outcome rather than an error so the UI
/// can always render something.
pub fn evaluate(
    record: Option<&SubscriptionRecord>,
    profile: Option<&Profile>,
    now: OffsetDateTime,
) -> EffectiveState {
    match record {
        Some(record) => evaluate_record(record, now),
        None => evaluate_trial(profile, now),
    }
}

fn evaluate_trial(profile: Option<&Profile>, now: OffsetDateTime) -> EffectiveState {
    let Some(profile) = profile else {
        return EffectiveState::blocked(AccessState::TrialExpiredReadonly, SubscriptionPlan::Trial);
    };

    // A non-trial plan without a subscription row is inconsistent data;
    // treat it like an ended trial rather than guessing at entitlement.
    if profile.subscription_plan != SubscriptionPlan::Trial {
        return EffectiveState::blocked(AccessState::TrialExpiredReadonly, profile.subscription_plan);
    }

    match profile.trial_ends_at {
        Some(trial_ends_at) if now < trial_ends_at => EffectiveState::new(
            AccessState::TrialActive,
            SubscriptionPlan::Trial,
            PlanFeatures::for_plan(SubscriptionPlan::Trial),
        ),
        // Missing trial end fails closed
        _ => EffectiveState::blocked(AccessState::TrialExpiredReadonly, SubscriptionPlan::Trial),
    }
}

fn evaluate_record(record: &SubscriptionRecord, now: OffsetDateTime) -> EffectiveState {
    match record.state {
        SubscriptionState::Archived => {
            EffectiveState::blocked(AccessState::ArchivedBlocked, record.plan)
        }
        SubscriptionState::Suspended => {
            let mut state = EffectiveState::blocked(AccessState::SuspendedReadonly, record.plan);
            // Missing schedule renders as "0 days" rather than hiding the warning
            state.days_until_archive = Some(
                record
                    .archive_scheduled_at
                    .map(|at| days_until(at, now))
                    .unwrap_or(0),
            );
            state
        }
        SubscriptionState::Expired => expired_state(record, now),
        SubscriptionState::Active => {
            match record.current_period_end {
                Some(period_end) if now < period_end => EffectiveState::new(
                    AccessState::Active,
                    record.plan,
                    PlanFeatures::for_plan(record.plan),
                ),
                // Period end passed but the cron has not stamped the row yet,
                // or the timestamp is missing entirely: fail closed to the
                // grace-window view the job will converge on.
                _ => expired_state(record, now),
            }
        }
    }
}

fn expired_state(record: &SubscriptionRecord, now: OffsetDateTime) -> EffectiveState {
    let grace_ends_at = record.grace_period_ends_at.or_else(|| {
        record
            .current_period_end
            .map(|end| end + Duration::days(GRACE_PERIOD_DAYS))
    });

    // Grace already exhausted: degrade to the suspended view ahead of the
    // cron, the same way an active row past its period end degrades to the
    // expired view above. The archive countdown is the stamped schedule, or
    // grace end + 7d as the earliest the job could set it.
    if let Some(grace) = grace_ends_at {
        if now >= grace {
            let archive_at = record
                .archive_scheduled_at
                .unwrap_or_else(|| grace + Duration::days(ARCHIVE_DELAY_DAYS));
            let mut state = EffectiveState::blocked(AccessState::SuspendedReadonly, record.plan);
            state.days_until_archive = Some(days_until(archive_at, now));
            return state;
        }
    }

    let mut state = EffectiveState::blocked(AccessState::ExpiredReadonly, record.plan);
    state.days_until_suspension = Some(
        grace_ends_at
            .map(|at| days_until(at, now))
            .unwrap_or(0),
    );
    state
}
