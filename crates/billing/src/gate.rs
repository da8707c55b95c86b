//! Usage and feature gate
//!
//! Pure predicates over an already-computed [`EffectiveState`] and the
//! tenant's usage counters. Callers render upsell or read-only UI on a
//! denial; nothing here mutates state or throws for expected conditions.
//!
//! Limit convention: `None` = unlimited, `Some(0)` = none. A zero limit is a
//! real denial, never an "unlimited" sentinel.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::evaluator::EffectiveState;
use sheettools_shared::FeatureKey;

/// Per-tenant resource counters, reset on a billing cadence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageCounters {
    pub campaigns_used: i64,
    pub campaigns_limit: Option<i64>,
    pub stores_used: i64,
    pub stores_limit: Option<i64>,
    pub reset_at: Option<OffsetDateTime>,
}

/// Which countable resource a creation action consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitKind {
    Campaign,
    Store,
}

impl std::str::FromStr for LimitKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "campaign" | "campaigns" => Ok(Self::Campaign),
            "store" | "stores" => Ok(Self::Store),
            other => Err(format!("Unknown limit kind: {}", other)),
        }
    }
}

/// Outcome of a feature check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl GateDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Outcome of a limit check. `remaining` is `None` for unlimited plans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitDecision {
    pub allowed: bool,
    pub remaining: Option<i64>,
}

/// Check whether a feature is usable right now.
///
/// Read-only access overrides feature entitlement: an expired Pro tenant is
/// denied everything mutable even though the plan includes the feature.
pub fn check_feature(key: FeatureKey, effective: &EffectiveState) -> GateDecision {
    if effective.readonly {
        return GateDecision::deny(format!(
            "Account is read-only ({}); renew to regain access",
            effective.state
        ));
    }

    if effective.features.has(key) {
        GateDecision::allow()
    } else {
        GateDecision::deny(format!(
            "Feature '{}' is not included in the {} plan",
            key, effective.plan_name
        ))
    }
}

/// Check whether one more resource of `kind` may be created
pub fn check_limit(kind: LimitKind, counters: &UsageCounters) -> LimitDecision {
    let (used, limit) = match kind {
        LimitKind::Campaign => (counters.campaigns_used, counters.campaigns_limit),
        LimitKind::Store => (counters.stores_used, counters.stores_limit),
    };

    match limit {
        None => LimitDecision {
            allowed: true,
            remaining: None,
        },
        Some(limit) => LimitDecision {
            allowed: used < limit,
            remaining: Some((limit - used).max(0)),
        },
    }
}
