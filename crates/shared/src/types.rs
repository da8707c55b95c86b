//! Common types used across Sheet Tools

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Tenant (user) ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Subscription plan for billing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionPlan {
    Trial,
    Beginner,
    Standard,
    Pro,
}

impl Default for SubscriptionPlan {
    fn default() -> Self {
        Self::Trial
    }
}

impl std::fmt::Display for SubscriptionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trial => write!(f, "trial"),
            Self::Beginner => write!(f, "beginner"),
            Self::Standard => write!(f, "standard"),
            Self::Pro => write!(f, "pro"),
        }
    }
}

impl std::str::FromStr for SubscriptionPlan {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trial" => Ok(Self::Trial),
            "beginner" => Ok(Self::Beginner),
            "standard" => Ok(Self::Standard),
            "pro" => Ok(Self::Pro),
            other => Err(format!("Unknown subscription plan: {}", other)),
        }
    }
}

impl SubscriptionPlan {
    /// Marketing name shown in banners and emails
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Trial => "Free Trial",
            Self::Beginner => "Beginner",
            Self::Standard => "Standard",
            Self::Pro => "Pro",
        }
    }

    /// Campaign limit for this plan. `None` means unlimited, `Some(0)` means none.
    pub fn campaign_limit(&self) -> Option<i64> {
        match self {
            Self::Trial | Self::Standard => Some(40),
            Self::Beginner => Some(10),
            Self::Pro => None,
        }
    }

    /// Connected-store limit for this plan. `None` means unlimited.
    pub fn store_limit(&self) -> Option<i64> {
        match self {
            Self::Trial | Self::Beginner => Some(1),
            Self::Standard => Some(2),
            Self::Pro => Some(5),
        }
    }

    /// Feature set granted by this plan
    pub fn features(&self) -> PlanFeatures {
        PlanFeatures::for_plan(*self)
    }
}

/// Billing interval for a paid subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BillingPeriod {
    Monthly,
    Annual,
}

impl Default for BillingPeriod {
    fn default() -> Self {
        Self::Monthly
    }
}

impl std::fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Monthly => write!(f, "monthly"),
            Self::Annual => write!(f, "annual"),
        }
    }
}

impl std::str::FromStr for BillingPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "monthly" => Ok(Self::Monthly),
            "annual" | "yearly" => Ok(Self::Annual),
            other => Err(format!("Unknown billing period: {}", other)),
        }
    }
}

/// Stored lifecycle state of a subscription.
///
/// Transitions only move forward (active → expired → suspended → archived);
/// the single exception is a reset to `active` on a successful payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    Active,
    Expired,
    Suspended,
    Archived,
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Expired => write!(f, "expired"),
            Self::Suspended => write!(f, "suspended"),
            Self::Archived => write!(f, "archived"),
        }
    }
}

impl std::str::FromStr for SubscriptionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "expired" => Ok(Self::Expired),
            "suspended" => Ok(Self::Suspended),
            "archived" => Ok(Self::Archived),
            other => Err(format!("Unknown subscription state: {}", other)),
        }
    }
}

impl SubscriptionState {
    /// Position in the forward-only lifecycle ordering
    pub fn rank(&self) -> u8 {
        match self {
            Self::Active => 0,
            Self::Expired => 1,
            Self::Suspended => 2,
            Self::Archived => 3,
        }
    }

    /// Archived tenants never advance further
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Archived)
    }

    /// Whether tenants in this state get read-only access
    pub fn is_readonly(&self) -> bool {
        !matches!(self, Self::Active)
    }
}

// =============================================================================
// Features
// =============================================================================

/// Closed set of gateable features.
///
/// Kept as an enum rather than free-form strings so an unknown key is a type
/// error server-side and a deny at the gate, never a silent allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FeatureKey {
    DailyRoas,
    ProfitSheet,
    ProductResearch,
    CampaignControl,
    MetaDashboard,
    MultiStore,
    CsvExport,
}

impl std::fmt::Display for FeatureKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DailyRoas => "daily-roas",
            Self::ProfitSheet => "profit-sheet",
            Self::ProductResearch => "product-research",
            Self::CampaignControl => "campaign-control",
            Self::MetaDashboard => "meta-dashboard",
            Self::MultiStore => "multi-store",
            Self::CsvExport => "csv-export",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for FeatureKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "daily-roas" => Ok(Self::DailyRoas),
            "profit-sheet" => Ok(Self::ProfitSheet),
            "product-research" => Ok(Self::ProductResearch),
            "campaign-control" => Ok(Self::CampaignControl),
            "meta-dashboard" => Ok(Self::MetaDashboard),
            "multi-store" => Ok(Self::MultiStore),
            "csv-export" => Ok(Self::CsvExport),
            other => Err(format!("Unknown feature key: {}", other)),
        }
    }
}

/// Feature flags resolved for a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFeatures {
    /// Daily ROAS tracking sheet
    pub daily_roas: bool,
    /// Profit sheet with COGS breakdown
    pub profit_sheet: bool,
    /// Product research board
    pub product_research: bool,
    /// Campaign start/stop and budget control
    pub campaign_control: bool,
    /// Meta ads dashboard
    pub meta_dashboard: bool,
    /// More than one connected Shopify store
    pub multi_store: bool,
    /// CSV export of sheets
    pub csv_export: bool,
}

impl PlanFeatures {
    /// Get features for a plan
    pub fn for_plan(plan: SubscriptionPlan) -> Self {
        match plan {
            SubscriptionPlan::Beginner => Self {
                daily_roas: true,
                profit_sheet: true,
                product_research: false,
                campaign_control: true,
                meta_dashboard: false,
                multi_store: false,
                csv_export: false,
            },
            // Trials get the Standard feature set for the evaluation window
            SubscriptionPlan::Trial | SubscriptionPlan::Standard => Self {
                daily_roas: true,
                profit_sheet: true,
                product_research: true,
                campaign_control: true,
                meta_dashboard: true,
                multi_store: true,
                csv_export: true,
            },
            SubscriptionPlan::Pro => Self {
                daily_roas: true,
                profit_sheet: true,
                product_research: true,
                campaign_control: true,
                meta_dashboard: true,
                multi_store: true,
                csv_export: true,
            },
        }
    }

    /// Feature set for tenants with no entitlement left (expired trial, archived)
    pub fn none() -> Self {
        Self {
            daily_roas: false,
            profit_sheet: false,
            product_research: false,
            campaign_control: false,
            meta_dashboard: false,
            multi_store: false,
            csv_export: false,
        }
    }

    /// Check a single feature flag
    pub fn has(&self, key: FeatureKey) -> bool {
        match key {
            FeatureKey::DailyRoas => self.daily_roas,
            FeatureKey::ProfitSheet => self.profit_sheet,
            FeatureKey::ProductResearch => self.product_research,
            FeatureKey::CampaignControl => self.campaign_control,
            FeatureKey::MetaDashboard => self.meta_dashboard,
            FeatureKey::MultiStore => self.multi_store,
            FeatureKey::CsvExport => self.csv_export,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display_roundtrip() {
        for state in [
            SubscriptionState::Active,
            SubscriptionState::Expired,
            SubscriptionState::Suspended,
            SubscriptionState::Archived,
        ] {
            let parsed: SubscriptionState = state.to_string().parse().unwrap();
            assert_eq!(parsed, state);
        }
    }

    #[test]
    fn test_state_ordering_is_forward_only() {
        assert!(SubscriptionState::Active.rank() < SubscriptionState::Expired.rank());
        assert!(SubscriptionState::Expired.rank() < SubscriptionState::Suspended.rank());
        assert!(SubscriptionState::Suspended.rank() < SubscriptionState::Archived.rank());
        assert!(SubscriptionState::Archived.is_terminal());
    }

    #[test]
    fn test_beginner_features() {
        let features = PlanFeatures::for_plan(SubscriptionPlan::Beginner);
        assert!(features.daily_roas);
        assert!(!features.product_research);
        assert!(!features.multi_store);
    }

    #[test]
    fn test_trial_gets_standard_features() {
        assert_eq!(
            PlanFeatures::for_plan(SubscriptionPlan::Trial),
            PlanFeatures::for_plan(SubscriptionPlan::Standard)
        );
    }

    #[test]
    fn test_pro_campaigns_unlimited() {
        assert_eq!(SubscriptionPlan::Pro.campaign_limit(), None);
        assert_eq!(SubscriptionPlan::Beginner.campaign_limit(), Some(10));
    }

    #[test]
    fn test_feature_key_parse() {
        assert_eq!(
            "meta-dashboard".parse::<FeatureKey>().unwrap(),
            FeatureKey::MetaDashboard
        );
        assert!("rendering-engine".parse::<FeatureKey>().is_err());
    }
}
