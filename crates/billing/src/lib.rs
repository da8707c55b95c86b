//! Sheet Tools Billing Core
//!
//! Subscription lifecycle for Sheet Tools tenants: one explicit state machine
//! (active → expired → suspended → archived) that the HTTP API and the
//! scheduled worker both call into, plus the pure access evaluator and
//! feature/limit gate that front it.

pub mod archive;
pub mod audit;
pub mod email;
pub mod error;
pub mod evaluator;
pub mod gate;
pub mod lifecycle;
pub mod record;
pub mod transition;

pub use archive::{ArchiveService, ArchivedSnapshot, SnapshotCrypto};
pub use audit::{ActorType, AuditEventType, AuditLogEntry, AuditLogBuilder, AuditLogger};
pub use email::{EmailConfig, RetentionEmailService, RetentionOffset};
pub use error::{BillingError, BillingResult};
pub use evaluator::{evaluate, AccessState, EffectiveState};
pub use gate::{check_feature, check_limit, GateDecision, LimitDecision, LimitKind, UsageCounters};
pub use lifecycle::{BillingEventUpdate, SubscriptionLifecycle};
pub use record::{Profile, StateChange, SubscriptionRecord, SubscriptionStore};
pub use transition::{JobSummary, TenantFailure, Transition, TransitionJob};
