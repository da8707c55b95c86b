//! End-to-end lifecycle scenarios against a real Postgres database
//!
//! Ignored by default; run with a disposable database:
//!
//! ```bash
//! export DATABASE_URL="postgres://localhost/sheettools_test"
//! cargo test --test lifecycle_scenarios -- --ignored --test-threads=1
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use sheettools_billing::{
    evaluate, AccessState, ArchiveService, AuditEventType, AuditLogger, BillingError,
    RetentionEmailService, SnapshotCrypto, StateChange, SubscriptionLifecycle, SubscriptionStore,
    TransitionJob,
};
use sheettools_shared::{BillingPeriod, SubscriptionPlan, SubscriptionState};

const TEST_KEY: &str = "a1b2c3d4e5f6789012345678901234567890abcdef1234567890abcdef123456";

struct TestHarness {
    pool: PgPool,
    store: SubscriptionStore,
    audit: AuditLogger,
    job: TransitionJob,
    lifecycle: SubscriptionLifecycle,
}

async fn setup() -> TestHarness {
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("Failed to connect to test database");
    sheettools_shared::db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    let store = SubscriptionStore::new(pool.clone());
    let audit = AuditLogger::new(pool.clone());
    let archive = ArchiveService::new(pool.clone(), SnapshotCrypto::new(TEST_KEY).unwrap());
    // No BREVO_API_KEY in tests: sends are skipped as non-fatal failures
    let email = RetentionEmailService::from_env();

    let job = TransitionJob::new(store.clone(), audit.clone(), email, archive.clone());
    let lifecycle = SubscriptionLifecycle::new(store.clone(), audit.clone(), archive);

    TestHarness {
        pool,
        store,
        audit,
        job,
        lifecycle,
    }
}

async fn create_tenant(harness: &TestHarness, period_end: OffsetDateTime) -> Uuid {
    let user_id = Uuid::new_v4();
    let now = OffsetDateTime::now_utc();

    sqlx::query(
        r#"
        INSERT INTO profiles (user_id, email, display_name, subscription_plan, subscription_status)
        VALUES ($1, $2, 'Test Merchant', 'standard', 'active')
        "#,
    )
    .bind(user_id)
    .bind(format!("merchant-{}@example.com", user_id))
    .execute(&harness.pool)
    .await
    .expect("Failed to create test profile");

    harness
        .store
        .upsert_record(
            user_id,
            SubscriptionPlan::Standard,
            BillingPeriod::Monthly,
            "active",
            Some(period_end - Duration::days(30)),
            Some(period_end),
            None,
            None,
            now,
        )
        .await
        .expect("Failed to create subscription record");

    user_id
}

async fn cleanup(harness: &TestHarness, user_id: Uuid) {
    for table in [
        "retention_email_log",
        "archived_user_data",
        "audit_logs",
        "usage_counters",
        "subscriptions",
        "profiles",
    ] {
        sqlx::query(&format!("DELETE FROM {} WHERE user_id = $1", table))
            .bind(user_id)
            .execute(&harness.pool)
            .await
            .unwrap();
    }
}

async fn state_of(harness: &TestHarness, user_id: Uuid) -> SubscriptionState {
    harness
        .store
        .get_record(user_id)
        .await
        .unwrap()
        .expect("subscription row must exist")
        .state
}

#[tokio::test]
#[ignore]
async fn test_full_lifecycle_to_archive_and_restore() {
    let harness = setup().await;

    // Expired just over a day ago so the first pass lands between the
    // D+0 and D+5 email offsets.
    let period_end = OffsetDateTime::now_utc() - Duration::hours(25);
    let user_id = create_tenant(&harness, period_end).await;

    // The stored row still says active, but the evaluator already reports
    // the grace-window view.
    let record = harness.store.get_record(user_id).await.unwrap().unwrap();
    let effective = evaluate(Some(&record), None, OffsetDateTime::now_utc());
    assert_eq!(effective.state, AccessState::ExpiredReadonly);

    // Pass 1: active -> expired
    let t0 = OffsetDateTime::now_utc();
    let summary = harness.job.run(t0).await;
    assert!(summary.errors.is_empty(), "errors: {:?}", summary.errors);
    assert_eq!(state_of(&harness, user_id).await, SubscriptionState::Expired);

    // Rerun at the same instant is a no-op
    let summary = harness.job.run(t0).await;
    assert_eq!(summary.transitions, 0);
    assert_eq!(state_of(&harness, user_id).await, SubscriptionState::Expired);

    // Pass 2, after the grace window: expired -> suspended
    let t1 = t0 + Duration::days(8);
    harness.job.run(t1).await;
    let record = harness.store.get_record(user_id).await.unwrap().unwrap();
    assert_eq!(record.state, SubscriptionState::Suspended);
    let archive_at = record.archive_scheduled_at.expect("archive must be scheduled");
    assert_eq!(archive_at, t1 + Duration::days(7));

    // Pass 3, after the archive delay: suspended -> archived, snapshot
    // written, profile anonymized
    let t2 = t1 + Duration::days(8);
    harness.job.run(t2).await;
    assert_eq!(state_of(&harness, user_id).await, SubscriptionState::Archived);

    let (can_restore,): (bool,) =
        sqlx::query_as("SELECT can_restore FROM archived_user_data WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&harness.pool)
            .await
            .unwrap();
    assert!(can_restore);

    let profile = harness.store.get_profile(user_id).await.unwrap().unwrap();
    assert!(profile.email.unwrap().ends_with("@anonymized.invalid"));

    // Archived tenants drop out of the batch entirely
    let summary = harness.job.run(t2 + Duration::days(1)).await;
    assert_eq!(summary.transitions, 0);

    // Restore brings the tenant back as suspended with the profile intact
    let admin = Uuid::new_v4();
    let record = harness
        .lifecycle
        .restore_tenant(user_id, admin, OffsetDateTime::now_utc())
        .await
        .unwrap();
    assert_eq!(record.state, SubscriptionState::Suspended);
    let profile = harness.store.get_profile(user_id).await.unwrap().unwrap();
    assert!(profile.email.unwrap().starts_with("merchant-"));

    // A second restore attempt fails: the snapshot was consumed
    assert!(harness
        .lifecycle
        .restore_tenant(user_id, admin, OffsetDateTime::now_utc())
        .await
        .is_err());

    cleanup(&harness, user_id).await;
}

#[tokio::test]
#[ignore]
async fn test_retention_marker_claims_exactly_once() {
    let harness = setup().await;

    // Exactly five whole days past expiry: the D+5 offset is due
    let period_end = OffsetDateTime::now_utc() - Duration::days(5) - Duration::hours(1);
    let user_id = create_tenant(&harness, period_end).await;

    let t0 = OffsetDateTime::now_utc();
    let first = harness.job.run(t0).await;
    // No provider key configured, so the claimed send is reported as a
    // failure, but the marker is still consumed
    assert_eq!(first.emails_sent, 0);
    assert_eq!(
        first.errors.iter().filter(|f| f.user_id == user_id).count(),
        1
    );

    let second = harness.job.run(t0).await;
    assert!(second.errors.iter().all(|f| f.user_id != user_id));
    assert_eq!(second.emails_skipped, 1);

    let (markers,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM retention_email_log WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&harness.pool)
            .await
            .unwrap();
    assert_eq!(markers, 1);

    cleanup(&harness, user_id).await;
}

#[tokio::test]
#[ignore]
async fn test_payment_resets_expired_tenant_to_active() {
    let harness = setup().await;

    let period_end = OffsetDateTime::now_utc() - Duration::days(2);
    let user_id = create_tenant(&harness, period_end).await;

    let t0 = OffsetDateTime::now_utc();
    harness.job.run(t0).await;
    assert_eq!(state_of(&harness, user_id).await, SubscriptionState::Expired);

    // A successful renewal wipes the grace window and reopens access
    let update = sheettools_billing::BillingEventUpdate {
        user_id,
        plan: SubscriptionPlan::Standard,
        billing_period: BillingPeriod::Monthly,
        status: "active".to_string(),
        current_period_start: Some(t0),
        current_period_end: Some(t0 + Duration::days(30)),
        provider_customer_id: None,
        provider_subscription_id: None,
    };
    let record = harness
        .lifecycle
        .apply_payment_succeeded(&update, t0)
        .await
        .unwrap();
    assert_eq!(record.state, SubscriptionState::Active);
    assert_eq!(record.grace_period_ends_at, None);
    assert!(!record.readonly_mode);

    let effective = evaluate(Some(&record), None, t0 + Duration::days(1));
    assert_eq!(effective.state, AccessState::Active);

    cleanup(&harness, user_id).await;
}

#[tokio::test]
#[ignore]
async fn test_admin_override_happy_path_and_archived_rejection() {
    let harness = setup().await;

    let period_end = OffsetDateTime::now_utc() + Duration::days(20);
    let user_id = create_tenant(&harness, period_end).await;
    let admin = Uuid::new_v4();
    let now = OffsetDateTime::now_utc();

    // Forcing archived is refused outright: archival belongs to the job
    let err = harness
        .lifecycle
        .set_subscription_state(user_id, SubscriptionState::Archived, "cleanup", admin, now)
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::InvalidTransition { .. }));
    assert_eq!(state_of(&harness, user_id).await, SubscriptionState::Active);

    // Suspend a tenant under review
    let record = harness
        .lifecycle
        .set_subscription_state(user_id, SubscriptionState::Suspended, "fraud review", admin, now)
        .await
        .unwrap();
    assert_eq!(record.state, SubscriptionState::Suspended);
    assert!(record.readonly_mode);
    assert!(record.archive_scheduled_at.is_some());

    let overrides = harness
        .audit
        .get_entries_by_type(user_id, AuditEventType::AdminStateOverride, 10)
        .await
        .unwrap();
    assert_eq!(overrides.len(), 1);
    assert_eq!(overrides[0].actor_id, Some(admin));
    assert_eq!(overrides[0].new_state.as_deref(), Some("suspended"));

    // Lifting the override clears every lifecycle timestamp
    let record = harness
        .lifecycle
        .set_subscription_state(user_id, SubscriptionState::Active, "review resolved", admin, now)
        .await
        .unwrap();
    assert_eq!(record.state, SubscriptionState::Active);
    assert!(!record.readonly_mode);
    assert_eq!(record.grace_period_ends_at, None);
    assert_eq!(record.archive_scheduled_at, None);

    cleanup(&harness, user_id).await;
}

#[tokio::test]
#[ignore]
async fn test_stale_compare_and_set_is_rejected() {
    let harness = setup().await;

    let period_end = OffsetDateTime::now_utc() - Duration::days(2);
    let user_id = create_tenant(&harness, period_end).await;

    let snapshot = harness.store.get_record(user_id).await.unwrap().unwrap();

    // A webhook lands between our read and our write
    sqlx::query("UPDATE subscriptions SET last_state_change_at = NOW() WHERE user_id = $1")
        .bind(user_id)
        .execute(&harness.pool)
        .await
        .unwrap();

    let change = StateChange {
        to: SubscriptionState::Expired,
        readonly_mode: true,
        grace_period_ends_at: Some(OffsetDateTime::now_utc() + Duration::days(7)),
        archive_scheduled_at: None,
        archived_at: None,
        reason: "billing period ended without renewal".to_string(),
    };

    // The stale snapshot loses the race and changes nothing
    let won = harness
        .store
        .apply_state_change(
            user_id,
            snapshot.state,
            snapshot.last_state_change_at,
            &change,
            OffsetDateTime::now_utc(),
        )
        .await
        .unwrap();
    assert!(!won);
    assert_eq!(state_of(&harness, user_id).await, SubscriptionState::Active);

    // Re-read and retry once, as the job does, and the write lands
    let fresh = harness.store.get_record(user_id).await.unwrap().unwrap();
    let won = harness
        .store
        .apply_state_change(
            user_id,
            fresh.state,
            fresh.last_state_change_at,
            &change,
            OffsetDateTime::now_utc(),
        )
        .await
        .unwrap();
    assert!(won);
    assert_eq!(state_of(&harness, user_id).await, SubscriptionState::Expired);

    cleanup(&harness, user_id).await;
}

#[tokio::test]
#[ignore]
async fn test_trial_signup_creates_profile_and_audit() {
    let harness = setup().await;

    let user_id = Uuid::new_v4();
    let now = OffsetDateTime::now_utc();
    let profile = harness
        .lifecycle
        .create_trial(
            user_id,
            &format!("merchant-{}@example.com", user_id),
            Some("New Merchant"),
            now,
        )
        .await
        .unwrap();
    assert_eq!(profile.subscription_plan, SubscriptionPlan::Trial);
    assert_eq!(profile.trial_ends_at, Some(now + Duration::days(14)));

    // Full access during the window, read-only after it
    let effective = evaluate(None, Some(&profile), now + Duration::days(1));
    assert_eq!(effective.state, AccessState::TrialActive);
    let effective = evaluate(None, Some(&profile), now + Duration::days(15));
    assert_eq!(effective.state, AccessState::TrialExpiredReadonly);

    let entries = harness
        .audit
        .get_entries_by_type(user_id, AuditEventType::TrialStarted, 10)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);

    cleanup(&harness, user_id).await;
}
