//! Tenant archival and restore
//!
//! Long-suspended tenants are soft-retired: an encrypted snapshot of their
//! identifying data goes into `archived_user_data`, then the live profile is
//! anonymized. Nothing is hard-deleted immediately; the snapshot can be
//! restored until `restoration_expires_at` passes.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gate::UsageCounters;
use sheettools_shared::SubscriptionPlan;

/// Days a restore remains possible after archival
pub const RESTORATION_WINDOW_DAYS: i64 = 90;

const NONCE_LEN: usize = 12;

/// AES-256-GCM wrapper for snapshot payloads
#[derive(Clone)]
pub struct SnapshotCrypto {
    key: [u8; 32],
}

impl SnapshotCrypto {
    /// Build from a 64-hex-char key (generate with: openssl rand -hex 32)
    pub fn new(hex_key: &str) -> BillingResult<Self> {
        if hex_key.len() != 64 {
            return Err(BillingError::Config(
                "ARCHIVE_ENCRYPTION_KEY must be exactly 64 hex characters (32 bytes)".to_string(),
            ));
        }

        // Reject known insecure default keys
        const INSECURE_KEYS: &[&str] = &[
            "0000000000000000000000000000000000000000000000000000000000000000",
            "ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        ];
        if INSECURE_KEYS.contains(&hex_key) {
            return Err(BillingError::Config(
                "ARCHIVE_ENCRYPTION_KEY is using a known insecure default value".to_string(),
            ));
        }

        let bytes = hex::decode(hex_key)
            .map_err(|_| BillingError::Config("ARCHIVE_ENCRYPTION_KEY must be valid hex".to_string()))?;
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(Self { key })
    }

    pub fn from_env() -> BillingResult<Self> {
        let hex_key = std::env::var("ARCHIVE_ENCRYPTION_KEY")
            .map_err(|_| BillingError::Config("ARCHIVE_ENCRYPTION_KEY is not set".to_string()))?;
        Self::new(&hex_key)
    }

    /// Encrypt to base64(nonce || ciphertext)
    pub fn encrypt(&self, plaintext: &[u8]) -> BillingResult<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| BillingError::Internal(format!("Cipher init failed: {}", e)))?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| BillingError::Internal(format!("Snapshot encryption failed: {}", e)))?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce);
        combined.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(combined))
    }

    /// Decrypt base64(nonce || ciphertext)
    pub fn decrypt(&self, encoded: &str) -> BillingResult<Vec<u8>> {
        let combined = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| BillingError::Internal(format!("Snapshot decode failed: {}", e)))?;
        if combined.len() < NONCE_LEN {
            return Err(BillingError::Internal("Snapshot payload too short".to_string()));
        }

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| BillingError::Internal(format!("Cipher init failed: {}", e)))?;
        let (nonce, ciphertext) = combined.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| BillingError::Internal(format!("Snapshot decryption failed: {}", e)))
    }
}

/// Identifying data captured at archival time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchivedSnapshot {
    pub user_id: Uuid,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub plan: SubscriptionPlan,
    pub usage: Option<UsageCounters>,
    pub archived_at: OffsetDateTime,
}

/// Service for archiving and restoring tenant data
#[derive(Clone)]
pub struct ArchiveService {
    pool: PgPool,
    crypto: SnapshotCrypto,
}

impl ArchiveService {
    pub fn new(pool: PgPool, crypto: SnapshotCrypto) -> Self {
        Self { pool, crypto }
    }

    /// Snapshot and anonymize one tenant.
    ///
    /// Caller has already moved the subscription row to `archived`; this
    /// writes the encrypted snapshot and strips identifying fields from the
    /// live profile.
    pub async fn archive_tenant(
        &self,
        user_id: Uuid,
        email: Option<&str>,
        display_name: Option<&str>,
        plan: SubscriptionPlan,
        usage: Option<UsageCounters>,
        now: OffsetDateTime,
    ) -> BillingResult<Uuid> {
        let snapshot = ArchivedSnapshot {
            user_id,
            email: email.map(str::to_string),
            display_name: display_name.map(str::to_string),
            plan,
            usage,
            archived_at: now,
        };
        let plaintext = serde_json::to_vec(&snapshot)
            .map_err(|e| BillingError::Internal(format!("Snapshot serialization failed: {}", e)))?;
        let ciphertext = self.crypto.encrypt(&plaintext)?;

        let restoration_expires_at = now + Duration::days(RESTORATION_WINDOW_DAYS);

        let id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO archived_user_data (
                user_id, snapshot_ciphertext, can_restore, restoration_expires_at, archived_at
            ) VALUES ($1, $2, TRUE, $3, $4)
            ON CONFLICT (user_id) DO UPDATE SET
                snapshot_ciphertext = EXCLUDED.snapshot_ciphertext,
                can_restore = TRUE,
                restoration_expires_at = EXCLUDED.restoration_expires_at,
                archived_at = EXCLUDED.archived_at,
                restored_at = NULL
            RETURNING id
            "#,
        )
        .bind(user_id)
        .bind(&ciphertext)
        .bind(restoration_expires_at)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        sqlx::query(
            r#"
            UPDATE profiles
            SET email = $1,
                display_name = NULL,
                subscription_status = 'archived',
                anonymized_at = $2,
                updated_at = $2
            WHERE user_id = $3
            "#,
        )
        .bind(format!("archived-{}@anonymized.invalid", user_id))
        .bind(now)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        tracing::info!(user_id = %user_id, "Archived tenant and anonymized profile");
        Ok(id.0)
    }

    /// Restore an archived tenant's identifying data.
    ///
    /// Fails when the restoration window has passed or the snapshot was
    /// already consumed. The subscription itself is reinstated by the caller.
    pub async fn restore_tenant(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<ArchivedSnapshot> {
        let row: Option<(String, bool, OffsetDateTime)> = sqlx::query_as(
            r#"
            SELECT snapshot_ciphertext, can_restore, restoration_expires_at
            FROM archived_user_data
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        let (ciphertext, can_restore, restoration_expires_at) = row.ok_or_else(|| {
            BillingError::NotFound(format!("No archived data for tenant {}", user_id))
        })?;

        if !can_restore || now >= restoration_expires_at {
            return Err(BillingError::RestorationExpired(user_id.to_string()));
        }

        let plaintext = self.crypto.decrypt(&ciphertext)?;
        let snapshot: ArchivedSnapshot = serde_json::from_slice(&plaintext)
            .map_err(|e| BillingError::Internal(format!("Snapshot deserialization failed: {}", e)))?;

        sqlx::query(
            r#"
            UPDATE profiles
            SET email = $1,
                display_name = $2,
                subscription_status = 'suspended',
                anonymized_at = NULL,
                updated_at = $3
            WHERE user_id = $4
            "#,
        )
        .bind(&snapshot.email)
        .bind(&snapshot.display_name)
        .bind(now)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "UPDATE archived_user_data SET can_restore = FALSE, restored_at = $1 WHERE user_id = $2",
        )
        .bind(now)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        tracing::info!(user_id = %user_id, "Restored tenant from archive");
        Ok(snapshot)
    }

    /// Revoke restorability for snapshots past their window (maintenance job)
    pub async fn purge_expired_restores(&self, now: OffsetDateTime) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE archived_user_data
            SET can_restore = FALSE
            WHERE can_restore = TRUE AND restoration_expires_at < $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            tracing::info!(
                revoked = result.rows_affected(),
                "Revoked expired restoration windows"
            );
        }
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "a1b2c3d4e5f6789012345678901234567890abcdef1234567890abcdef123456";

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let crypto = SnapshotCrypto::new(TEST_KEY).unwrap();
        let plaintext = br#"{"email":"merchant@example.com"}"#;
        let encoded = crypto.encrypt(plaintext).unwrap();
        assert_ne!(encoded.as_bytes(), plaintext.as_slice());
        let decrypted = crypto.decrypt(&encoded).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_nonces_are_unique_per_encryption() {
        let crypto = SnapshotCrypto::new(TEST_KEY).unwrap();
        let a = crypto.encrypt(b"same payload").unwrap();
        let b = crypto.encrypt(b"same payload").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_rejects_short_key() {
        assert!(matches!(
            SnapshotCrypto::new("abc123"),
            Err(BillingError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_all_zero_key() {
        let zeros = "0".repeat(64);
        assert!(matches!(
            SnapshotCrypto::new(&zeros),
            Err(BillingError::Config(_))
        ));
    }

    #[test]
    fn test_tampered_payload_fails() {
        let crypto = SnapshotCrypto::new(TEST_KEY).unwrap();
        let encoded = crypto.encrypt(b"payload").unwrap();
        let mut bytes = base64::engine::general_purpose::STANDARD
            .decode(&encoded)
            .unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let tampered = base64::engine::general_purpose::STANDARD.encode(bytes);
        assert!(crypto.decrypt(&tampered).is_err());
    }
}
