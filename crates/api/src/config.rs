//! API server configuration

use anyhow::{bail, Context};

/// Runtime configuration, loaded from the environment at startup
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    /// Shared secret for billing webhook HMAC signatures
    pub webhook_secret: String,
    /// Allowed origin for CORS (the dashboard)
    pub frontend_url: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .context("PORT must be a valid port number")?;

        let webhook_secret =
            std::env::var("WEBHOOK_HMAC_SECRET").context("WEBHOOK_HMAC_SECRET must be set")?;
        validate_secret("WEBHOOK_HMAC_SECRET", &webhook_secret)?;

        let frontend_url =
            std::env::var("FRONTEND_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());

        Ok(Self {
            database_url,
            port,
            webhook_secret,
            frontend_url,
        })
    }
}

/// Secrets must be long enough to resist brute force and never a known
/// placeholder value
fn validate_secret(name: &str, value: &str) -> anyhow::Result<()> {
    if value.len() < 32 {
        bail!("{} must be at least 32 characters (generate with: openssl rand -hex 32)", name);
    }

    const PLACEHOLDERS: &[&str] = &["changeme", "secret", "development", "test"];
    let lowered = value.to_lowercase();
    if PLACEHOLDERS.iter().any(|p| lowered.starts_with(p)) {
        bail!("{} is using a placeholder value", name);
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_short_secret() {
        assert!(validate_secret("X", "too-short").is_err());
    }

    #[test]
    fn test_rejects_placeholder_secret() {
        assert!(validate_secret("X", &"changeme".repeat(8)).is_err());
    }

    #[test]
    fn test_accepts_strong_secret() {
        assert!(validate_secret("X", "a1b2c3d4e5f6a7b8c9d0e1f2a3b4c5d6e7f8").is_ok());
    }
}
