//! Retention email notifications
//!
//! Sends transactional emails via the Brevo API when a subscription lapses.
//! Sending is a notification side effect: a provider failure is logged and
//! reported as `Ok(false)` so the caller's state transition never depends on
//! email delivery.

use crate::error::BillingResult;

/// Email configuration
#[derive(Debug, Clone)]
pub struct EmailConfig {
    /// Brevo API key
    pub brevo_api_key: String,
    /// Sender name
    pub sender_name: String,
    /// Sender address
    pub sender_email: String,
    /// App name for branding
    pub app_name: String,
    /// Dashboard URL for renewal links
    pub dashboard_url: String,
    /// API base, overridable for tests
    pub api_base: String,
}

impl EmailConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            brevo_api_key: std::env::var("BREVO_API_KEY").unwrap_or_default(),
            sender_name: std::env::var("EMAIL_FROM_NAME")
                .unwrap_or_else(|_| "Sheet Tools".to_string()),
            sender_email: std::env::var("EMAIL_FROM")
                .unwrap_or_else(|_| "noreply@sheet-tools.com".to_string()),
            app_name: std::env::var("APP_NAME").unwrap_or_else(|_| "Sheet Tools".to_string()),
            dashboard_url: std::env::var("PUBLIC_URL")
                .unwrap_or_else(|_| "https://sheet-tools.com".to_string()),
            api_base: std::env::var("BREVO_API_BASE")
                .unwrap_or_else(|_| "https://api.brevo.com".to_string()),
        }
    }

    /// Check if email sending is enabled
    pub fn is_enabled(&self) -> bool {
        !self.brevo_api_key.is_empty()
    }
}

/// Fixed day offsets past expiry at which retention emails go out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionOffset {
    /// Day of expiry
    DayZero,
    /// Five days past expiry, two before suspension
    DayFive,
    /// Ten days past expiry, four before archival
    DayTen,
}

impl RetentionOffset {
    /// Offset matching an exact whole-day distance past expiry, if any
    pub fn from_days_since_expiry(days: i64) -> Option<Self> {
        match days {
            0 => Some(Self::DayZero),
            5 => Some(Self::DayFive),
            10 => Some(Self::DayTen),
            _ => None,
        }
    }

    pub fn days(&self) -> i64 {
        match self {
            Self::DayZero => 0,
            Self::DayFive => 5,
            Self::DayTen => 10,
        }
    }

    /// Tag recorded with the provider for delivery analytics
    pub fn tag(&self) -> &'static str {
        match self {
            Self::DayZero => "retention-d0",
            Self::DayFive => "retention-d5",
            Self::DayTen => "retention-d10",
        }
    }
}

/// Retention email service backed by Brevo
#[derive(Clone)]
pub struct RetentionEmailService {
    config: EmailConfig,
    client: reqwest::Client,
}

impl RetentionEmailService {
    /// Create a new email service
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Self {
        Self::new(EmailConfig::from_env())
    }

    /// Send an email via the Brevo transactional API.
    ///
    /// Returns `Ok(true)` if the email was accepted, `Ok(false)` if sending
    /// failed (non-fatal), `Err` only for configuration problems.
    async fn send_email(
        &self,
        to_email: &str,
        to_name: Option<&str>,
        subject: &str,
        html: &str,
        tag: &str,
    ) -> BillingResult<bool> {
        if !self.config.is_enabled() {
            tracing::warn!(
                to = %to_email,
                subject = %subject,
                "Email not configured, skipping"
            );
            return Ok(false);
        }

        #[allow(clippy::disallowed_methods)]
        // json! macro uses unwrap internally, safe for primitive types
        let body = serde_json::json!({
            "sender": { "name": self.config.sender_name, "email": self.config.sender_email },
            "to": [{ "email": to_email, "name": to_name.unwrap_or(to_email) }],
            "subject": subject,
            "htmlContent": html,
            "tags": [tag],
        });

        let response = self
            .client
            .post(format!("{}/v3/smtp/email", self.config.api_base))
            .header("api-key", &self.config.brevo_api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => {
                tracing::info!(to = %to_email, subject = %subject, tag = %tag, "Retention email sent");
                Ok(true)
            }
            Ok(resp) => {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                tracing::error!(
                    to = %to_email,
                    subject = %subject,
                    status = %status,
                    body = %body,
                    "Failed to send retention email - non-fatal"
                );
                Ok(false)
            }
            Err(e) => {
                tracing::error!(
                    to = %to_email,
                    subject = %subject,
                    error = %e,
                    "Failed to send retention email - non-fatal"
                );
                Ok(false)
            }
        }
    }

    /// Send the retention email for one day offset past expiry
    pub async fn send_retention_email(
        &self,
        to_email: &str,
        to_name: Option<&str>,
        plan_name: &str,
        offset: RetentionOffset,
    ) -> BillingResult<bool> {
        let renew_link = format!("{}/settings/billing", self.config.dashboard_url);

        let (subject, headline, body_copy) = match offset {
            RetentionOffset::DayZero => (
                format!("Your {} subscription has expired", self.config.app_name),
                "Your subscription has expired",
                format!(
                    "Your <strong>{plan_name}</strong> plan ended today. Your sheets and \
                     campaign data are safe, and your account is in read-only mode for the \
                     next 7 days. Renew now to pick up right where you left off."
                ),
            ),
            RetentionOffset::DayFive => (
                format!("2 days left before your {} account is suspended", self.config.app_name),
                "Your account will be suspended soon",
                format!(
                    "It has been 5 days since your <strong>{plan_name}</strong> plan expired. \
                     In 2 days your account will be suspended and your dashboards will no \
                     longer be viewable. Renewing takes less than a minute."
                ),
            ),
            RetentionOffset::DayTen => (
                format!("Final notice: your {} data will be archived", self.config.app_name),
                "Final notice before archival",
                format!(
                    "Your <strong>{plan_name}</strong> plan expired 10 days ago. In 4 days \
                     your account data will be archived and your profile anonymized. You can \
                     still restore everything by renewing before then."
                ),
            ),
        };

        let html = format!(
            r#"<!DOCTYPE html>
<html>
<head><meta charset="utf-8"></head>
<body style="font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; line-height: 1.6; color: #333; max-width: 600px; margin: 0 auto; padding: 20px;">
    <h2 style="color: #dc2626;">{headline}</h2>
    <p>Hi there,</p>
    <p>{body_copy}</p>
    <p>
        <a href="{renew_link}" style="display: inline-block; padding: 12px 24px; background-color: #6366f1; color: white; text-decoration: none; border-radius: 6px; font-weight: bold;">
            Renew Subscription
        </a>
    </p>
    <hr style="border: none; border-top: 1px solid #eee; margin: 20px 0;">
    <p style="color: #999; font-size: 12px;">{app_name}</p>
</body>
</html>"#,
            headline = headline,
            body_copy = body_copy,
            renew_link = renew_link,
            app_name = self.config.app_name,
        );

        self.send_email(to_email, to_name, &subject, &html, offset.tag())
            .await
    }
}
