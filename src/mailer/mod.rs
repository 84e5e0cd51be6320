//! Outbound email providers.
//!
//! A provider takes `{from, to, reply_to, subject, text}` and hands back the
//! provider's message id, which the reply handler later uses to attribute
//! inbound mail.

pub mod resend;
pub mod smtp;

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::error::MailerError;

pub use resend::{ResendConfig, ResendMailer};
pub use smtp::{SmtpConfig, SmtpMailer};

/// A fully rendered plain-text email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundEmail {
    pub from: String,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub subject: String,
    pub text: String,
}

/// Sends one email and returns the provider message id.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Provider name for logs and error text.
    fn name(&self) -> &str;

    async fn send(&self, email: &OutboundEmail) -> Result<String, MailerError>;
}

/// Which provider to build.
#[derive(Debug, Clone)]
pub enum MailerConfig {
    Smtp(SmtpConfig),
    Resend(ResendConfig),
    DryRun,
}

impl MailerConfig {
    pub fn provider(&self) -> &'static str {
        match self {
            Self::Smtp(_) => "smtp",
            Self::Resend(_) => "resend",
            Self::DryRun => "dry-run",
        }
    }
}

/// Build the configured provider.
pub fn create_mailer(config: &MailerConfig) -> Result<Arc<dyn Mailer>, MailerError> {
    let mailer: Arc<dyn Mailer> = match config {
        MailerConfig::Smtp(cfg) => Arc::new(SmtpMailer::new(cfg.clone())?),
        MailerConfig::Resend(cfg) => Arc::new(ResendMailer::new(cfg.clone())?),
        MailerConfig::DryRun => Arc::new(DryRunMailer),
    };
    tracing::info!(provider = mailer.name(), "Mailer ready");
    Ok(mailer)
}

/// `<uuid@domain>` using the sender's domain, or `localhost`.
pub fn generate_message_id(from: &str) -> String {
    let domain = from
        .rsplit_once('@')
        .map(|(_, d)| d.trim_end_matches('>').trim())
        .filter(|d| !d.is_empty())
        .unwrap_or("localhost");
    format!("<{}@{}>", Uuid::new_v4(), domain)
}

/// Logs instead of sending. For local development.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunMailer;

#[async_trait]
impl Mailer for DryRunMailer {
    fn name(&self) -> &str {
        "dry-run"
    }

    async fn send(&self, email: &OutboundEmail) -> Result<String, MailerError> {
        let id = generate_message_id(&email.from);
        tracing::info!(
            to = %email.to,
            subject = %email.subject,
            message_id = %id,
            "Dry-run send"
        );
        Ok(id)
    }
}
