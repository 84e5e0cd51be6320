//! Configuration types.

use std::net::SocketAddr;
use std::path::PathBuf;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::mailer::resend::DEFAULT_RESEND_BASE_URL;
use crate::mailer::{MailerConfig, ResendConfig, SmtpConfig};

/// Placeholder unsubscribe secret used when none is configured.
pub const DEFAULT_UNSUBSCRIBE_SECRET: &str = "default-secret-change-me";

/// Default cap on messages processed per worker run.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Runtime configuration for the outreach service.
#[derive(Debug, Clone)]
pub struct OutreachConfig {
    /// HTTP listen address.
    pub bind: SocketAddr,
    /// libSQL database file.
    pub db_path: PathBuf,
    /// Shared secret for the cron trigger. Unset rejects every trigger.
    pub cron_secret: Option<SecretString>,
    /// Shared secret / HMAC key for inbound webhooks. Unset disables checks.
    pub webhook_secret: Option<SecretString>,
    /// HMAC key for unsubscribe tokens.
    pub unsubscribe_secret: SecretString,
    /// Bearer token for console routes. Unset leaves them open.
    pub admin_token: Option<SecretString>,
    /// Base URL used in unsubscribe links.
    pub public_url: String,
    /// Value of the `{{sender}}` / `{{senderName}}` variables.
    pub sender_name: String,
    /// Default `from_mailbox` for new campaigns.
    pub from_email: String,
    /// Messages processed per worker run.
    pub batch_size: usize,
    pub mailer: MailerConfig,
}

impl OutreachConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let secret = |key: &str| get(key).map(SecretString::from);

        let bind = match get("OUTREACH_BIND") {
            Some(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
                key: "OUTREACH_BIND".into(),
                message: format!("{raw}: {e}"),
            })?,
            None => SocketAddr::from(([0, 0, 0, 0], 3000)),
        };

        let batch_size = match get("OUTREACH_BATCH_SIZE") {
            Some(raw) => match raw.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "OUTREACH_BATCH_SIZE".into(),
                        message: format!("expected a positive integer, got {raw}"),
                    });
                }
            },
            None => DEFAULT_BATCH_SIZE,
        };

        let unsubscribe_secret = secret("UNSUBSCRIBE_SECRET").unwrap_or_else(|| {
            tracing::warn!("UNSUBSCRIBE_SECRET not set - using the built-in default secret");
            SecretString::from(DEFAULT_UNSUBSCRIBE_SECRET.to_string())
        });

        Ok(Self {
            bind,
            db_path: PathBuf::from(
                get("OUTREACH_DB_PATH").unwrap_or_else(|| "./data/outreach.db".to_string()),
            ),
            cron_secret: secret("CRON_SECRET"),
            webhook_secret: secret("INBOUND_WEBHOOK_SECRET"),
            unsubscribe_secret,
            admin_token: secret("OUTREACH_ADMIN_TOKEN"),
            public_url: get("PUBLIC_URL").unwrap_or_else(|| "http://localhost:3000".to_string()),
            sender_name: get("OUTREACH_SENDER_NAME").unwrap_or_else(|| "Team".to_string()),
            from_email: get("OUTREACH_FROM_EMAIL")
                .unwrap_or_else(|| "outreach@example.com".to_string()),
            batch_size,
            mailer: mailer_from_lookup(&get)?,
        })
    }
}

/// Pick the mail provider from `OUTREACH_MAIL_PROVIDER`, or infer it from
/// which credentials are present.
fn mailer_from_lookup<F>(get: &F) -> Result<MailerConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let provider = match get("OUTREACH_MAIL_PROVIDER") {
        Some(p) => p.to_lowercase(),
        None if get("SMTP_HOST").is_some() => "smtp".to_string(),
        None if get("RESEND_API_KEY").is_some() => "resend".to_string(),
        None => {
            return Err(ConfigError::MissingRequired {
                key: "OUTREACH_MAIL_PROVIDER".into(),
                hint: "Set SMTP_HOST or RESEND_API_KEY, or OUTREACH_MAIL_PROVIDER=dry-run".into(),
            });
        }
    };

    match provider.as_str() {
        "smtp" => {
            let host = get("SMTP_HOST").ok_or_else(|| ConfigError::MissingEnvVar("SMTP_HOST".into()))?;
            let port = match get("SMTP_PORT") {
                Some(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
                    key: "SMTP_PORT".into(),
                    message: format!("{raw}: {e}"),
                })?,
                None => 587,
            };
            Ok(MailerConfig::Smtp(SmtpConfig {
                host,
                port,
                username: get("SMTP_USERNAME"),
                password: get("SMTP_PASSWORD").map(SecretString::from),
            }))
        }
        "resend" => {
            let api_key = get("RESEND_API_KEY")
                .ok_or_else(|| ConfigError::MissingEnvVar("RESEND_API_KEY".into()))?;
            Ok(MailerConfig::Resend(ResendConfig {
                api_key: SecretString::from(api_key),
                base_url: get("RESEND_BASE_URL")
                    .unwrap_or_else(|| DEFAULT_RESEND_BASE_URL.to_string()),
            }))
        }
        "dry-run" | "dryrun" | "none" => Ok(MailerConfig::DryRun),
        other => Err(ConfigError::InvalidValue {
            key: "OUTREACH_MAIL_PROVIDER".into(),
            message: format!("unknown provider {other} (expected smtp, resend, or dry-run)"),
        }),
    }
}
