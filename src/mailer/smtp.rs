//! SMTP provider via lettre.
//!
//! lettre's `SmtpTransport` is blocking, so each send runs on the blocking
//! pool. The generated `Message-ID` header is returned as the provider id.

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};

use super::{Mailer, OutboundEmail, generate_message_id};
use crate::error::MailerError;

const PROVIDER: &str = "smtp";

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<SecretString>,
}

pub struct SmtpMailer {
    transport: SmtpTransport,
}

impl SmtpMailer {
    /// Port 465 uses implicit TLS, localhost is plaintext (mail catchers),
    /// everything else negotiates STARTTLS.
    pub fn new(config: SmtpConfig) -> Result<Self, MailerError> {
        let relay_err = |e: lettre::transport::smtp::Error| MailerError::Config {
            provider: PROVIDER.into(),
            reason: format!("SMTP relay error: {e}"),
        };

        let builder = if is_local(&config.host) {
            SmtpTransport::builder_dangerous(&config.host)
        } else if config.port == 465 {
            SmtpTransport::relay(&config.host).map_err(relay_err)?
        } else {
            SmtpTransport::starttls_relay(&config.host).map_err(relay_err)?
        };
        let mut builder = builder.port(config.port);

        if let Some(username) = config.username.filter(|u| !u.is_empty()) {
            let password = config
                .password
                .as_ref()
                .map(|p| p.expose_secret().to_string())
                .unwrap_or_default();
            builder = builder.credentials(Credentials::new(username, password));
        }

        tracing::debug!(host = %config.host, port = config.port, "SMTP transport configured");
        Ok(Self {
            transport: builder.build(),
        })
    }
}

fn is_local(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

fn parse_mailbox(address: &str) -> Result<Mailbox, MailerError> {
    address
        .parse()
        .map_err(|e: lettre::address::AddressError| MailerError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
}

/// Build the lettre message. Returns it with its `Message-ID`.
pub(crate) fn build_message(email: &OutboundEmail) -> Result<(Message, String), MailerError> {
    let message_id = generate_message_id(&email.from);

    let mut builder = Message::builder()
        .from(parse_mailbox(&email.from)?)
        .to(parse_mailbox(&email.to)?)
        .subject(email.subject.as_str())
        .message_id(Some(message_id.clone()))
        .header(ContentType::TEXT_PLAIN);

    if let Some(reply_to) = &email.reply_to {
        builder = builder.reply_to(parse_mailbox(reply_to)?);
    }

    let message = builder
        .body(email.text.clone())
        .map_err(|e| MailerError::Build(e.to_string()))?;
    Ok((message, message_id))
}

#[async_trait]
impl Mailer for SmtpMailer {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn send(&self, email: &OutboundEmail) -> Result<String, MailerError> {
        let (message, message_id) = build_message(email)?;
        let transport = self.transport.clone();

        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| MailerError::SendFailed {
                provider: PROVIDER.into(),
                reason: format!("send task failed: {e}"),
            })?
            .map_err(|e| MailerError::SendFailed {
                provider: PROVIDER.into(),
                reason: format!("SMTP send failed: {e}"),
            })?;

        tracing::info!(to = %email.to, message_id = %message_id, "Email sent via SMTP");
        Ok(message_id)
    }
}
