//! Resend HTTP API provider.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::{Mailer, OutboundEmail};
use crate::error::MailerError;

const PROVIDER: &str = "resend";

pub const DEFAULT_RESEND_BASE_URL: &str = "https://api.resend.com";

#[derive(Debug, Clone)]
pub struct ResendConfig {
    pub api_key: SecretString,
    pub base_url: String,
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to: Option<&'a str>,
    subject: &'a str,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    id: String,
}

pub struct ResendMailer {
    config: ResendConfig,
    client: Client,
}

impl ResendMailer {
    pub fn new(config: ResendConfig) -> Result<Self, MailerError> {
        if config.api_key.expose_secret().trim().is_empty() {
            return Err(MailerError::Config {
                provider: PROVIDER.into(),
                reason: "RESEND_API_KEY is empty".into(),
            });
        }
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| MailerError::Http(e.to_string()))?;
        debug!(base_url = %config.base_url, "Created ResendMailer");
        Ok(Self { config, client })
    }
}

#[async_trait]
impl Mailer for ResendMailer {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn send(&self, email: &OutboundEmail) -> Result<String, MailerError> {
        let url = format!("{}/emails", self.config.base_url.trim_end_matches('/'));
        let request = SendRequest {
            from: &email.from,
            to: [&email.to],
            reply_to: email.reply_to.as_deref(),
            subject: &email.subject,
            text: &email.text,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(self.config.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| MailerError::Http(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let body: SendResponse = response
                .json()
                .await
                .map_err(|e| MailerError::Http(format!("invalid response body: {e}")))?;
            debug!(to = %email.to, id = %body.id, "Email accepted by Resend");
            Ok(body.id)
        } else {
            let error_text = response.text().await.unwrap_or_default();
            error!(%status, "Resend API error: {error_text}");
            Err(MailerError::SendFailed {
                provider: PROVIDER.into(),
                reason: format!("{status}: {error_text}"),
            })
        }
    }
}
