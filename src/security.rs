//! Shared-secret checks and HMAC tokens.
//!
//! - cron trigger: exact match on a shared secret header
//! - inbound webhook: shared secret header, or hex HMAC-SHA256 of the raw body
//! - unsubscribe links: first 16 hex chars of HMAC-SHA256(lowercased email)

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const CRON_SECRET_HEADER: &str = "x-orbisy-cron-secret";
pub const WEBHOOK_SECRET_HEADER: &str = "x-webhook-secret";
pub const WEBHOOK_SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Length of the truncated unsubscribe token, in hex characters.
pub const UNSUBSCRIBE_TOKEN_LEN: usize = 16;

fn hmac_sha256_hex(key: &[u8], data: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    format!("{:x}", mac.finalize().into_bytes())
}

/// Byte-wise comparison whose running time does not depend on where the
/// inputs first differ.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Check the cron trigger secret. An unconfigured secret rejects everything.
pub fn verify_cron_secret(expected: Option<&SecretString>, provided: Option<&str>) -> bool {
    let Some(expected) = expected else {
        tracing::error!("CRON_SECRET not configured; rejecting worker trigger");
        return false;
    };
    match provided {
        Some(provided) => constant_time_eq(provided, expected.expose_secret()),
        None => false,
    }
}

/// Hex HMAC-SHA256 signature of a webhook body.
pub fn sign_webhook_body(secret: &str, body: &[u8]) -> String {
    hmac_sha256_hex(secret.as_bytes(), body)
}

/// Authenticate an inbound webhook.
///
/// A shared secret header, when present, is the only thing checked. Otherwise
/// the signature header must match the body HMAC. With no secret configured
/// every request is accepted (development mode) and a warning is logged.
pub fn verify_webhook(
    expected: Option<&SecretString>,
    secret_header: Option<&str>,
    signature_header: Option<&str>,
    body: &[u8],
) -> bool {
    let Some(expected) = expected else {
        tracing::warn!("INBOUND_WEBHOOK_SECRET not configured - webhook authentication disabled");
        return true;
    };
    let expected = expected.expose_secret();

    if let Some(secret) = secret_header {
        return constant_time_eq(secret, expected);
    }
    if let Some(signature) = signature_header {
        let computed = sign_webhook_body(expected, body);
        return constant_time_eq(&signature.to_ascii_lowercase(), &computed);
    }
    false
}

/// Check an `Authorization` header value against the console bearer token.
pub fn verify_bearer_token(expected: &SecretString, authorization: Option<&str>) -> bool {
    authorization
        .and_then(|h| h.strip_prefix("Bearer "))
        .is_some_and(|token| constant_time_eq(token.trim(), expected.expose_secret()))
}

/// Generates and verifies unsubscribe links for outbound email.
#[derive(Clone)]
pub struct UnsubscribeLinks {
    base_url: String,
    secret: SecretString,
}

impl UnsubscribeLinks {
    pub fn new(base_url: impl Into<String>, secret: SecretString) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret,
        }
    }

    /// Token for an address. Case-insensitive in the email.
    pub fn token(&self, email: &str) -> String {
        let mut token = hmac_sha256_hex(
            self.secret.expose_secret().as_bytes(),
            email.to_lowercase().as_bytes(),
        );
        token.truncate(UNSUBSCRIBE_TOKEN_LEN);
        token
    }

    pub fn verify(&self, email: &str, token: &str) -> bool {
        constant_time_eq(token, &self.token(email))
    }

    pub fn link(&self, email: &str) -> String {
        format!(
            "{}/api/outreach/unsubscribe?email={}&token={}",
            self.base_url,
            urlencoding::encode(email),
            self.token(email)
        )
    }

    /// Append the standard unsubscribe footer to a plain-text body.
    pub fn append_footer(&self, body: &str, email: &str) -> String {
        format!(
            "{body}\n\n---\n\nIf you'd like to stop receiving these emails, click here: {}",
            self.link(email)
        )
    }
}

impl std::fmt::Debug for UnsubscribeLinks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnsubscribeLinks")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}
