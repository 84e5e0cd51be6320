//! Error types for the outreach engine.

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Mailer error: {0}")]
    Mailer(#[from] MailerError),

    #[error("Outreach error: {0}")]
    Outreach(#[from] OutreachError),

    #[error("CSV error: {0}")]
    Csv(#[from] CsvError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Outbound email provider errors.
#[derive(Debug, thiserror::Error)]
pub enum MailerError {
    #[error("Mailer {provider} misconfigured: {reason}")]
    Config { provider: String, reason: String },

    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to build email: {0}")]
    Build(String),

    #[error("Provider {provider} rejected the send: {reason}")]
    SendFailed { provider: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Business-rule errors raised by the enrollment, worker, and reply services.
#[derive(Debug, thiserror::Error)]
pub enum OutreachError {
    #[error("Campaign not found: {id}")]
    CampaignNotFound { id: Uuid },

    #[error("Campaign {id} has no steps")]
    NoSteps { id: Uuid },

    #[error("Lead not found: {id}")]
    LeadNotFound { id: String },

    #[error("Message not found: {id}")]
    MessageNotFound { id: Uuid },

    #[error("{entity} {id} cannot transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        id: Uuid,
        from: String,
        to: String,
    },

    #[error("Validation failed: {0}")]
    Validation(String),
}

/// Lead CSV import/export errors.
#[derive(Debug, thiserror::Error)]
pub enum CsvError {
    #[error("CSV is empty")]
    Empty,

    #[error("Missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),

    #[error("CSV parsing errors: {} row(s) rejected", .0.len())]
    Rows(Vec<String>),

    #[error("CSV format error: {0}")]
    Format(#[from] csv::Error),

    #[error("CSV write error: {0}")]
    Write(String),
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
