//! JSON error responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};

use crate::error::{CsvError, DatabaseError, Error, OutreachError};

/// `(status, {"error": ..., "details"?: ...})`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: String,
    details: Option<Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
            details: None,
        }
    }

    pub fn bad_request(error: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Unauthorized")
    }

    pub fn not_found(error: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, error)
    }

    pub fn with_details(mut self, details: impl Into<Value>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Replace the message of a 5xx error, keeping the cause in `details`.
    pub fn or_internal(mut self, error: &str) -> Self {
        if self.status.is_server_error() {
            self.error = error.to_string();
        }
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::Outreach(err) => match err {
                OutreachError::CampaignNotFound { .. } => Self::not_found("Campaign not found"),
                OutreachError::MessageNotFound { .. } => Self::not_found("Message not found"),
                OutreachError::LeadNotFound { .. } => Self::not_found(err.to_string()),
                OutreachError::NoSteps { .. } => Self::bad_request("Campaign has no steps"),
                OutreachError::Validation(msg) => Self::bad_request(msg),
                OutreachError::InvalidTransition { .. } => {
                    Self::new(StatusCode::CONFLICT, err.to_string())
                }
            },
            Error::Csv(CsvError::Rows(errors)) => {
                Self::bad_request("CSV parsing errors").with_details(errors)
            }
            Error::Csv(other) => {
                Self::bad_request("CSV parsing errors").with_details(vec![other.to_string()])
            }
            other => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
                .with_details(other.to_string()),
        }
    }
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        Error::from(e).into()
    }
}

impl From<CsvError> for ApiError {
    fn from(e: CsvError) -> Self {
        Error::from(e).into()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, details = ?self.details, "{}", self.error);
        }
        let body = match self.details {
            Some(details) => json!({ "error": self.error, "details": details }),
            None => json!({ "error": self.error }),
        };
        (self.status, Json(body)).into_response()
    }
}
