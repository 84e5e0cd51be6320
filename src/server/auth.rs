//! Console authentication.
//!
//! Console routes take `RequireAdmin` as their first extractor. With a
//! configured token the request needs `Authorization: Bearer <token>`;
//! without one every request passes.

use axum::extract::FromRequestParts;
use axum::http::header;
use axum::http::request::Parts;

use super::{ApiError, AppState};
use crate::security::verify_bearer_token;

pub struct RequireAdmin;

impl FromRequestParts<AppState> for RequireAdmin {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Some(expected) = &state.admin_token else {
            return Ok(RequireAdmin);
        };
        let authorization = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if verify_bearer_token(expected, authorization) {
            Ok(RequireAdmin)
        } else {
            tracing::warn!(path = %parts.uri.path(), "Rejected console request");
            Err(ApiError::unauthorized())
        }
    }
}
