//! Route handlers.

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{Html, IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use super::{ApiError, AppState, RequireAdmin};
use crate::outreach::{
    self, EnrollmentService, InboundEmail, NewCampaign, ReplyHandler, ReplyOutcome,
    UnsubscribeService,
};
use crate::outreach::model::normalize_email;
use crate::security::{
    CRON_SECRET_HEADER, WEBHOOK_SECRET_HEADER, WEBHOOK_SIGNATURE_HEADER, verify_cron_secret,
    verify_webhook,
};

type ApiResult = Result<Response, ApiError>;

/// `{"success": true, ...body}`.
fn success(body: impl Serialize) -> Json<Value> {
    Json(match serde_json::to_value(body) {
        Ok(Value::Object(mut map)) => {
            map.insert("success".into(), Value::Bool(true));
            Value::Object(map)
        }
        Ok(other) => json!({ "success": true, "result": other }),
        Err(_) => json!({ "success": true }),
    })
}

fn parse_id(raw: &str, what: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::bad_request(format!("Invalid {what} ID")))
}

/// Decode an optional JSON body. Empty bodies yield the default.
fn optional_json<T: serde::de::DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError::bad_request("Invalid JSON body").with_details(e.to_string()))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

pub(super) async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "outreach-engine",
    }))
}

// ── Worker ──────────────────────────────────────────────────────────────

pub(super) async fn send_due(State(state): State<AppState>, headers: HeaderMap) -> ApiResult {
    if !verify_cron_secret(
        state.cron_secret.as_ref(),
        header_str(&headers, CRON_SECRET_HEADER),
    ) {
        return Err(ApiError::unauthorized());
    }

    let report = state
        .worker()
        .run()
        .await
        .map_err(|e| ApiError::from(e).or_internal("Worker failed"))?;
    Ok(success(report).into_response())
}

// ── Webhooks ────────────────────────────────────────────────────────────

pub(super) async fn inbound_email(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    if !verify_webhook(
        state.webhook_secret.as_ref(),
        header_str(&headers, WEBHOOK_SECRET_HEADER),
        header_str(&headers, WEBHOOK_SIGNATURE_HEADER),
        &body,
    ) {
        tracing::warn!("Rejected inbound webhook with bad credentials");
        return Err(ApiError::unauthorized());
    }

    let inbound: InboundEmail = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request("Invalid JSON body").with_details(e.to_string()))?;

    let outcome = ReplyHandler::new(state.db.clone())
        .handle(&inbound)
        .await
        .map_err(|e| ApiError::from(e).or_internal("Failed to process inbound email"))?;

    Ok(match outcome {
        ReplyOutcome::NoMatchingLead => success(json!({ "message": "No matching lead found" })),
        ReplyOutcome::Processed(processed) => success(json!({ "reply": processed })),
    }
    .into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct TestInboundRequest {
    #[serde(default)]
    email: String,
    #[serde(default)]
    subject: String,
    #[serde(default)]
    body: String,
    in_reply_to: Option<String>,
}

pub(super) async fn test_inbound(
    _admin: RequireAdmin,
    State(state): State<AppState>,
    Json(req): Json<TestInboundRequest>,
) -> ApiResult {
    let email = normalize_email(&req.email)
        .filter(|_| !req.subject.trim().is_empty() && !req.body.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("Missing required fields: email, subject, body"))?;

    let lead = state
        .db
        .find_lead_by_email(&email)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("No lead found with email: {email}")))?;

    let inbound = InboundEmail {
        from: email,
        subject: req.subject,
        body: req.body,
        in_reply_to: req.in_reply_to,
        raw: Some(json!({ "test": true })),
        ..Default::default()
    };
    let processed = ReplyHandler::new(state.db.clone())
        .handle_for_lead(&lead, &inbound)
        .await
        .map_err(|e| ApiError::from(e).or_internal("Failed to process test email"))?;

    Ok(success(json!({ "reply": processed })).into_response())
}

// ── Unsubscribe ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct UnsubscribeLinkParams {
    email: Option<String>,
    token: Option<String>,
}

fn unsubscribe_page(status: StatusCode, title: &str, message: &str) -> Response {
    let page = format!(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>{title}</title></head>\n\
         <body style=\"font-family: sans-serif; max-width: 600px; margin: 50px auto; text-align: center;\">\n\
         <h1>{title}</h1>\n<p>{message}</p>\n</body>\n</html>\n"
    );
    (status, Html(page)).into_response()
}

/// Link target from the email footer. Always answers with an HTML page.
pub(super) async fn unsubscribe_link(
    State(state): State<AppState>,
    Query(params): Query<UnsubscribeLinkParams>,
) -> Response {
    let (Some(email), Some(token)) = (
        params.email.filter(|e| !e.trim().is_empty()),
        params.token.filter(|t| !t.trim().is_empty()),
    ) else {
        return unsubscribe_page(
            StatusCode::BAD_REQUEST,
            "Invalid Link",
            "This unsubscribe link is missing required information.",
        );
    };

    if !state.links.verify(email.trim(), token.trim()) {
        return unsubscribe_page(
            StatusCode::BAD_REQUEST,
            "Invalid Token",
            "This unsubscribe link is invalid or has expired.",
        );
    }

    match UnsubscribeService::new(state.db.clone())
        .unsubscribe(&email, Some("Unsubscribe link"))
        .await
    {
        Ok(_) => unsubscribe_page(
            StatusCode::OK,
            "Unsubscribed",
            "You have been unsubscribed and will not receive further emails from us.",
        ),
        Err(e) => {
            tracing::error!(error = %e, "Unsubscribe via link failed");
            unsubscribe_page(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error",
                "Something went wrong. Please try again later.",
            )
        }
    }
}

#[derive(Deserialize)]
pub(super) struct UnsubscribeRequest {
    #[serde(default)]
    email: String,
    reason: Option<String>,
}

pub(super) async fn unsubscribe_request(
    _admin: RequireAdmin,
    State(state): State<AppState>,
    Json(req): Json<UnsubscribeRequest>,
) -> ApiResult {
    let outcome = UnsubscribeService::new(state.db.clone())
        .unsubscribe(&req.email, req.reason.as_deref().or(Some("Manual")))
        .await?;
    Ok(success(outcome).into_response())
}

// ── Campaigns ───────────────────────────────────────────────────────────

pub(super) async fn create_campaign(
    _admin: RequireAdmin,
    State(state): State<AppState>,
    Json(req): Json<NewCampaign>,
) -> ApiResult {
    let (campaign, warnings) =
        outreach::create_campaign(state.db.as_ref(), req, &state.from_email).await?;
    Ok((
        StatusCode::CREATED,
        success(json!({ "campaign": campaign, "warnings": warnings })),
    )
        .into_response())
}

pub(super) async fn get_campaign(
    _admin: RequireAdmin,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult {
    let id = parse_id(&id, "campaign")?;
    let campaign = state
        .db
        .get_campaign(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Campaign not found"))?;
    let metrics = outreach::metrics::campaign_metrics(state.db.as_ref(), id).await?;
    Ok(Json(json!({ "campaign": campaign, "metrics": metrics })).into_response())
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub(super) struct EnrollRequest {
    lead_ids: Option<Vec<String>>,
}

pub(super) async fn enroll(
    _admin: RequireAdmin,
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult {
    let campaign_id = parse_id(&id, "campaign")?;
    let req: EnrollRequest = optional_json(&body)?;
    let lead_ids = req
        .lead_ids
        .map(|ids| {
            ids.iter()
                .map(|raw| parse_id(raw, "lead"))
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?;

    let report = EnrollmentService::new(state.db.clone(), state.sender_name.clone())
        .enroll(campaign_id, lead_ids)
        .await?;
    Ok(success(report).into_response())
}

// ── Leads ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct ImportRequest {
    #[serde(default)]
    csv: String,
}

pub(super) async fn import_csv(
    _admin: RequireAdmin,
    State(state): State<AppState>,
    Json(req): Json<ImportRequest>,
) -> ApiResult {
    if req.csv.trim().is_empty() {
        return Err(ApiError::bad_request("CSV data is required"));
    }
    let report = outreach::import_leads_csv(state.db.as_ref(), &req.csv).await?;
    Ok(success(report).into_response())
}

pub(super) async fn export_csv(_admin: RequireAdmin, State(state): State<AppState>) -> ApiResult {
    let leads = state.db.list_leads().await?;
    let csv = outreach::export_leads_csv(&leads)?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (header::CONTENT_DISPOSITION, "attachment; filename=leads.csv"),
        ],
        csv,
    )
        .into_response())
}

// ── Messages ────────────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub(super) struct RescheduleRequest {
    scheduled_for: Option<DateTime<Utc>>,
}

pub(super) async fn reschedule(
    _admin: RequireAdmin,
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult {
    let id = parse_id(&id, "message")?;
    let req: RescheduleRequest = optional_json(&body)?;
    let at = req.scheduled_for.unwrap_or_else(Utc::now);
    let message = outreach::reschedule_failed(state.db.as_ref(), id, at).await?;
    Ok(success(json!({ "message": message })).into_response())
}

// ── Metrics ─────────────────────────────────────────────────────────────

pub(super) async fn dashboard(_admin: RequireAdmin, State(state): State<AppState>) -> ApiResult {
    let metrics = outreach::metrics::dashboard_metrics(state.db.as_ref()).await?;
    let stages = outreach::metrics::lead_stage_distribution(state.db.as_ref()).await?;

    let mut body = serde_json::to_value(metrics).unwrap_or_else(|_| json!({}));
    if let Some(map) = body.as_object_mut() {
        map.insert("stageDistribution".into(), json!(stages));
    }
    Ok(Json(body).into_response())
}
