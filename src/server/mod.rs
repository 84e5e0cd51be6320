//! Axum HTTP surface: cron trigger, webhooks, unsubscribe links, and the
//! console API.

mod auth;
mod error;
mod handlers;

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use secrecy::SecretString;
use tower_http::trace::TraceLayer;

use crate::config::OutreachConfig;
use crate::mailer::Mailer;
use crate::outreach::SendWorker;
use crate::security::UnsubscribeLinks;
use crate::store::Database;

pub use auth::RequireAdmin;
pub use error::ApiError;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<dyn Database>,
    pub mailer: Arc<dyn Mailer>,
    pub links: UnsubscribeLinks,
    pub cron_secret: Option<SecretString>,
    pub webhook_secret: Option<SecretString>,
    /// Console bearer token. `None` leaves console routes open.
    pub admin_token: Option<SecretString>,
    pub sender_name: String,
    /// Default `fromMailbox` for new campaigns.
    pub from_email: String,
    pub batch_size: usize,
}

impl AppState {
    pub fn new(config: &OutreachConfig, db: Arc<dyn Database>, mailer: Arc<dyn Mailer>) -> Self {
        Self {
            db,
            mailer,
            links: UnsubscribeLinks::new(&config.public_url, config.unsubscribe_secret.clone()),
            cron_secret: config.cron_secret.clone(),
            webhook_secret: config.webhook_secret.clone(),
            admin_token: config.admin_token.clone(),
            sender_name: config.sender_name.clone(),
            from_email: config.from_email.clone(),
            batch_size: config.batch_size,
        }
    }

    pub fn worker(&self) -> SendWorker {
        SendWorker::new(
            Arc::clone(&self.db),
            Arc::clone(&self.mailer),
            self.links.clone(),
            self.sender_name.clone(),
            self.batch_size,
        )
    }
}

/// Build the router with every outreach route.
pub fn outreach_routes(state: AppState) -> Router {
    if state.admin_token.is_none() {
        tracing::warn!("OUTREACH_ADMIN_TOKEN not set - console routes are unauthenticated");
    }

    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/outreach/worker/send-due", post(handlers::send_due))
        .route(
            "/api/outreach/webhooks/inbound-email",
            post(handlers::inbound_email),
        )
        .route(
            "/api/outreach/webhooks/test-inbound",
            post(handlers::test_inbound),
        )
        .route(
            "/api/outreach/unsubscribe",
            get(handlers::unsubscribe_link).post(handlers::unsubscribe_request),
        )
        .route("/api/outreach/campaigns", post(handlers::create_campaign))
        .route("/api/outreach/campaigns/{id}", get(handlers::get_campaign))
        .route("/api/outreach/campaigns/{id}/enroll", post(handlers::enroll))
        .route("/api/outreach/leads/import-csv", post(handlers::import_csv))
        .route("/api/outreach/leads/export", get(handlers::export_csv))
        .route(
            "/api/outreach/messages/{id}/reschedule",
            post(handlers::reschedule),
        )
        .route("/api/outreach/metrics/dashboard", get(handlers::dashboard))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
