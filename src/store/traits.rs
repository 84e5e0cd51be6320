//! Unified `Database` trait: single async interface for all persistence.
//!
//! Status-changing methods are compare-and-set: they only touch rows whose
//! current status is a valid predecessor of the target and report whether a
//! row changed. Callers treat `false` as "someone else got there first".

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::outreach::model::{
    Campaign, Enrollment, EnrollmentStatus, Lead, LeadQuery, LeadStage, Message, MessageStatus,
    Reply,
};
use crate::sentiment::Sentiment;

/// Raw per-campaign counts; rates are derived in `outreach::metrics`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CampaignCounts {
    /// Distinct leads enrolled in the campaign.
    pub leads: u64,
    pub booked_leads: u64,
    pub enrollments: u64,
    pub messages_by_status: HashMap<MessageStatus, u64>,
    pub replies_by_sentiment: HashMap<Sentiment, u64>,
}

/// Raw dashboard counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DashboardCounts {
    pub total_leads: u64,
    pub active_leads: u64,
    pub replied_leads: u64,
    pub booked_leads: u64,
    pub running_campaigns: u64,
    pub active_enrollments: u64,
    pub scheduled_messages: u64,
    pub messages_sent_since: u64,
    pub replies_since: u64,
}

/// Backend-agnostic database trait covering the whole outreach model.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Leads ───────────────────────────────────────────────────────

    async fn insert_lead(&self, lead: &Lead) -> Result<(), DatabaseError>;

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, DatabaseError>;

    /// Case-insensitive lookup by email.
    async fn find_lead_by_email(&self, email: &str) -> Result<Option<Lead>, DatabaseError>;

    /// All leads, newest first.
    async fn list_leads(&self) -> Result<Vec<Lead>, DatabaseError>;

    /// Leads matching `query` that may be contacted: not do-not-contact, not
    /// unsubscribed, with an email, and not on the unsubscribe list.
    async fn find_contactable_leads(&self, query: &LeadQuery) -> Result<Vec<Lead>, DatabaseError>;

    /// Record a send: bump `last_touch_at`/`last_activity`, NEW → CONTACTED.
    async fn record_lead_sent(
        &self,
        id: Uuid,
        activity: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Record a reply: stage → REPLIED and bump touch/activity.
    async fn record_lead_replied(
        &self,
        id: Uuid,
        activity: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    /// Mark every lead with this email do-not-contact and unsubscribed.
    /// Returns the affected lead ids.
    async fn suppress_leads_by_email(
        &self,
        email: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, DatabaseError>;

    // ── Campaigns ───────────────────────────────────────────────────

    /// Insert a campaign together with its steps.
    async fn insert_campaign(&self, campaign: &Campaign) -> Result<(), DatabaseError>;

    /// Campaign with steps ordered by `step_index`.
    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>, DatabaseError>;

    // ── Enrollments ─────────────────────────────────────────────────

    /// Insert unless the (lead, campaign) pair already exists.
    /// Returns `true` if a row was created.
    async fn insert_enrollment_if_absent(
        &self,
        enrollment: &Enrollment,
    ) -> Result<bool, DatabaseError>;

    async fn get_enrollment(
        &self,
        lead_id: Uuid,
        campaign_id: Uuid,
    ) -> Result<Option<Enrollment>, DatabaseError>;

    async fn delete_enrollment(&self, id: Uuid) -> Result<(), DatabaseError>;

    async fn active_enrollments_for_lead(
        &self,
        lead_id: Uuid,
    ) -> Result<Vec<Enrollment>, DatabaseError>;

    /// CAS status change. `reason` is stored as `stopped_reason`.
    async fn transition_enrollment(
        &self,
        id: Uuid,
        to: EnrollmentStatus,
        reason: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(&self, message: &Message) -> Result<(), DatabaseError>;

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, DatabaseError>;

    /// SCHEDULED messages with `scheduled_for <= now`, earliest first.
    async fn due_messages(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Message>, DatabaseError>;

    /// CAS SCHEDULED → SENT with provider id and `sent_at`.
    async fn mark_message_sent(
        &self,
        id: Uuid,
        provider_message_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// CAS status change. `error` is stored when given.
    async fn transition_message(
        &self,
        id: Uuid,
        to: MessageStatus,
        error: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    /// Cancel SCHEDULED messages of a lead, optionally limited to one campaign.
    /// Returns the number canceled.
    async fn cancel_scheduled_messages(
        &self,
        lead_id: Uuid,
        campaign_id: Option<Uuid>,
        reason: &str,
    ) -> Result<u64, DatabaseError>;

    /// Message of this lead carrying the given provider id.
    async fn find_message_by_provider_id(
        &self,
        lead_id: Uuid,
        provider_message_id: &str,
    ) -> Result<Option<Message>, DatabaseError>;

    /// Most recent SENT or DELIVERED message of a lead.
    async fn latest_sent_message(&self, lead_id: Uuid) -> Result<Option<Message>, DatabaseError>;

    /// CAS FAILED → SCHEDULED at a new time, clearing the error.
    async fn reschedule_message(
        &self,
        id: Uuid,
        scheduled_for: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// All messages of a lead, by `scheduled_for`.
    async fn messages_for_lead(&self, lead_id: Uuid) -> Result<Vec<Message>, DatabaseError>;

    // ── Replies ─────────────────────────────────────────────────────

    async fn insert_reply(&self, reply: &Reply) -> Result<(), DatabaseError>;

    async fn replies_for_lead(&self, lead_id: Uuid) -> Result<Vec<Reply>, DatabaseError>;

    // ── Unsubscribes ────────────────────────────────────────────────

    /// Upsert a suppression entry (email lowercased).
    async fn add_unsubscribe(
        &self,
        email: &str,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    async fn is_unsubscribed(&self, email: &str) -> Result<bool, DatabaseError>;

    // ── Metrics ─────────────────────────────────────────────────────

    async fn campaign_counts(&self, campaign_id: Uuid) -> Result<CampaignCounts, DatabaseError>;

    /// Dashboard counts. Sends are counted from `sent_since`, replies from
    /// `replies_since`.
    async fn dashboard_counts(
        &self,
        sent_since: DateTime<Utc>,
        replies_since: DateTime<Utc>,
    ) -> Result<DashboardCounts, DatabaseError>;

    async fn lead_stage_distribution(&self) -> Result<HashMap<LeadStage, u64>, DatabaseError>;
}
