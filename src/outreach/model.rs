//! Outreach data model: leads, campaigns, enrollments, messages, replies.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sentiment::Sentiment;

/// Default lead score when none is supplied.
pub const DEFAULT_LEAD_SCORE: i64 = 50;

// ── Status enums ────────────────────────────────────────────────────

/// Funnel label for a lead. Not a strict progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeadStage {
    New,
    Contacted,
    Replied,
    Booked,
    Won,
    Lost,
}

impl LeadStage {
    pub const ALL: [LeadStage; 6] = [
        Self::New,
        Self::Contacted,
        Self::Replied,
        Self::Booked,
        Self::Won,
        Self::Lost,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Contacted => "CONTACTED",
            Self::Replied => "REPLIED",
            Self::Booked => "BOOKED",
            Self::Won => "WON",
            Self::Lost => "LOST",
        }
    }

    /// Stage after a successful send. Only NEW moves.
    pub fn after_send(self) -> Self {
        match self {
            Self::New => Self::Contacted,
            other => other,
        }
    }
}

/// Campaign lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CampaignStatus {
    Draft,
    Running,
    Paused,
    Completed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
        }
    }
}

/// Binding of one lead to one campaign's sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnrollmentStatus {
    Active,
    Completed,
    Stopped,
}

impl EnrollmentStatus {
    pub const ALL: [EnrollmentStatus; 3] = [Self::Active, Self::Completed, Self::Stopped];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Stopped => "STOPPED",
        }
    }

    pub fn can_transition_to(&self, target: EnrollmentStatus) -> bool {
        use EnrollmentStatus::*;
        matches!((self, target), (Active, Completed) | (Active, Stopped))
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }

    /// States from which `target` may be entered.
    pub fn predecessors(target: EnrollmentStatus) -> Vec<EnrollmentStatus> {
        Self::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(target))
            .collect()
    }
}

/// Lifecycle of one scheduled touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Scheduled,
    Sent,
    Delivered,
    Replied,
    Failed,
    Canceled,
}

impl MessageStatus {
    pub const ALL: [MessageStatus; 6] = [
        Self::Scheduled,
        Self::Sent,
        Self::Delivered,
        Self::Replied,
        Self::Failed,
        Self::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "SCHEDULED",
            Self::Sent => "SENT",
            Self::Delivered => "DELIVERED",
            Self::Replied => "REPLIED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        }
    }

    pub fn can_transition_to(&self, target: MessageStatus) -> bool {
        use MessageStatus::*;

        matches!(
            (self, target),
            // From Scheduled
            (Scheduled, Sent) | (Scheduled, Failed) | (Scheduled, Canceled) |
            // After delivery
            (Sent, Delivered) | (Sent, Replied) | (Delivered, Replied) |
            // Manual reschedule only
            (Failed, Scheduled)
        )
    }

    /// States from which `target` may be entered.
    pub fn predecessors(target: MessageStatus) -> Vec<MessageStatus> {
        Self::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(target))
            .collect()
    }

    /// Whether the message actually left the building.
    pub fn was_sent(&self) -> bool {
        matches!(self, Self::Sent | Self::Delivered | Self::Replied)
    }
}

macro_rules! impl_status_strings {
    ($ty:ty, $label:literal) => {
        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = String;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::ALL_VALUES
                    .iter()
                    .copied()
                    .find(|v| v.as_str() == s)
                    .ok_or_else(|| format!("Unknown {}: {}", $label, s))
            }
        }
    };
}

impl LeadStage {
    const ALL_VALUES: &'static [Self] = &Self::ALL;
}
impl CampaignStatus {
    const ALL_VALUES: &'static [Self] = &[Self::Draft, Self::Running, Self::Paused, Self::Completed];
}
impl EnrollmentStatus {
    const ALL_VALUES: &'static [Self] = &Self::ALL;
}
impl MessageStatus {
    const ALL_VALUES: &'static [Self] = &Self::ALL;
}

impl_status_strings!(LeadStage, "lead stage");
impl_status_strings!(CampaignStatus, "campaign status");
impl_status_strings!(EnrollmentStatus, "enrollment status");
impl_status_strings!(MessageStatus, "message status");

// ── Lead ────────────────────────────────────────────────────────────

/// A prospective contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lead {
    pub id: Uuid,
    pub company: String,
    pub contact_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Always stored lowercased.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub industry: Option<String>,
    pub score: i64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    pub stage: LeadStage,
    pub do_not_contact: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsubscribed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_touch_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Lead {
    pub fn new(company: impl Into<String>, contact_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            company: company.into(),
            contact_name: contact_name.into(),
            role: None,
            email: None,
            phone: None,
            website: None,
            city: None,
            industry: None,
            score: DEFAULT_LEAD_SCORE,
            tags: Vec::new(),
            notes: None,
            stage: LeadStage::New,
            do_not_contact: false,
            unsubscribed_at: None,
            last_touch_at: None,
            last_activity: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Builder: set email (trimmed, lowercased).
    pub fn with_email(mut self, email: impl AsRef<str>) -> Self {
        self.email = normalize_email(email.as_ref());
        self
    }

    pub fn with_city(mut self, city: impl Into<String>) -> Self {
        self.city = Some(city.into());
        self
    }

    pub fn with_industry(mut self, industry: impl Into<String>) -> Self {
        self.industry = Some(industry.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_score(mut self, score: i64) -> Self {
        self.score = score;
        self
    }

    pub fn with_do_not_contact(mut self) -> Self {
        self.do_not_contact = true;
        self
    }

    /// True if the lead must never receive another message.
    pub fn is_suppressed(&self) -> bool {
        self.do_not_contact || self.unsubscribed_at.is_some()
    }
}

/// Trim and lowercase an address; empty input yields `None`.
pub fn normalize_email(email: &str) -> Option<String> {
    let trimmed = email.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

static EMAIL_SHAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email regex is valid"));

/// Loose `local@domain.tld` shape check.
pub fn is_valid_email(email: &str) -> bool {
    EMAIL_SHAPE.is_match(email)
}

// ── Campaign ────────────────────────────────────────────────────────

/// Audience selection rules. Every present rule must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudienceRule {
    /// Case-insensitive substring of the lead's industry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub industry: Option<String>,
    /// Case-insensitive substring of the lead's city.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo_contains: Option<String>,
    /// Minimum lead score, inclusive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_score: Option<i64>,
}

/// One templated position in a campaign sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignStep {
    pub id: Uuid,
    pub campaign_id: Uuid,
    /// 0-based order.
    pub step_index: i64,
    /// Days after the previous step's send (after enrollment for step 0).
    pub day_offset: i64,
    pub subject_template: String,
    pub body_template: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    pub channel: String,
    pub from_mailbox: String,
    /// Maximum sends per worker run for this campaign.
    pub daily_limit: i64,
    pub status: CampaignStatus,
    #[serde(default)]
    pub audience: AudienceRule,
    /// Ordered by `step_index`.
    #[serde(default)]
    pub steps: Vec<CampaignStep>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    pub fn new(name: impl Into<String>, from_mailbox: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            channel: "email".to_string(),
            from_mailbox: from_mailbox.into(),
            daily_limit: 50,
            status: CampaignStatus::Draft,
            audience: AudienceRule::default(),
            steps: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_daily_limit(mut self, limit: i64) -> Self {
        self.daily_limit = limit;
        self
    }

    pub fn with_status(mut self, status: CampaignStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_audience(mut self, audience: AudienceRule) -> Self {
        self.audience = audience;
        self
    }

    /// Builder: append a step at the next index.
    pub fn with_step(
        mut self,
        day_offset: i64,
        subject_template: impl Into<String>,
        body_template: impl Into<String>,
    ) -> Self {
        let step_index = self.steps.len() as i64;
        self.steps.push(CampaignStep {
            id: Uuid::new_v4(),
            campaign_id: self.id,
            step_index,
            day_offset,
            subject_template: subject_template.into(),
            body_template: body_template.into(),
        });
        self
    }

    pub fn first_step(&self) -> Option<&CampaignStep> {
        self.steps.iter().min_by_key(|s| s.step_index)
    }

    pub fn step(&self, step_index: i64) -> Option<&CampaignStep> {
        self.steps.iter().find(|s| s.step_index == step_index)
    }

    /// The step that follows `step_index`, if any.
    pub fn step_after(&self, step_index: i64) -> Option<&CampaignStep> {
        self.step(step_index + 1)
    }
}

// ── Enrollment ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrollment {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub campaign_id: Uuid,
    pub status: EnrollmentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_reason: Option<String>,
    pub enrolled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Enrollment {
    pub fn new(lead_id: Uuid, campaign_id: Uuid, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            lead_id,
            campaign_id,
            status: EnrollmentStatus::Active,
            stopped_reason: None,
            enrolled_at: at,
            updated_at: at,
        }
    }
}

// ── Message ─────────────────────────────────────────────────────────

/// One scheduled or sent touch. Subject and body are frozen at schedule time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub lead_id: Uuid,
    pub campaign_id: Uuid,
    pub step_id: Uuid,
    pub step_index: i64,
    pub scheduled_for: DateTime<Utc>,
    pub status: MessageStatus,
    pub subject_rendered: String,
    pub body_rendered: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn scheduled(
        lead_id: Uuid,
        step: &CampaignStep,
        scheduled_for: DateTime<Utc>,
        subject_rendered: String,
        body_rendered: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            lead_id,
            campaign_id: step.campaign_id,
            step_id: step.id,
            step_index: step.step_index,
            scheduled_for,
            status: MessageStatus::Scheduled,
            subject_rendered,
            body_rendered,
            provider_message_id: None,
            error: None,
            sent_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ── Reply ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub id: Uuid,
    pub lead_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    pub received_at: DateTime<Utc>,
    pub from_email: String,
    pub subject: String,
    pub body: String,
    pub sentiment: Sentiment,
    /// Provider payload, kept verbatim for audit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

// ── Lead selection ──────────────────────────────────────────────────

/// Lead selection for enrollment. Present fields are ANDed; the store always
/// adds the contactability filter on top.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeadQuery {
    pub ids: Option<Vec<Uuid>>,
    pub industry_contains: Option<String>,
    pub city_contains: Option<String>,
    pub min_score: Option<i64>,
}

impl LeadQuery {
    pub fn by_ids(ids: impl Into<Vec<Uuid>>) -> Self {
        Self {
            ids: Some(ids.into()),
            ..Default::default()
        }
    }

    /// Blank strings and non-positive scores count as "no rule".
    pub fn for_audience(rule: &AudienceRule) -> Self {
        let non_blank = |s: &Option<String>| {
            s.as_ref()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            ids: None,
            industry_contains: non_blank(&rule.industry),
            city_contains: non_blank(&rule.geo_contains),
            min_score: rule.min_score.filter(|s| *s > 0),
        }
    }
}
