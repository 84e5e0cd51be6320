//! Inbound reply handling: attribute, classify, persist, then stop the
//! lead's sequences.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{OutreachError, Result};
use crate::outreach::model::{EnrollmentStatus, Lead, Message, MessageStatus, Reply, normalize_email};
use crate::outreach::unsubscribe::suppress_email;
use crate::sentiment::{Sentiment, classify_sentiment, has_opt_out_keyword};
use crate::store::Database;

pub const REPLY_STOP_REASON: &str = "Lead replied to campaign";
pub const REPLY_CANCEL_REASON: &str = "Canceled due to reply";
const REPLY_UNSUBSCRIBE_REASON: &str = "Opt-out reply";

/// Inbound email as posted by the mail provider's webhook.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEmail {
    #[serde(default)]
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedReply {
    pub reply_id: Uuid,
    pub lead_id: Uuid,
    pub sentiment: Sentiment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    pub unsubscribed: bool,
    pub stopped_enrollments: usize,
    pub canceled_messages: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// Sender is not a known lead. Not an error.
    NoMatchingLead,
    Processed(ProcessedReply),
}

/// Both the bare and `<...>` forms of a Message-ID, original first.
fn provider_id_forms(id: &str) -> Vec<String> {
    let id = id.trim();
    let bare = id.trim_start_matches('<').trim_end_matches('>');
    let mut forms = vec![id.to_string()];
    for alt in [bare.to_string(), format!("<{bare}>")] {
        if !forms.contains(&alt) {
            forms.push(alt);
        }
    }
    forms
}

pub struct ReplyHandler {
    db: Arc<dyn Database>,
}

impl ReplyHandler {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Look the sender up by email and process the reply.
    pub async fn handle(&self, inbound: &InboundEmail) -> Result<ReplyOutcome> {
        let from = normalize_email(&inbound.from)
            .ok_or_else(|| OutreachError::Validation("Missing from address".into()))?;

        match self.db.find_lead_by_email(&from).await? {
            Some(lead) => Ok(ReplyOutcome::Processed(self.handle_for_lead(&lead, inbound).await?)),
            None => {
                info!(from = %from, "No lead found for inbound email");
                Ok(ReplyOutcome::NoMatchingLead)
            }
        }
    }

    /// Process a reply already attributed to `lead`.
    pub async fn handle_for_lead(&self, lead: &Lead, inbound: &InboundEmail) -> Result<ProcessedReply> {
        let now = Utc::now();
        let related = self.related_message(lead.id, inbound.in_reply_to.as_deref()).await?;
        let sentiment = classify_sentiment(&inbound.body, &inbound.subject);

        let reply = Reply {
            id: Uuid::new_v4(),
            lead_id: lead.id,
            campaign_id: related.as_ref().map(|m| m.campaign_id),
            message_id: related.as_ref().map(|m| m.id),
            received_at: now,
            from_email: inbound.from.trim().to_string(),
            subject: inbound.subject.clone(),
            body: inbound.body.clone(),
            sentiment,
            raw: inbound
                .raw
                .clone()
                .or_else(|| serde_json::to_value(inbound).ok()),
        };
        self.db.insert_reply(&reply).await?;

        self.db
            .record_lead_replied(lead.id, &format!("Replied: {}", inbound.subject), now)
            .await?;

        let unsubscribed = sentiment == Sentiment::Negative
            && has_opt_out_keyword(&inbound.body, &inbound.subject);
        if unsubscribed {
            let email = normalize_email(&inbound.from).unwrap_or_default();
            suppress_email(self.db.as_ref(), &email, Some(REPLY_UNSUBSCRIBE_REASON), now).await?;
        }

        let mut stopped_enrollments = 0;
        let mut canceled_messages = 0;
        for enrollment in self.db.active_enrollments_for_lead(lead.id).await? {
            if self
                .db
                .transition_enrollment(enrollment.id, EnrollmentStatus::Stopped, Some(REPLY_STOP_REASON))
                .await?
            {
                stopped_enrollments += 1;
            }
            canceled_messages += self
                .db
                .cancel_scheduled_messages(lead.id, Some(enrollment.campaign_id), REPLY_CANCEL_REASON)
                .await?;
        }

        if let Some(message) = &related {
            if !self
                .db
                .transition_message(message.id, MessageStatus::Replied, None)
                .await?
            {
                debug!(message_id = %message.id, status = %message.status, "Related message not marked replied");
            }
        }

        info!(
            lead_id = %lead.id,
            sentiment = %sentiment,
            unsubscribed,
            stopped = stopped_enrollments,
            "Processed reply"
        );
        Ok(ProcessedReply {
            reply_id: reply.id,
            lead_id: lead.id,
            sentiment,
            message_id: reply.message_id,
            unsubscribed,
            stopped_enrollments,
            canceled_messages,
        })
    }

    /// By provider id when given, else the lead's most recent sent message.
    async fn related_message(&self, lead_id: Uuid, in_reply_to: Option<&str>) -> Result<Option<Message>> {
        if let Some(id) = in_reply_to.filter(|s| !s.trim().is_empty()) {
            for form in provider_id_forms(id) {
                if let Some(m) = self.db.find_message_by_provider_id(lead_id, &form).await? {
                    return Ok(Some(m));
                }
            }
        }
        Ok(self.db.latest_sent_message(lead_id).await?)
    }
}
