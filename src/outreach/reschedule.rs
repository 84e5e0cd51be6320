//! Manual retry of a failed message.

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::error::{OutreachError, Result};
use crate::outreach::model::{EnrollmentStatus, Message, MessageStatus};
use crate::store::Database;

/// Put a FAILED message back on the schedule at `at`, clearing its error.
/// Refused when the enrollment has ended or the lead is suppressed.
pub async fn reschedule_failed(db: &dyn Database, id: Uuid, at: DateTime<Utc>) -> Result<Message> {
    let message = db
        .get_message(id)
        .await?
        .ok_or(OutreachError::MessageNotFound { id })?;

    if !message.status.can_transition_to(MessageStatus::Scheduled) {
        return Err(OutreachError::InvalidTransition {
            entity: "Message",
            id,
            from: message.status.to_string(),
            to: MessageStatus::Scheduled.to_string(),
        }
        .into());
    }

    let active = db
        .get_enrollment(message.lead_id, message.campaign_id)
        .await?
        .is_some_and(|e| e.status == EnrollmentStatus::Active);
    if !active {
        return Err(OutreachError::Validation("Enrollment is not active".into()).into());
    }

    let lead = db
        .get_lead(message.lead_id)
        .await?
        .ok_or_else(|| OutreachError::LeadNotFound {
            id: message.lead_id.to_string(),
        })?;
    if lead.is_suppressed() {
        return Err(OutreachError::Validation("Lead is on do-not-contact list".into()).into());
    }

    if !db.reschedule_message(id, at).await? {
        return Err(OutreachError::InvalidTransition {
            entity: "Message",
            id,
            from: "changed concurrently".into(),
            to: MessageStatus::Scheduled.to_string(),
        }
        .into());
    }

    info!(message_id = %id, scheduled_for = %at, "Message rescheduled");
    db.get_message(id)
        .await?
        .ok_or_else(|| OutreachError::MessageNotFound { id }.into())
}
