//! Suppression list handling.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::error::{OutreachError, Result};
use crate::outreach::model::{EnrollmentStatus, normalize_email};
use crate::store::Database;

pub const UNSUBSCRIBE_STOP_REASON: &str = "Lead unsubscribed";
pub const UNSUBSCRIBE_CANCEL_REASON: &str = "Canceled due to unsubscribe";

/// Put an address on the suppression list and flag every lead using it.
/// Returns the affected lead ids.
pub async fn suppress_email(
    db: &dyn Database,
    email: &str,
    reason: Option<&str>,
    at: DateTime<Utc>,
) -> Result<Vec<Uuid>> {
    db.add_unsubscribe(email, reason, at).await?;
    Ok(db.suppress_leads_by_email(email, at).await?)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeOutcome {
    pub email: String,
    pub leads: usize,
    pub stopped_enrollments: usize,
    pub canceled_messages: u64,
}

/// Handles explicit unsubscribe requests (link clicks and console actions).
pub struct UnsubscribeService {
    db: Arc<dyn Database>,
}

impl UnsubscribeService {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Suppress the address, stop every active enrollment of matching leads,
    /// and cancel all their scheduled messages. Repeating it is harmless.
    pub async fn unsubscribe(&self, email: &str, reason: Option<&str>) -> Result<UnsubscribeOutcome> {
        let email = normalize_email(email)
            .ok_or_else(|| OutreachError::Validation("Email is required".into()))?;
        let now = Utc::now();

        let lead_ids = suppress_email(self.db.as_ref(), &email, reason, now).await?;
        let mut outcome = UnsubscribeOutcome {
            email: email.clone(),
            leads: lead_ids.len(),
            ..Default::default()
        };

        for lead_id in lead_ids {
            for enrollment in self.db.active_enrollments_for_lead(lead_id).await? {
                if self
                    .db
                    .transition_enrollment(
                        enrollment.id,
                        EnrollmentStatus::Stopped,
                        Some(UNSUBSCRIBE_STOP_REASON),
                    )
                    .await?
                {
                    outcome.stopped_enrollments += 1;
                }
            }
            outcome.canceled_messages += self
                .db
                .cancel_scheduled_messages(lead_id, None, UNSUBSCRIBE_CANCEL_REASON)
                .await?;
        }

        info!(
            email = %email,
            leads = outcome.leads,
            stopped = outcome.stopped_enrollments,
            canceled = outcome.canceled_messages,
            "Unsubscribed"
        );
        Ok(outcome)
    }
}
