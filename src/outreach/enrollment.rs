//! Campaign enrollment: bind leads to a campaign and schedule step 0.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{OutreachError, Result};
use crate::outreach::model::{Campaign, CampaignStep, Enrollment, Lead, LeadQuery, Message};
use crate::store::Database;
use crate::templating::{lead_variables, render_template};

/// Render a step for a lead and build its SCHEDULED message.
pub fn schedule_step(
    lead: &Lead,
    step: &CampaignStep,
    sender_name: &str,
    scheduled_for: DateTime<Utc>,
) -> Message {
    let vars = lead_variables(lead, sender_name);
    Message::scheduled(
        lead.id,
        step,
        scheduled_for,
        render_template(&step.subject_template, &vars),
        render_template(&step.body_template, &vars),
    )
}

/// `base + day_offset` days. Offsets past chrono's range are an error.
pub fn offset_from(base: DateTime<Utc>, day_offset: i64) -> Result<DateTime<Utc>> {
    TimeDelta::try_days(day_offset)
        .and_then(|delta| base.checked_add_signed(delta))
        .ok_or_else(|| {
            OutreachError::Validation(format!("dayOffset {day_offset} is out of range")).into()
        })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrollmentReport {
    pub enrolled: usize,
    /// Leads that already had an enrollment of any status.
    pub skipped: usize,
    pub errors: Vec<String>,
}

pub struct EnrollmentService {
    db: Arc<dyn Database>,
    sender_name: String,
}

impl EnrollmentService {
    pub fn new(db: Arc<dyn Database>, sender_name: impl Into<String>) -> Self {
        Self {
            db,
            sender_name: sender_name.into(),
        }
    }

    /// Enroll explicit leads, or the campaign audience when `lead_ids` is
    /// absent or empty. Suppressed and email-less leads are never selected.
    pub async fn enroll(
        &self,
        campaign_id: Uuid,
        lead_ids: Option<Vec<Uuid>>,
    ) -> Result<EnrollmentReport> {
        let campaign = self
            .db
            .get_campaign(campaign_id)
            .await?
            .ok_or(OutreachError::CampaignNotFound { id: campaign_id })?;
        let first_step = campaign
            .first_step()
            .ok_or(OutreachError::NoSteps { id: campaign_id })?;

        let query = match lead_ids.filter(|ids| !ids.is_empty()) {
            Some(ids) => LeadQuery::by_ids(ids),
            None => LeadQuery::for_audience(&campaign.audience),
        };
        let leads = self.db.find_contactable_leads(&query).await?;

        let now = Utc::now();
        let mut report = EnrollmentReport::default();
        for lead in &leads {
            match self.enroll_lead(&campaign, first_step, lead, now).await {
                Ok(true) => report.enrolled += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!(lead_id = %lead.id, campaign_id = %campaign.id, "Enrollment failed: {e}");
                    report.errors.push(format!("Failed to enroll {}: {e}", lead.company));
                }
            }
        }

        info!(
            campaign = %campaign.name,
            candidates = leads.len(),
            enrolled = report.enrolled,
            skipped = report.skipped,
            errors = report.errors.len(),
            "Enrollment complete"
        );
        Ok(report)
    }

    /// `Ok(false)` when the pair already exists.
    async fn enroll_lead(
        &self,
        campaign: &Campaign,
        step: &CampaignStep,
        lead: &Lead,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let scheduled_for = offset_from(now, step.day_offset)?;
        let enrollment = Enrollment::new(lead.id, campaign.id, now);
        if !self.db.insert_enrollment_if_absent(&enrollment).await? {
            return Ok(false);
        }

        let message = schedule_step(lead, step, &self.sender_name, scheduled_for);
        if let Err(e) = self.db.insert_message(&message).await {
            // An enrollment without its first message would never send.
            if let Err(cleanup) = self.db.delete_enrollment(enrollment.id).await {
                warn!(enrollment_id = %enrollment.id, "Failed to roll back enrollment: {cleanup}");
            }
            return Err(e.into());
        }
        Ok(true)
    }
}
