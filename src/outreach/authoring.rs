//! Campaign authoring: turn a console request into a stored campaign.

use serde::{Deserialize, Serialize};

use crate::error::{OutreachError, Result};
use crate::outreach::model::{AudienceRule, Campaign, CampaignStatus, is_valid_email};
use crate::store::Database;
use crate::templating::validate_template;

/// Daily limit for campaigns created without one.
pub const DEFAULT_DAILY_LIMIT: i64 = 30;

/// Largest accepted step `dayOffset`, ten years.
pub const MAX_DAY_OFFSET: i64 = 3650;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewStep {
    #[serde(default)]
    pub day_offset: i64,
    pub subject_template: String,
    pub body_template: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCampaign {
    pub name: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub from_mailbox: Option<String>,
    #[serde(default)]
    pub daily_limit: Option<i64>,
    #[serde(default)]
    pub status: Option<CampaignStatus>,
    #[serde(default)]
    pub audience_industry: Option<String>,
    #[serde(default)]
    pub audience_geo_contains: Option<String>,
    #[serde(default)]
    pub audience_min_score: Option<i64>,
    #[serde(default)]
    pub steps: Vec<NewStep>,
}

/// Unknown template variables found in one step. Never blocks storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepWarning {
    pub step_index: i64,
    pub unknown_variables: Vec<String>,
}

/// Validate the request and build the campaign. Steps are indexed in the
/// order given. New campaigns start PAUSED unless a status is supplied.
pub fn build_campaign(
    request: NewCampaign,
    default_from: &str,
) -> Result<(Campaign, Vec<StepWarning>)> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(OutreachError::Validation("Name is required".into()).into());
    }
    let from = request
        .from_mailbox
        .as_deref()
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .unwrap_or(default_from);
    if !is_valid_email(from) {
        return Err(OutreachError::Validation(format!("Invalid fromMailbox: {from}")).into());
    }
    let daily_limit = request.daily_limit.unwrap_or(DEFAULT_DAILY_LIMIT);
    if daily_limit <= 0 {
        return Err(OutreachError::Validation("dailyLimit must be positive".into()).into());
    }

    let mut campaign = Campaign::new(name, from)
        .with_daily_limit(daily_limit)
        .with_status(request.status.unwrap_or(CampaignStatus::Paused))
        .with_audience(AudienceRule {
            industry: request.audience_industry,
            geo_contains: request.audience_geo_contains,
            min_score: request.audience_min_score,
        });
    if let Some(channel) = request.channel.filter(|c| !c.trim().is_empty()) {
        campaign.channel = channel.trim().to_lowercase();
    }

    let mut warnings = Vec::new();
    for (i, step) in request.steps.into_iter().enumerate() {
        if step.day_offset < 0 {
            return Err(OutreachError::Validation(format!(
                "Step {i}: dayOffset cannot be negative"
            ))
            .into());
        }
        if step.day_offset > MAX_DAY_OFFSET {
            return Err(OutreachError::Validation(format!(
                "Step {i}: dayOffset cannot exceed {MAX_DAY_OFFSET}"
            ))
            .into());
        }
        let mut unknown = validate_template(&step.subject_template).unknown_variables;
        unknown.extend(validate_template(&step.body_template).unknown_variables);
        unknown.dedup();
        if !unknown.is_empty() {
            warnings.push(StepWarning {
                step_index: i as i64,
                unknown_variables: unknown,
            });
        }
        campaign = campaign.with_step(step.day_offset, step.subject_template, step.body_template);
    }

    Ok((campaign, warnings))
}

/// Build and persist a campaign.
pub async fn create_campaign(
    db: &dyn Database,
    request: NewCampaign,
    default_from: &str,
) -> Result<(Campaign, Vec<StepWarning>)> {
    let (campaign, warnings) = build_campaign(request, default_from)?;
    db.insert_campaign(&campaign).await?;
    tracing::info!(
        campaign_id = %campaign.id,
        name = %campaign.name,
        steps = campaign.steps.len(),
        warnings = warnings.len(),
        "Campaign created"
    );
    Ok((campaign, warnings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::store::LibSqlBackend;

    fn request() -> NewCampaign {
        NewCampaign {
            name: "Dental Oslo".into(),
            audience_industry: Some("dental".into()),
            steps: vec![
                NewStep {
                    day_offset: 0,
                    subject_template: "Hi {{contact}}".into(),
                    body_template: "About {{company}}".into(),
                },
                NewStep {
                    day_offset: 3,
                    subject_template: "Re: {{nickname}}".into(),
                    body_template: "{{nickname}} {{favoriteColor}}".into(),
                },
            ],
            ..Default::default()
        }
    }

    #[test]
    fn builds_with_defaults_and_warnings() {
        let (c, warnings) = build_campaign(request(), "team@agency.com").unwrap();
        assert_eq!(c.from_mailbox, "team@agency.com");
        assert_eq!(c.daily_limit, DEFAULT_DAILY_LIMIT);
        assert_eq!(c.status, CampaignStatus::Paused);
        assert_eq!(c.audience.industry.as_deref(), Some("dental"));
        assert_eq!(c.steps.len(), 2);
        assert_eq!(c.steps[1].step_index, 1);
        assert_eq!(
            warnings,
            vec![StepWarning {
                step_index: 1,
                unknown_variables: vec!["nickname".into(), "favoriteColor".into()],
            }]
        );
    }

    #[test]
    fn rejects_invalid_requests() {
        let mut blank = request();
        blank.name = "  ".into();
        assert!(build_campaign(blank, "team@agency.com").is_err());

        let mut bad_from = request();
        bad_from.from_mailbox = Some("nope".into());
        assert!(matches!(
            build_campaign(bad_from, "team@agency.com"),
            Err(Error::Outreach(OutreachError::Validation(_)))
        ));

        let mut negative = request();
        negative.steps[0].day_offset = -1;
        assert!(build_campaign(negative, "team@agency.com").is_err());
    }

    #[test]
    fn day_offset_capped_at_ten_years() {
        let mut far = request();
        far.steps[1].day_offset = 200_000_000;
        let err = build_campaign(far, "team@agency.com").unwrap_err();
        assert!(
            matches!(&err, Error::Outreach(OutreachError::Validation(msg)) if msg.contains("Step 1")),
            "{err}"
        );

        let mut edge = request();
        edge.steps[1].day_offset = MAX_DAY_OFFSET;
        assert!(build_campaign(edge, "team@agency.com").is_ok());
    }

    #[test]
    fn deserializes_console_payload() {
        let req: NewCampaign = serde_json::from_value(serde_json::json!({
            "name": "Intro",
            "fromMailbox": "me@x.com",
            "dailyLimit": 10,
            "status": "RUNNING",
            "audienceMinScore": 40,
            "steps": [{"dayOffset": 2, "subjectTemplate": "s", "bodyTemplate": "b"}]
        }))
        .unwrap();
        let (c, _) = build_campaign(req, "team@agency.com").unwrap();
        assert_eq!(c.status, CampaignStatus::Running);
        assert_eq!(c.daily_limit, 10);
        assert_eq!(c.audience.min_score, Some(40));
        assert_eq!(c.steps[0].day_offset, 2);
    }

    #[tokio::test]
    async fn create_persists_steps() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let (c, _) = create_campaign(&db, request(), "team@agency.com").await.unwrap();
        let stored = db.get_campaign(c.id).await.unwrap().unwrap();
        assert_eq!(stored.steps.len(), 2);
        assert_eq!(stored.steps[0].subject_template, "Hi {{contact}}");
    }
}
