//! Campaign and dashboard reporting.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;
use crate::outreach::model::{LeadStage, MessageStatus};
use crate::sentiment::Sentiment;
use crate::store::{CampaignCounts, Database, DashboardCounts};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignMetrics {
    pub total_leads: u64,
    pub total_enrolled: u64,
    pub total_sent: u64,
    pub total_delivered: u64,
    pub total_replied: u64,
    pub total_positive: u64,
    pub total_neutral: u64,
    pub total_negative: u64,
    pub total_booked: u64,
    /// Percentages, 0 when the denominator is 0.
    pub delivery_rate: f64,
    pub reply_rate: f64,
    pub positive_rate: f64,
    pub booking_rate: f64,
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

impl CampaignMetrics {
    pub fn from_counts(counts: &CampaignCounts) -> Self {
        let by_status = |statuses: &[MessageStatus]| -> u64 {
            statuses
                .iter()
                .filter_map(|s| counts.messages_by_status.get(s))
                .sum()
        };
        let by_sentiment = |s: Sentiment| counts.replies_by_sentiment.get(&s).copied().unwrap_or(0);

        let total_sent = by_status(&[MessageStatus::Sent, MessageStatus::Delivered, MessageStatus::Replied]);
        let total_delivered = by_status(&[MessageStatus::Delivered, MessageStatus::Replied]);
        let total_replied: u64 = counts.replies_by_sentiment.values().sum();
        let total_positive = by_sentiment(Sentiment::Positive);

        Self {
            total_leads: counts.leads,
            total_enrolled: counts.enrollments,
            total_sent,
            total_delivered,
            total_replied,
            total_positive,
            total_neutral: by_sentiment(Sentiment::Neutral),
            total_negative: by_sentiment(Sentiment::Negative),
            total_booked: counts.booked_leads,
            delivery_rate: percent(total_delivered, total_sent),
            reply_rate: percent(total_replied, total_sent),
            positive_rate: percent(total_positive, total_replied),
            booking_rate: percent(counts.booked_leads, total_sent),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardMetrics {
    pub total_leads: u64,
    pub active_leads: u64,
    pub replied_leads: u64,
    pub booked_leads: u64,
    pub active_campaigns: u64,
    pub total_enrollments: u64,
    pub messages_scheduled: u64,
    pub messages_sent_today: u64,
    pub replies_this_week: u64,
    /// Not tracked yet; always null.
    pub avg_response_time: Option<f64>,
}

impl From<DashboardCounts> for DashboardMetrics {
    fn from(c: DashboardCounts) -> Self {
        Self {
            total_leads: c.total_leads,
            active_leads: c.active_leads,
            replied_leads: c.replied_leads,
            booked_leads: c.booked_leads,
            active_campaigns: c.running_campaigns,
            total_enrollments: c.active_enrollments,
            messages_scheduled: c.scheduled_messages,
            messages_sent_today: c.messages_sent_since,
            replies_this_week: c.replies_since,
            avg_response_time: None,
        }
    }
}

fn utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|ndt| ndt.and_utc())
        .unwrap_or(now)
}

pub async fn campaign_metrics(db: &dyn Database, campaign_id: Uuid) -> Result<CampaignMetrics> {
    let counts = db.campaign_counts(campaign_id).await?;
    Ok(CampaignMetrics::from_counts(&counts))
}

pub async fn dashboard_metrics(db: &dyn Database) -> Result<DashboardMetrics> {
    dashboard_metrics_at(db, Utc::now()).await
}

/// Sends counted from UTC midnight of `now`, replies from seven days back.
pub async fn dashboard_metrics_at(db: &dyn Database, now: DateTime<Utc>) -> Result<DashboardMetrics> {
    let counts = db
        .dashboard_counts(utc_midnight(now), now - Duration::days(7))
        .await?;
    Ok(counts.into())
}

/// Lead count per stage. Every stage is present, zero or not.
pub async fn lead_stage_distribution(db: &dyn Database) -> Result<BTreeMap<String, u64>> {
    let counts = db.lead_stage_distribution().await?;
    Ok(LeadStage::ALL
        .iter()
        .map(|s| (s.as_str().to_string(), counts.get(s).copied().unwrap_or(0)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outreach::model::{Campaign, CampaignStatus, Enrollment, Lead, Message, Reply};
    use crate::store::LibSqlBackend;
    use std::collections::HashMap;

    #[test]
    fn rates_are_percentages() {
        let counts = CampaignCounts {
            leads: 4,
            booked_leads: 1,
            enrollments: 4,
            messages_by_status: HashMap::from([
                (MessageStatus::Sent, 2),
                (MessageStatus::Delivered, 1),
                (MessageStatus::Replied, 1),
                (MessageStatus::Scheduled, 3),
                (MessageStatus::Failed, 1),
            ]),
            replies_by_sentiment: HashMap::from([
                (Sentiment::Positive, 1),
                (Sentiment::Negative, 1),
            ]),
        };
        let m = CampaignMetrics::from_counts(&counts);
        assert_eq!(m.total_sent, 4);
        assert_eq!(m.total_delivered, 2);
        assert_eq!(m.total_replied, 2);
        assert_eq!(m.total_neutral, 0);
        assert_eq!(m.delivery_rate, 50.0);
        assert_eq!(m.reply_rate, 50.0);
        assert_eq!(m.positive_rate, 50.0);
        assert_eq!(m.booking_rate, 25.0);
    }

    #[test]
    fn empty_counts_give_zero_rates() {
        let m = CampaignMetrics::from_counts(&CampaignCounts::default());
        assert_eq!(m, CampaignMetrics::default());
    }

    #[test]
    fn midnight_is_start_of_utc_day() {
        let now = DateTime::parse_from_rfc3339("2026-03-04T15:16:17Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(utc_midnight(now).to_rfc3339(), "2026-03-04T00:00:00+00:00");
    }

    #[tokio::test]
    async fn dashboard_from_store() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let jane = Lead::new("Acme", "Jane").with_email("jane@acme.com");
        let dnc = Lead::new("Beta", "Bob").with_email("bob@beta.com").with_do_not_contact();
        db.insert_lead(&jane).await.unwrap();
        db.insert_lead(&dnc).await.unwrap();
        let campaign = Campaign::new("Intro", "me@x.com")
            .with_status(CampaignStatus::Running)
            .with_step(0, "Hi", "Body")
            .with_step(2, "Again", "Body");
        db.insert_campaign(&campaign).await.unwrap();
        db.insert_enrollment_if_absent(&Enrollment::new(jane.id, campaign.id, Utc::now()))
            .await
            .unwrap();

        let now = Utc::now();
        let sent = Message::scheduled(jane.id, &campaign.steps[0], now, "Hi".into(), "Body".into());
        db.insert_message(&sent).await.unwrap();
        db.mark_message_sent(sent.id, Some("p1"), now).await.unwrap();
        let next = Message::scheduled(jane.id, &campaign.steps[1], now, "Again".into(), "Body".into());
        db.insert_message(&next).await.unwrap();
        db.insert_reply(&Reply {
            id: Uuid::new_v4(),
            lead_id: jane.id,
            campaign_id: Some(campaign.id),
            message_id: Some(sent.id),
            received_at: now,
            from_email: "jane@acme.com".into(),
            subject: "Re: Hi".into(),
            body: "Yes please".into(),
            sentiment: Sentiment::Positive,
            raw: None,
        })
        .await
        .unwrap();

        let d = dashboard_metrics_at(&db, now).await.unwrap();
        assert_eq!(d.total_leads, 2);
        assert_eq!(d.active_leads, 1);
        assert_eq!(d.active_campaigns, 1);
        assert_eq!(d.total_enrollments, 1);
        assert_eq!(d.messages_scheduled, 1);
        assert_eq!(d.messages_sent_today, 1);
        assert_eq!(d.replies_this_week, 1);
        assert_eq!(d.avg_response_time, None);

        let c = campaign_metrics(&db, campaign.id).await.unwrap();
        assert_eq!(c.total_enrolled, 1);
        assert_eq!(c.total_sent, 1);
        assert_eq!(c.total_positive, 1);
        assert_eq!(c.reply_rate, 100.0);

        let stages = lead_stage_distribution(&db).await.unwrap();
        assert_eq!(stages.len(), LeadStage::ALL.len());
        assert_eq!(stages["NEW"], 2);
        assert_eq!(stages["BOOKED"], 0);
    }
}
