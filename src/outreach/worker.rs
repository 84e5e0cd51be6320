//! Send-due worker.
//!
//! One invocation drains at most `batch_size` due messages, earliest first.
//! Per-campaign send counts and the campaign cache live only for the run.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{OutreachError, Result};
use crate::mailer::{Mailer, OutboundEmail};
use crate::outreach::enrollment::{offset_from, schedule_step};
use crate::outreach::model::{
    Campaign, CampaignStep, EnrollmentStatus, Lead, Message, MessageStatus,
};
use crate::security::UnsubscribeLinks;
use crate::store::Database;

pub const SUPPRESSED_REASON: &str = "Lead is on do-not-contact list";
pub const NO_EMAIL_REASON: &str = "Lead has no email address";
pub const INACTIVE_ENROLLMENT_REASON: &str = "Enrollment is not active";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SendReport {
    pub processed: usize,
    pub sent: usize,
    pub failed: usize,
    /// Canceled by a suppression check, or held back by the daily limit.
    pub skipped: usize,
    pub errors: Vec<String>,
}

/// State scoped to a single worker run.
#[derive(Default)]
struct RunState {
    sends: HashMap<Uuid, i64>,
    campaigns: HashMap<Uuid, Arc<Campaign>>,
}

enum Outcome {
    Sent,
    /// Delivered to the provider, but a later store write failed.
    SentWithError(String),
    Skipped,
    Failed(String),
}

pub struct SendWorker {
    db: Arc<dyn Database>,
    mailer: Arc<dyn Mailer>,
    links: UnsubscribeLinks,
    sender_name: String,
    batch_size: usize,
}

impl SendWorker {
    pub fn new(
        db: Arc<dyn Database>,
        mailer: Arc<dyn Mailer>,
        links: UnsubscribeLinks,
        sender_name: impl Into<String>,
        batch_size: usize,
    ) -> Self {
        Self {
            db,
            mailer,
            links,
            sender_name: sender_name.into(),
            batch_size,
        }
    }

    pub async fn run(&self) -> Result<SendReport> {
        self.run_at(Utc::now()).await
    }

    /// Process everything due at `now`. Per-message errors are recorded on
    /// the message and in the report; only the initial fetch can fail the run.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<SendReport> {
        let due = self.db.due_messages(now, self.batch_size).await?;
        info!(count = due.len(), provider = self.mailer.name(), "Found messages to send");

        let mut state = RunState::default();
        let mut report = SendReport {
            processed: due.len(),
            ..Default::default()
        };

        for message in &due {
            match self.process(message, now, &mut state).await {
                Ok(Outcome::Sent) => report.sent += 1,
                Ok(Outcome::SentWithError(err)) => {
                    report.sent += 1;
                    report.errors.push(err);
                }
                Ok(Outcome::Skipped) => report.skipped += 1,
                Ok(Outcome::Failed(err)) => {
                    report.failed += 1;
                    report.errors.push(err);
                }
                Err(e) => {
                    error!(message_id = %message.id, "Error processing message: {e}");
                    report.failed += 1;
                    report
                        .errors
                        .push(format!("Error processing message {}: {e}", message.id));
                    let text = e.to_string();
                    match self
                        .db
                        .transition_message(message.id, MessageStatus::Failed, Some(&text))
                        .await
                    {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!(message_id = %message.id, "Message no longer SCHEDULED; not marked failed")
                        }
                        Err(mark) => {
                            error!(message_id = %message.id, "Failed to mark message failed: {mark}")
                        }
                    }
                }
            }
        }

        info!(
            processed = report.processed,
            sent = report.sent,
            failed = report.failed,
            skipped = report.skipped,
            "Worker completed"
        );
        Ok(report)
    }

    async fn process(
        &self,
        message: &Message,
        now: DateTime<Utc>,
        state: &mut RunState,
    ) -> Result<Outcome> {
        let lead = self
            .db
            .get_lead(message.lead_id)
            .await?
            .ok_or_else(|| OutreachError::LeadNotFound {
                id: message.lead_id.to_string(),
            })?;

        if lead.is_suppressed() {
            return self.cancel(message, SUPPRESSED_REASON).await;
        }
        let Some(email) = lead.email.clone() else {
            return self.cancel(message, NO_EMAIL_REASON).await;
        };

        let enrollment = match self.db.get_enrollment(lead.id, message.campaign_id).await? {
            Some(e) if e.status == EnrollmentStatus::Active => e,
            _ => return self.cancel(message, INACTIVE_ENROLLMENT_REASON).await,
        };

        let campaign = self.campaign(state, message.campaign_id).await?;
        let sends = state.sends.get(&campaign.id).copied().unwrap_or(0);
        if sends >= campaign.daily_limit {
            debug!(
                campaign = %campaign.name,
                daily_limit = campaign.daily_limit,
                "Campaign reached its daily limit"
            );
            return Ok(Outcome::Skipped);
        }

        // Resolve the follow-up time before sending so a bad offset fails
        // the message while it is still SCHEDULED.
        let next = campaign
            .step_after(message.step_index)
            .map(|step| offset_from(now, step.day_offset).map(|at| (step, at)))
            .transpose()?;

        let outbound = OutboundEmail {
            from: campaign.from_mailbox.clone(),
            to: email.clone(),
            reply_to: Some(campaign.from_mailbox.clone()),
            subject: message.subject_rendered.clone(),
            text: self.links.append_footer(&message.body_rendered, &email),
        };

        let provider_id = match self.mailer.send(&outbound).await {
            Ok(id) => id,
            Err(e) => {
                let text = e.to_string();
                warn!(message_id = %message.id, to = %email, "Send failed: {text}");
                self.db
                    .transition_message(message.id, MessageStatus::Failed, Some(&text))
                    .await?;
                return Ok(Outcome::Failed(format!("Failed to send to {email}: {text}")));
            }
        };

        // From here on the email is out; errors no longer make it a failure.
        state.sends.insert(campaign.id, sends + 1);
        if let Err(e) = self
            .after_send(message, &provider_id, &lead, &campaign, enrollment.id, next, now)
            .await
        {
            error!(message_id = %message.id, to = %email, "Post-send bookkeeping failed: {e}");
            return Ok(Outcome::SentWithError(format!(
                "Sent to {email} but bookkeeping failed: {e}"
            )));
        }

        info!(
            to = %email,
            campaign = %campaign.name,
            step = message.step_index,
            "Sent"
        );
        Ok(Outcome::Sent)
    }

    /// Mark the message SENT, record lead activity, then schedule the next
    /// step or complete the enrollment.
    #[allow(clippy::too_many_arguments)]
    async fn after_send(
        &self,
        message: &Message,
        provider_id: &str,
        lead: &Lead,
        campaign: &Campaign,
        enrollment_id: Uuid,
        next: Option<(&CampaignStep, DateTime<Utc>)>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self
            .db
            .mark_message_sent(message.id, Some(provider_id), now)
            .await?
        {
            // Canceled between fetch and send; nothing left to advance.
            warn!(message_id = %message.id, "Message left SCHEDULED during send; not advancing");
            return Ok(());
        }

        let activity_subject = campaign
            .step(message.step_index)
            .map(|s| s.subject_template.as_str())
            .unwrap_or(message.subject_rendered.as_str());
        self.db
            .record_lead_sent(lead.id, &format!("Sent: {activity_subject}"), now)
            .await?;

        let Some((step, scheduled_for)) = next else {
            self.db
                .transition_enrollment(enrollment_id, EnrollmentStatus::Completed, None)
                .await?;
            return Ok(());
        };

        let next_message = schedule_step(lead, step, &self.sender_name, scheduled_for);
        self.db.insert_message(&next_message).await?;

        // A reply or unsubscribe may have stopped the enrollment
        // while this send was in flight.
        let still_active = self
            .db
            .get_enrollment(lead.id, campaign.id)
            .await?
            .is_some_and(|e| e.status == EnrollmentStatus::Active);
        if !still_active {
            self.db
                .transition_message(
                    next_message.id,
                    MessageStatus::Canceled,
                    Some(INACTIVE_ENROLLMENT_REASON),
                )
                .await?;
        }
        Ok(())
    }

    async fn cancel(&self, message: &Message, reason: &str) -> Result<Outcome> {
        self.db
            .transition_message(message.id, MessageStatus::Canceled, Some(reason))
            .await?;
        debug!(message_id = %message.id, reason, "Canceled message");
        Ok(Outcome::Skipped)
    }

    async fn campaign(&self, state: &mut RunState, id: Uuid) -> Result<Arc<Campaign>> {
        if let Some(c) = state.campaigns.get(&id) {
            return Ok(Arc::clone(c));
        }
        let campaign = Arc::new(
            self.db
                .get_campaign(id)
                .await?
                .ok_or(OutreachError::CampaignNotFound { id })?,
        );
        state.campaigns.insert(id, Arc::clone(&campaign));
        Ok(campaign)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Duration;
    use secrecy::SecretString;

    use crate::error::{DatabaseError, MailerError};
    use crate::outreach::enrollment::EnrollmentService;
    use crate::outreach::model::{Enrollment, LeadQuery, LeadStage, Reply};
    use crate::store::{CampaignCounts, DashboardCounts, LibSqlBackend};

    #[derive(Default)]
    struct RecordingMailer {
        sent: Mutex<Vec<OutboundEmail>>,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, email: &OutboundEmail) -> std::result::Result<String, MailerError> {
            let mut sent = self.sent.lock().unwrap();
            sent.push(email.clone());
            Ok(format!("<msg-{}@test>", sent.len()))
        }
    }

    struct FailingMailer;

    #[async_trait]
    impl Mailer for FailingMailer {
        fn name(&self) -> &str {
            "failing"
        }

        async fn send(&self, _email: &OutboundEmail) -> std::result::Result<String, MailerError> {
            Err(MailerError::SendFailed {
                provider: "failing".into(),
                reason: "mailbox unavailable".into(),
            })
        }
    }

    /// Delegates to a real store but cannot record lead activity.
    struct NoActivityStore {
        inner: Arc<dyn Database>,
    }

    #[async_trait]
    impl Database for NoActivityStore {
        async fn run_migrations(&self) -> std::result::Result<(), DatabaseError> {
            self.inner.run_migrations().await
        }
        async fn insert_lead(&self, lead: &Lead) -> std::result::Result<(), DatabaseError> {
            self.inner.insert_lead(lead).await
        }
        async fn get_lead(&self, id: Uuid) -> std::result::Result<Option<Lead>, DatabaseError> {
            self.inner.get_lead(id).await
        }
        async fn find_lead_by_email(
            &self,
            email: &str,
        ) -> std::result::Result<Option<Lead>, DatabaseError> {
            self.inner.find_lead_by_email(email).await
        }
        async fn list_leads(&self) -> std::result::Result<Vec<Lead>, DatabaseError> {
            self.inner.list_leads().await
        }
        async fn find_contactable_leads(
            &self,
            query: &LeadQuery,
        ) -> std::result::Result<Vec<Lead>, DatabaseError> {
            self.inner.find_contactable_leads(query).await
        }
        async fn record_lead_sent(
            &self,
            _id: Uuid,
            _activity: &str,
            _at: DateTime<Utc>,
        ) -> std::result::Result<(), DatabaseError> {
            Err(DatabaseError::Query("record_lead_sent: disk I/O error".into()))
        }
        async fn record_lead_replied(
            &self,
            id: Uuid,
            activity: &str,
            at: DateTime<Utc>,
        ) -> std::result::Result<(), DatabaseError> {
            self.inner.record_lead_replied(id, activity, at).await
        }
        async fn suppress_leads_by_email(
            &self,
            email: &str,
            at: DateTime<Utc>,
        ) -> std::result::Result<Vec<Uuid>, DatabaseError> {
            self.inner.suppress_leads_by_email(email, at).await
        }
        async fn insert_campaign(&self, campaign: &Campaign) -> std::result::Result<(), DatabaseError> {
            self.inner.insert_campaign(campaign).await
        }
        async fn get_campaign(&self, id: Uuid) -> std::result::Result<Option<Campaign>, DatabaseError> {
            self.inner.get_campaign(id).await
        }
        async fn insert_enrollment_if_absent(
            &self,
            enrollment: &Enrollment,
        ) -> std::result::Result<bool, DatabaseError> {
            self.inner.insert_enrollment_if_absent(enrollment).await
        }
        async fn get_enrollment(
            &self,
            lead_id: Uuid,
            campaign_id: Uuid,
        ) -> std::result::Result<Option<Enrollment>, DatabaseError> {
            self.inner.get_enrollment(lead_id, campaign_id).await
        }
        async fn delete_enrollment(&self, id: Uuid) -> std::result::Result<(), DatabaseError> {
            self.inner.delete_enrollment(id).await
        }
        async fn active_enrollments_for_lead(
            &self,
            lead_id: Uuid,
        ) -> std::result::Result<Vec<Enrollment>, DatabaseError> {
            self.inner.active_enrollments_for_lead(lead_id).await
        }
        async fn transition_enrollment(
            &self,
            id: Uuid,
            to: EnrollmentStatus,
            reason: Option<&str>,
        ) -> std::result::Result<bool, DatabaseError> {
            self.inner.transition_enrollment(id, to, reason).await
        }
        async fn insert_message(&self, message: &Message) -> std::result::Result<(), DatabaseError> {
            self.inner.insert_message(message).await
        }
        async fn get_message(&self, id: Uuid) -> std::result::Result<Option<Message>, DatabaseError> {
            self.inner.get_message(id).await
        }
        async fn due_messages(
            &self,
            now: DateTime<Utc>,
            limit: usize,
        ) -> std::result::Result<Vec<Message>, DatabaseError> {
            self.inner.due_messages(now, limit).await
        }
        async fn mark_message_sent(
            &self,
            id: Uuid,
            provider_message_id: Option<&str>,
            at: DateTime<Utc>,
        ) -> std::result::Result<bool, DatabaseError> {
            self.inner.mark_message_sent(id, provider_message_id, at).await
        }
        async fn transition_message(
            &self,
            id: Uuid,
            to: MessageStatus,
            error: Option<&str>,
        ) -> std::result::Result<bool, DatabaseError> {
            self.inner.transition_message(id, to, error).await
        }
        async fn cancel_scheduled_messages(
            &self,
            lead_id: Uuid,
            campaign_id: Option<Uuid>,
            reason: &str,
        ) -> std::result::Result<u64, DatabaseError> {
            self.inner.cancel_scheduled_messages(lead_id, campaign_id, reason).await
        }
        async fn find_message_by_provider_id(
            &self,
            lead_id: Uuid,
            provider_message_id: &str,
        ) -> std::result::Result<Option<Message>, DatabaseError> {
            self.inner.find_message_by_provider_id(lead_id, provider_message_id).await
        }
        async fn latest_sent_message(
            &self,
            lead_id: Uuid,
        ) -> std::result::Result<Option<Message>, DatabaseError> {
            self.inner.latest_sent_message(lead_id).await
        }
        async fn reschedule_message(
            &self,
            id: Uuid,
            scheduled_for: DateTime<Utc>,
        ) -> std::result::Result<bool, DatabaseError> {
            self.inner.reschedule_message(id, scheduled_for).await
        }
        async fn messages_for_lead(
            &self,
            lead_id: Uuid,
        ) -> std::result::Result<Vec<Message>, DatabaseError> {
            self.inner.messages_for_lead(lead_id).await
        }
        async fn insert_reply(&self, reply: &Reply) -> std::result::Result<(), DatabaseError> {
            self.inner.insert_reply(reply).await
        }
        async fn replies_for_lead(&self, lead_id: Uuid) -> std::result::Result<Vec<Reply>, DatabaseError> {
            self.inner.replies_for_lead(lead_id).await
        }
        async fn add_unsubscribe(
            &self,
            email: &str,
            reason: Option<&str>,
            at: DateTime<Utc>,
        ) -> std::result::Result<(), DatabaseError> {
            self.inner.add_unsubscribe(email, reason, at).await
        }
        async fn is_unsubscribed(&self, email: &str) -> std::result::Result<bool, DatabaseError> {
            self.inner.is_unsubscribed(email).await
        }
        async fn campaign_counts(
            &self,
            campaign_id: Uuid,
        ) -> std::result::Result<CampaignCounts, DatabaseError> {
            self.inner.campaign_counts(campaign_id).await
        }
        async fn dashboard_counts(
            &self,
            sent_since: DateTime<Utc>,
            replies_since: DateTime<Utc>,
        ) -> std::result::Result<DashboardCounts, DatabaseError> {
            self.inner.dashboard_counts(sent_since, replies_since).await
        }
        async fn lead_stage_distribution(
            &self,
        ) -> std::result::Result<HashMap<LeadStage, u64>, DatabaseError> {
            self.inner.lead_stage_distribution().await
        }
    }

    fn links() -> UnsubscribeLinks {
        UnsubscribeLinks::new("http://localhost:3000", SecretString::from("s".to_string()))
    }

    async fn setup(campaign: Campaign, leads: &[Lead]) -> Arc<dyn Database> {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        for lead in leads {
            db.insert_lead(lead).await.unwrap();
        }
        db.insert_campaign(&campaign).await.unwrap();
        let ids = leads.iter().map(|l| l.id).collect::<Vec<_>>();
        EnrollmentService::new(Arc::clone(&db), "Sam")
            .enroll(campaign.id, Some(ids))
            .await
            .unwrap();
        db
    }

    fn three_steps() -> Campaign {
        Campaign::new("Intro", "me@agency.com")
            .with_step(0, "Hi {{contact}}", "Hello {{company}}")
            .with_step(3, "Following up", "Second")
            .with_step(4, "Last note", "Third")
    }

    fn worker(db: &Arc<dyn Database>, mailer: Arc<dyn Mailer>) -> SendWorker {
        SendWorker::new(Arc::clone(db), mailer, links(), "Sam", 100)
    }

    #[tokio::test]
    async fn three_step_sequence_advances_then_completes() {
        let lead = Lead::new("Acme", "Jane").with_email("jane@acme.com");
        let campaign = three_steps();
        let db = setup(campaign.clone(), std::slice::from_ref(&lead)).await;
        let mailer = Arc::new(RecordingMailer::default());
        let w = worker(&db, mailer.clone());

        let t0 = Utc::now();
        let r = w.run_at(t0).await.unwrap();
        assert_eq!((r.processed, r.sent, r.failed, r.skipped), (1, 1, 0, 0));

        let messages = db.messages_for_lead(lead.id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].status, MessageStatus::Sent);
        assert_eq!(messages[0].provider_message_id.as_deref(), Some("<msg-1@test>"));
        assert_eq!(messages[1].status, MessageStatus::Scheduled);
        assert_eq!(messages[1].step_index, 1);
        let drift = messages[1].scheduled_for - offset_from(t0, 3).unwrap();
        assert!(drift.num_milliseconds().abs() < 1);

        // Nothing due until the offset elapses.
        assert_eq!(w.run_at(t0 + Duration::days(1)).await.unwrap().processed, 0);

        let t1 = t0 + Duration::days(3);
        assert_eq!(w.run_at(t1).await.unwrap().sent, 1);
        let t2 = t1 + Duration::days(4);
        assert_eq!(w.run_at(t2).await.unwrap().sent, 1);

        let messages = db.messages_for_lead(lead.id).await.unwrap();
        assert_eq!(messages.len(), 3);
        assert!(messages.iter().all(|m| m.status == MessageStatus::Sent));
        let e = db.get_enrollment(lead.id, campaign.id).await.unwrap().unwrap();
        assert_eq!(e.status, EnrollmentStatus::Completed);
        assert_eq!(w.run_at(t2 + Duration::days(30)).await.unwrap().processed, 0);
        assert_eq!(mailer.sent.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn send_updates_lead_and_appends_footer() {
        let lead = Lead::new("Acme", "Jane").with_email("jane@acme.com");
        let db = setup(three_steps(), std::slice::from_ref(&lead)).await;
        let mailer = Arc::new(RecordingMailer::default());
        worker(&db, mailer.clone()).run_at(Utc::now()).await.unwrap();

        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent[0].from, "me@agency.com");
        assert_eq!(sent[0].reply_to.as_deref(), Some("me@agency.com"));
        assert_eq!(sent[0].subject, "Hi Jane");
        assert!(sent[0].text.starts_with("Hello Acme\n\n---\n\n"));
        assert!(sent[0].text.contains("/api/outreach/unsubscribe?email=jane%40acme.com&token="));

        let stored = db.get_lead(lead.id).await.unwrap().unwrap();
        assert_eq!(stored.stage, LeadStage::Contacted);
        assert_eq!(stored.last_activity.as_deref(), Some("Sent: Hi {{contact}}"));
        assert!(stored.last_touch_at.is_some());
    }

    #[tokio::test]
    async fn daily_limit_holds_back_extra_sends() {
        let a = Lead::new("A", "a").with_email("a@x.com");
        let b = Lead::new("B", "b").with_email("b@x.com");
        let campaign = three_steps().with_daily_limit(1);
        let db = setup(campaign, &[a.clone(), b.clone()]).await;

        let r = worker(&db, Arc::new(RecordingMailer::default()))
            .run_at(Utc::now())
            .await
            .unwrap();
        assert_eq!((r.sent, r.skipped), (1, 1));

        let mut statuses = Vec::new();
        for lead in [&a, &b] {
            statuses.push(db.messages_for_lead(lead.id).await.unwrap()[0].status);
        }
        assert!(statuses.contains(&MessageStatus::Sent));
        assert!(statuses.contains(&MessageStatus::Scheduled));
    }

    #[tokio::test]
    async fn stopped_enrollment_cancels_message() {
        let lead = Lead::new("Acme", "Jane").with_email("jane@acme.com");
        let campaign = three_steps();
        let db = setup(campaign.clone(), std::slice::from_ref(&lead)).await;
        let e = db.get_enrollment(lead.id, campaign.id).await.unwrap().unwrap();
        db.transition_enrollment(e.id, EnrollmentStatus::Stopped, Some("manual"))
            .await
            .unwrap();

        let mailer = Arc::new(RecordingMailer::default());
        let r = worker(&db, mailer.clone()).run_at(Utc::now()).await.unwrap();
        assert_eq!((r.sent, r.skipped), (0, 1));
        let m = &db.messages_for_lead(lead.id).await.unwrap()[0];
        assert_eq!(m.status, MessageStatus::Canceled);
        assert_eq!(m.error.as_deref(), Some(INACTIVE_ENROLLMENT_REASON));
        assert!(mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn suppressed_lead_never_sent() {
        let lead = Lead::new("Acme", "Jane").with_email("jane@acme.com");
        let db = setup(three_steps(), std::slice::from_ref(&lead)).await;
        db.suppress_leads_by_email("jane@acme.com", Utc::now()).await.unwrap();

        let mailer = Arc::new(RecordingMailer::default());
        let r = worker(&db, mailer.clone()).run_at(Utc::now()).await.unwrap();
        assert_eq!(r.skipped, 1);
        let m = &db.messages_for_lead(lead.id).await.unwrap()[0];
        assert_eq!(m.status, MessageStatus::Canceled);
        assert_eq!(m.error.as_deref(), Some(SUPPRESSED_REASON));
        assert!(mailer.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_enrollment_cancels() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let lead = Lead::new("Acme", "Jane").with_email("jane@acme.com");
        db.insert_lead(&lead).await.unwrap();
        let campaign = three_steps();
        db.insert_campaign(&campaign).await.unwrap();
        let orphan = schedule_step(&lead, &campaign.steps[0], "Sam", Utc::now());
        db.insert_message(&orphan).await.unwrap();

        let r = worker(&db, Arc::new(RecordingMailer::default()))
            .run_at(Utc::now())
            .await
            .unwrap();
        assert_eq!(r.skipped, 1);
        let m = db.get_message(orphan.id).await.unwrap().unwrap();
        assert_eq!(m.status, MessageStatus::Canceled);
        // Enrollment rows are not created by the worker.
        assert!(db.get_enrollment(lead.id, campaign.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn provider_failure_marks_failed_and_keeps_enrollment() {
        let lead = Lead::new("Acme", "Jane").with_email("jane@acme.com");
        let campaign = three_steps();
        let db = setup(campaign.clone(), std::slice::from_ref(&lead)).await;

        let r = worker(&db, Arc::new(FailingMailer)).run_at(Utc::now()).await.unwrap();
        assert_eq!((r.sent, r.failed), (0, 1));
        assert!(r.errors[0].starts_with("Failed to send to jane@acme.com: "));

        let messages = db.messages_for_lead(lead.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, MessageStatus::Failed);
        assert!(messages[0].error.as_deref().unwrap().contains("mailbox unavailable"));
        let e = db.get_enrollment(lead.id, campaign.id).await.unwrap().unwrap();
        assert_eq!(e.status, EnrollmentStatus::Active);
        let stored = db.get_lead(lead.id).await.unwrap().unwrap();
        assert_eq!(stored.stage, LeadStage::New);
    }

    #[tokio::test]
    async fn batch_size_caps_a_run() {
        let leads: Vec<Lead> = (0..3)
            .map(|i| Lead::new(format!("C{i}"), "x").with_email(format!("l{i}@x.com")))
            .collect();
        let db = setup(three_steps(), &leads).await;
        let w = SendWorker::new(
            Arc::clone(&db),
            Arc::new(RecordingMailer::default()),
            links(),
            "Sam",
            2,
        );
        let r = w.run_at(Utc::now()).await.unwrap();
        assert_eq!((r.processed, r.sent), (2, 2));
    }

    #[tokio::test]
    async fn message_error_is_isolated_from_the_rest_of_the_batch() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let now = Utc::now();

        // Stored directly: authoring would reject this offset.
        let broken = Campaign::new("Broken", "me@agency.com")
            .with_step(0, "First", "Body")
            .with_step(200_000_000, "Never", "Body");
        let a = Lead::new("A", "a").with_email("a@x.com");
        db.insert_lead(&a).await.unwrap();
        db.insert_campaign(&broken).await.unwrap();
        db.insert_enrollment_if_absent(&Enrollment::new(a.id, broken.id, now))
            .await
            .unwrap();
        let bad = schedule_step(&a, &broken.steps[0], "Sam", now - Duration::minutes(2));
        db.insert_message(&bad).await.unwrap();

        let healthy = three_steps();
        let b = Lead::new("B", "b").with_email("b@x.com");
        db.insert_lead(&b).await.unwrap();
        db.insert_campaign(&healthy).await.unwrap();
        db.insert_enrollment_if_absent(&Enrollment::new(b.id, healthy.id, now))
            .await
            .unwrap();
        let good = schedule_step(&b, &healthy.steps[0], "Sam", now - Duration::minutes(1));
        db.insert_message(&good).await.unwrap();

        let mailer = Arc::new(RecordingMailer::default());
        let r = worker(&db, mailer.clone()).run_at(now).await.unwrap();
        assert_eq!((r.processed, r.sent, r.failed, r.skipped), (2, 1, 1, 0));
        assert_eq!(r.errors.len(), 1);
        assert!(r.errors[0].starts_with("Error processing message"), "{:?}", r.errors);

        let bad = db.get_message(bad.id).await.unwrap().unwrap();
        assert_eq!(bad.status, MessageStatus::Failed);
        assert!(bad.error.as_deref().unwrap().contains("dayOffset"));
        assert_eq!(db.get_message(good.id).await.unwrap().unwrap().status, MessageStatus::Sent);

        let sent = mailer.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "b@x.com");
    }

    #[tokio::test]
    async fn bookkeeping_failure_after_send_still_counts_as_sent() {
        let lead = Lead::new("Acme", "Jane").with_email("jane@acme.com");
        let inner = setup(three_steps(), std::slice::from_ref(&lead)).await;
        let db: Arc<dyn Database> = Arc::new(NoActivityStore {
            inner: Arc::clone(&inner),
        });

        let mailer = Arc::new(RecordingMailer::default());
        let r = worker(&db, mailer.clone()).run_at(Utc::now()).await.unwrap();
        assert_eq!((r.processed, r.sent, r.failed), (1, 1, 0));
        assert_eq!(r.errors.len(), 1);
        assert!(r.errors[0].starts_with("Sent to jane@acme.com but bookkeeping failed"));
        assert_eq!(mailer.sent.lock().unwrap().len(), 1);

        let messages = inner.messages_for_lead(lead.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, MessageStatus::Sent);
        assert!(messages[0].error.is_none());
    }
}
