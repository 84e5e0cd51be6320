//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are written as
//! fixed-width RFC 3339 UTC strings so that SQL string comparison orders
//! them chronologically.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::outreach::model::{
    AudienceRule, Campaign, CampaignStep, Enrollment, EnrollmentStatus, Lead, LeadQuery,
    LeadStage, Message, MessageStatus, Reply, normalize_email,
};
use crate::store::migrations;
use crate::store::traits::{CampaignCounts, DashboardCounts, Database};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_messages(
        &self,
        context: &str,
        sql: &str,
        values: Vec<libsql::Value>,
    ) -> Result<Vec<Message>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, values)
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_message(&row) {
                Ok(m) => messages.push(m),
                Err(e) => tracing::warn!("Skipping message row: {e}"),
            }
        }
        Ok(messages)
    }

    async fn query_one_message(
        &self,
        context: &str,
        sql: &str,
        values: Vec<libsql::Value>,
    ) -> Result<Option<Message>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, values)
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_message(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("{context}: {e}"))),
        }
    }

    async fn query_leads(
        &self,
        context: &str,
        sql: &str,
        values: Vec<libsql::Value>,
    ) -> Result<Vec<Lead>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, values)
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;

        let mut leads = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_lead(&row) {
                Ok(l) => leads.push(l),
                Err(e) => tracing::warn!("Skipping lead row: {e}"),
            }
        }
        Ok(leads)
    }

    async fn steps_for_campaign(&self, campaign_id: Uuid) -> Result<Vec<CampaignStep>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {STEP_COLUMNS} FROM campaign_steps WHERE campaign_id = ?1 ORDER BY step_index ASC"
                ),
                params![campaign_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("steps_for_campaign: {e}")))?;

        let mut steps = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            steps.push(row_to_step(&row)?);
        }
        Ok(steps)
    }

    async fn grouped_counts(
        &self,
        context: &str,
        sql: &str,
        id: Uuid,
    ) -> Result<Vec<(String, u64)>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params![id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;

        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            out.push((text(&row, 0)?, int(&row, 1)? as u64));
        }
        Ok(out)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format: RFC 3339, microseconds, `Z` suffix.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(ts(dt)),
        None => libsql::Value::Null,
    }
}

fn opt_uuid(id: Option<Uuid>) -> libsql::Value {
    match id {
        Some(id) => libsql::Value::Text(id.to_string()),
        None => libsql::Value::Null,
    }
}

/// `'A', 'B'` list for an `IN (...)` clause. Only enum names go in here.
fn status_list<T: std::fmt::Display>(states: &[T]) -> String {
    states
        .iter()
        .map(|s| format!("'{s}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn text(row: &libsql::Row, idx: i32) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("column {idx}: {e}")))
}

fn int(row: &libsql::Row, idx: i32) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("column {idx}: {e}")))
}

fn uuid_col(row: &libsql::Row, idx: i32) -> Result<Uuid, DatabaseError> {
    let s = text(row, idx)?;
    Uuid::parse_str(&s).map_err(|e| DatabaseError::Serialization(format!("bad uuid {s}: {e}")))
}

fn opt_uuid_col(row: &libsql::Row, idx: i32) -> Option<Uuid> {
    row.get::<String>(idx)
        .ok()
        .and_then(|s| Uuid::parse_str(&s).ok())
}

fn parse_enum<T: FromStr<Err = String>>(s: &str) -> Result<T, DatabaseError> {
    s.parse().map_err(DatabaseError::Serialization)
}

// ── Row mapping ─────────────────────────────────────────────────────

const LEAD_COLUMNS: &str = "id, company, contact_name, role, email, phone, website, city, industry, score, tags, notes, stage, do_not_contact, unsubscribed_at, last_touch_at, last_activity, created_at, updated_at";

const CAMPAIGN_COLUMNS: &str =
    "id, name, channel, from_mailbox, daily_limit, status, audience, created_at, updated_at";

const STEP_COLUMNS: &str =
    "id, campaign_id, step_index, day_offset, subject_template, body_template";

const ENROLLMENT_COLUMNS: &str =
    "id, lead_id, campaign_id, status, stopped_reason, enrolled_at, updated_at";

const MESSAGE_COLUMNS: &str = "id, lead_id, campaign_id, step_id, step_index, scheduled_for, status, subject_rendered, body_rendered, provider_message_id, error, sent_at, created_at, updated_at";

const REPLY_COLUMNS: &str =
    "id, lead_id, campaign_id, message_id, received_at, from_email, subject, body, sentiment, raw";

fn row_to_lead(row: &libsql::Row) -> Result<Lead, DatabaseError> {
    let tags: Vec<String> = row
        .get::<String>(10)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();

    Ok(Lead {
        id: uuid_col(row, 0)?,
        company: text(row, 1)?,
        contact_name: text(row, 2)?,
        role: row.get::<String>(3).ok(),
        email: row.get::<String>(4).ok(),
        phone: row.get::<String>(5).ok(),
        website: row.get::<String>(6).ok(),
        city: row.get::<String>(7).ok(),
        industry: row.get::<String>(8).ok(),
        score: int(row, 9)?,
        tags,
        notes: row.get::<String>(11).ok(),
        stage: parse_enum(&text(row, 12)?)?,
        do_not_contact: int(row, 13)? != 0,
        unsubscribed_at: parse_optional_datetime(&row.get::<String>(14).ok()),
        last_touch_at: parse_optional_datetime(&row.get::<String>(15).ok()),
        last_activity: row.get::<String>(16).ok(),
        created_at: parse_datetime(&text(row, 17)?),
        updated_at: parse_datetime(&text(row, 18)?),
    })
}

fn row_to_campaign(row: &libsql::Row) -> Result<Campaign, DatabaseError> {
    let audience: AudienceRule = row
        .get::<String>(6)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();

    Ok(Campaign {
        id: uuid_col(row, 0)?,
        name: text(row, 1)?,
        channel: text(row, 2)?,
        from_mailbox: text(row, 3)?,
        daily_limit: int(row, 4)?,
        status: parse_enum(&text(row, 5)?)?,
        audience,
        steps: Vec::new(),
        created_at: parse_datetime(&text(row, 7)?),
        updated_at: parse_datetime(&text(row, 8)?),
    })
}

fn row_to_step(row: &libsql::Row) -> Result<CampaignStep, DatabaseError> {
    Ok(CampaignStep {
        id: uuid_col(row, 0)?,
        campaign_id: uuid_col(row, 1)?,
        step_index: int(row, 2)?,
        day_offset: int(row, 3)?,
        subject_template: text(row, 4)?,
        body_template: text(row, 5)?,
    })
}

fn row_to_enrollment(row: &libsql::Row) -> Result<Enrollment, DatabaseError> {
    Ok(Enrollment {
        id: uuid_col(row, 0)?,
        lead_id: uuid_col(row, 1)?,
        campaign_id: uuid_col(row, 2)?,
        status: parse_enum(&text(row, 3)?)?,
        stopped_reason: row.get::<String>(4).ok(),
        enrolled_at: parse_datetime(&text(row, 5)?),
        updated_at: parse_datetime(&text(row, 6)?),
    })
}

fn row_to_message(row: &libsql::Row) -> Result<Message, DatabaseError> {
    Ok(Message {
        id: uuid_col(row, 0)?,
        lead_id: uuid_col(row, 1)?,
        campaign_id: uuid_col(row, 2)?,
        step_id: uuid_col(row, 3)?,
        step_index: int(row, 4)?,
        scheduled_for: parse_datetime(&text(row, 5)?),
        status: parse_enum(&text(row, 6)?)?,
        subject_rendered: text(row, 7)?,
        body_rendered: text(row, 8)?,
        provider_message_id: row.get::<String>(9).ok(),
        error: row.get::<String>(10).ok(),
        sent_at: parse_optional_datetime(&row.get::<String>(11).ok()),
        created_at: parse_datetime(&text(row, 12)?),
        updated_at: parse_datetime(&text(row, 13)?),
    })
}

fn row_to_reply(row: &libsql::Row) -> Result<Reply, DatabaseError> {
    Ok(Reply {
        id: uuid_col(row, 0)?,
        lead_id: uuid_col(row, 1)?,
        campaign_id: opt_uuid_col(row, 2),
        message_id: opt_uuid_col(row, 3),
        received_at: parse_datetime(&text(row, 4)?),
        from_email: text(row, 5)?,
        subject: text(row, 6)?,
        body: text(row, 7)?,
        sentiment: parse_enum(&text(row, 8)?)?,
        raw: row
            .get::<String>(9)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok()),
    })
}

/// Compile a `LeadQuery` into an AND-only WHERE clause plus positional
/// values. The contactability filter is always included.
fn contactable_where(query: &LeadQuery) -> (String, Vec<libsql::Value>) {
    let mut conditions: Vec<String> = vec![
        "do_not_contact = 0".into(),
        "unsubscribed_at IS NULL".into(),
        "email IS NOT NULL".into(),
        "email != ''".into(),
        "NOT EXISTS (SELECT 1 FROM unsubscribes u WHERE u.email = lower(leads.email))".into(),
    ];
    let mut values: Vec<libsql::Value> = Vec::new();

    if let Some(ids) = &query.ids {
        let placeholders = vec!["?"; ids.len()].join(", ");
        conditions.push(format!("id IN ({placeholders})"));
        values.extend(ids.iter().map(|id| libsql::Value::Text(id.to_string())));
    }
    if let Some(industry) = &query.industry_contains {
        conditions.push("instr(lower(industry), lower(?)) > 0".into());
        values.push(libsql::Value::Text(industry.clone()));
    }
    if let Some(city) = &query.city_contains {
        conditions.push("instr(lower(city), lower(?)) > 0".into());
        values.push(libsql::Value::Text(city.clone()));
    }
    if let Some(min_score) = query.min_score {
        conditions.push("score >= ?".into());
        values.push(libsql::Value::Integer(min_score));
    }

    (conditions.join(" AND "), values)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Leads ───────────────────────────────────────────────────────

    async fn insert_lead(&self, lead: &Lead) -> Result<(), DatabaseError> {
        let tags = serde_json::to_string(&lead.tags)
            .map_err(|e| DatabaseError::Serialization(format!("lead tags: {e}")))?;
        let email = lead.email.as_deref().and_then(normalize_email);

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO leads ({LEAD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)"
                ),
                params![
                    lead.id.to_string(),
                    lead.company.clone(),
                    lead.contact_name.clone(),
                    opt_text(lead.role.as_deref()),
                    opt_text(email.as_deref()),
                    opt_text(lead.phone.as_deref()),
                    opt_text(lead.website.as_deref()),
                    opt_text(lead.city.as_deref()),
                    opt_text(lead.industry.as_deref()),
                    lead.score,
                    tags,
                    opt_text(lead.notes.as_deref()),
                    lead.stage.as_str(),
                    lead.do_not_contact as i64,
                    opt_ts(lead.unsubscribed_at),
                    opt_ts(lead.last_touch_at),
                    opt_text(lead.last_activity.as_deref()),
                    ts(lead.created_at),
                    ts(lead.updated_at),
                ],
            )
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("UNIQUE") {
                    DatabaseError::Constraint(format!("insert_lead: {msg}"))
                } else {
                    DatabaseError::Query(format!("insert_lead: {msg}"))
                }
            })?;

        debug!(lead_id = %lead.id, "Lead inserted");
        Ok(())
    }

    async fn get_lead(&self, id: Uuid) -> Result<Option<Lead>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_lead: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_lead(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_lead: {e}"))),
        }
    }

    async fn find_lead_by_email(&self, email: &str) -> Result<Option<Lead>, DatabaseError> {
        let Some(email) = normalize_email(email) else {
            return Ok(None);
        };
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {LEAD_COLUMNS} FROM leads WHERE lower(email) = ?1 LIMIT 1"),
                params![email],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_lead_by_email: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_lead(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_lead_by_email: {e}"))),
        }
    }

    async fn list_leads(&self) -> Result<Vec<Lead>, DatabaseError> {
        self.query_leads(
            "list_leads",
            &format!("SELECT {LEAD_COLUMNS} FROM leads ORDER BY created_at DESC"),
            Vec::new(),
        )
        .await
    }

    async fn find_contactable_leads(&self, query: &LeadQuery) -> Result<Vec<Lead>, DatabaseError> {
        if query.ids.as_ref().is_some_and(|ids| ids.is_empty()) {
            return Ok(Vec::new());
        }
        let (where_clause, values) = contactable_where(query);
        self.query_leads(
            "find_contactable_leads",
            &format!(
                "SELECT {LEAD_COLUMNS} FROM leads WHERE {where_clause} ORDER BY created_at ASC"
            ),
            values,
        )
        .await
    }

    async fn record_lead_sent(
        &self,
        id: Uuid,
        activity: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE leads SET last_touch_at = ?1, last_activity = ?2, updated_at = ?1,
                     stage = CASE WHEN stage = 'NEW' THEN 'CONTACTED' ELSE stage END
                 WHERE id = ?3",
                params![ts(at), activity, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_lead_sent: {e}")))?;
        Ok(())
    }

    async fn record_lead_replied(
        &self,
        id: Uuid,
        activity: &str,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE leads SET stage = ?1, last_touch_at = ?2, last_activity = ?3, updated_at = ?2
                 WHERE id = ?4",
                params![LeadStage::Replied.as_str(), ts(at), activity, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_lead_replied: {e}")))?;
        Ok(())
    }

    async fn suppress_leads_by_email(
        &self,
        email: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<Uuid>, DatabaseError> {
        let Some(email) = normalize_email(email) else {
            return Ok(Vec::new());
        };
        let conn = self.conn();

        let mut rows = conn
            .query(
                "SELECT id FROM leads WHERE lower(email) = ?1",
                params![email.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("suppress_leads_by_email: {e}")))?;
        let mut ids = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            ids.push(uuid_col(&row, 0)?);
        }

        conn.execute(
            "UPDATE leads SET do_not_contact = 1,
                 unsubscribed_at = COALESCE(unsubscribed_at, ?1), updated_at = ?1
             WHERE lower(email) = ?2",
            params![ts(at), email],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("suppress_leads_by_email: {e}")))?;

        Ok(ids)
    }

    // ── Campaigns ───────────────────────────────────────────────────

    async fn insert_campaign(&self, campaign: &Campaign) -> Result<(), DatabaseError> {
        let audience = serde_json::to_string(&campaign.audience)
            .map_err(|e| DatabaseError::Serialization(format!("campaign audience: {e}")))?;

        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_campaign: {e}")))?;

        tx.execute(
            &format!(
                "INSERT INTO campaigns ({CAMPAIGN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            params![
                campaign.id.to_string(),
                campaign.name.clone(),
                campaign.channel.clone(),
                campaign.from_mailbox.clone(),
                campaign.daily_limit,
                campaign.status.as_str(),
                audience,
                ts(campaign.created_at),
                ts(campaign.updated_at),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("insert_campaign: {e}")))?;

        for step in &campaign.steps {
            tx.execute(
                &format!("INSERT INTO campaign_steps ({STEP_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
                params![
                    step.id.to_string(),
                    campaign.id.to_string(),
                    step.step_index,
                    step.day_offset,
                    step.subject_template.clone(),
                    step.body_template.clone(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_campaign step: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_campaign commit: {e}")))?;

        debug!(campaign_id = %campaign.id, steps = campaign.steps.len(), "Campaign inserted");
        Ok(())
    }

    async fn get_campaign(&self, id: Uuid) -> Result<Option<Campaign>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_campaign: {e}")))?;

        let mut campaign = match rows.next().await {
            Ok(Some(row)) => row_to_campaign(&row)?,
            Ok(None) => return Ok(None),
            Err(e) => return Err(DatabaseError::Query(format!("get_campaign: {e}"))),
        };
        campaign.steps = self.steps_for_campaign(id).await?;
        Ok(Some(campaign))
    }

    // ── Enrollments ─────────────────────────────────────────────────

    async fn insert_enrollment_if_absent(
        &self,
        enrollment: &Enrollment,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO enrollments ({ENROLLMENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                ),
                params![
                    enrollment.id.to_string(),
                    enrollment.lead_id.to_string(),
                    enrollment.campaign_id.to_string(),
                    enrollment.status.as_str(),
                    opt_text(enrollment.stopped_reason.as_deref()),
                    ts(enrollment.enrolled_at),
                    ts(enrollment.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_enrollment_if_absent: {e}")))?;
        Ok(count > 0)
    }

    async fn get_enrollment(
        &self,
        lead_id: Uuid,
        campaign_id: Uuid,
    ) -> Result<Option<Enrollment>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ENROLLMENT_COLUMNS} FROM enrollments WHERE lead_id = ?1 AND campaign_id = ?2"
                ),
                params![lead_id.to_string(), campaign_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_enrollment: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_enrollment(&row).map(Some),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_enrollment: {e}"))),
        }
    }

    async fn delete_enrollment(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM enrollments WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_enrollment: {e}")))?;
        Ok(())
    }

    async fn active_enrollments_for_lead(
        &self,
        lead_id: Uuid,
    ) -> Result<Vec<Enrollment>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {ENROLLMENT_COLUMNS} FROM enrollments WHERE lead_id = ?1 AND status = ?2 ORDER BY enrolled_at ASC"
                ),
                params![lead_id.to_string(), EnrollmentStatus::Active.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("active_enrollments_for_lead: {e}")))?;

        let mut enrollments = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_enrollment(&row) {
                Ok(e) => enrollments.push(e),
                Err(e) => tracing::warn!("Skipping enrollment row: {e}"),
            }
        }
        Ok(enrollments)
    }

    async fn transition_enrollment(
        &self,
        id: Uuid,
        to: EnrollmentStatus,
        reason: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let from = EnrollmentStatus::predecessors(to);
        if from.is_empty() {
            return Ok(false);
        }
        let count = self
            .conn()
            .execute(
                &format!(
                    "UPDATE enrollments SET status = ?1, stopped_reason = COALESCE(?2, stopped_reason), updated_at = ?3
                     WHERE id = ?4 AND status IN ({})",
                    status_list(&from)
                ),
                params![to.as_str(), opt_text(reason), ts(Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("transition_enrollment: {e}")))?;

        debug!(enrollment_id = %id, to = %to, changed = count > 0, "Enrollment transition");
        Ok(count > 0)
    }

    // ── Messages ────────────────────────────────────────────────────

    async fn insert_message(&self, message: &Message) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
                ),
                params![
                    message.id.to_string(),
                    message.lead_id.to_string(),
                    message.campaign_id.to_string(),
                    message.step_id.to_string(),
                    message.step_index,
                    ts(message.scheduled_for),
                    message.status.as_str(),
                    message.subject_rendered.clone(),
                    message.body_rendered.clone(),
                    opt_text(message.provider_message_id.as_deref()),
                    opt_text(message.error.as_deref()),
                    opt_ts(message.sent_at),
                    ts(message.created_at),
                    ts(message.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_message: {e}")))?;

        debug!(message_id = %message.id, step = message.step_index, "Message scheduled");
        Ok(())
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, DatabaseError> {
        self.query_one_message(
            "get_message",
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            vec![libsql::Value::Text(id.to_string())],
        )
        .await
    }

    async fn due_messages(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Message>, DatabaseError> {
        self.query_messages(
            "due_messages",
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE status = ?1 AND scheduled_for <= ?2 ORDER BY scheduled_for ASC LIMIT ?3"
            ),
            vec![
                libsql::Value::Text(MessageStatus::Scheduled.as_str().to_string()),
                libsql::Value::Text(ts(now)),
                libsql::Value::Integer(limit as i64),
            ],
        )
        .await
    }

    async fn mark_message_sent(
        &self,
        id: Uuid,
        provider_message_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                &format!(
                    "UPDATE messages SET status = ?1, provider_message_id = ?2, sent_at = ?3, error = NULL, updated_at = ?3
                     WHERE id = ?4 AND status IN ({})",
                    status_list(&MessageStatus::predecessors(MessageStatus::Sent))
                ),
                params![
                    MessageStatus::Sent.as_str(),
                    opt_text(provider_message_id),
                    ts(at),
                    id.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_message_sent: {e}")))?;
        Ok(count > 0)
    }

    async fn transition_message(
        &self,
        id: Uuid,
        to: MessageStatus,
        error: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let from = MessageStatus::predecessors(to);
        if from.is_empty() {
            return Ok(false);
        }
        let count = self
            .conn()
            .execute(
                &format!(
                    "UPDATE messages SET status = ?1, error = COALESCE(?2, error), updated_at = ?3
                     WHERE id = ?4 AND status IN ({})",
                    status_list(&from)
                ),
                params![to.as_str(), opt_text(error), ts(Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("transition_message: {e}")))?;

        debug!(message_id = %id, to = %to, changed = count > 0, "Message transition");
        Ok(count > 0)
    }

    async fn cancel_scheduled_messages(
        &self,
        lead_id: Uuid,
        campaign_id: Option<Uuid>,
        reason: &str,
    ) -> Result<u64, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE messages SET status = ?1, error = ?2, updated_at = ?3
                 WHERE lead_id = ?4 AND status = ?5 AND (?6 IS NULL OR campaign_id = ?6)",
                params![
                    MessageStatus::Canceled.as_str(),
                    reason,
                    ts(Utc::now()),
                    lead_id.to_string(),
                    MessageStatus::Scheduled.as_str(),
                    opt_uuid(campaign_id),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("cancel_scheduled_messages: {e}")))?;

        if count > 0 {
            info!(lead_id = %lead_id, count, reason, "Canceled scheduled messages");
        }
        Ok(count)
    }

    async fn find_message_by_provider_id(
        &self,
        lead_id: Uuid,
        provider_message_id: &str,
    ) -> Result<Option<Message>, DatabaseError> {
        self.query_one_message(
            "find_message_by_provider_id",
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE lead_id = ?1 AND provider_message_id = ?2 LIMIT 1"
            ),
            vec![
                libsql::Value::Text(lead_id.to_string()),
                libsql::Value::Text(provider_message_id.to_string()),
            ],
        )
        .await
    }

    async fn latest_sent_message(&self, lead_id: Uuid) -> Result<Option<Message>, DatabaseError> {
        self.query_one_message(
            "latest_sent_message",
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE lead_id = ?1 AND status IN ({})
                 ORDER BY COALESCE(sent_at, updated_at) DESC LIMIT 1",
                status_list(&[MessageStatus::Sent, MessageStatus::Delivered])
            ),
            vec![libsql::Value::Text(lead_id.to_string())],
        )
        .await
    }

    async fn reschedule_message(
        &self,
        id: Uuid,
        scheduled_for: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                &format!(
                    "UPDATE messages SET status = ?1, scheduled_for = ?2, error = NULL, updated_at = ?3
                     WHERE id = ?4 AND status IN ({})",
                    status_list(&MessageStatus::predecessors(MessageStatus::Scheduled))
                ),
                params![
                    MessageStatus::Scheduled.as_str(),
                    ts(scheduled_for),
                    ts(Utc::now()),
                    id.to_string()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("reschedule_message: {e}")))?;
        Ok(count > 0)
    }

    async fn messages_for_lead(&self, lead_id: Uuid) -> Result<Vec<Message>, DatabaseError> {
        self.query_messages(
            "messages_for_lead",
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE lead_id = ?1 ORDER BY scheduled_for ASC, step_index ASC"
            ),
            vec![libsql::Value::Text(lead_id.to_string())],
        )
        .await
    }

    // ── Replies ─────────────────────────────────────────────────────

    async fn insert_reply(&self, reply: &Reply) -> Result<(), DatabaseError> {
        let raw = match &reply.raw {
            Some(v) => libsql::Value::Text(v.to_string()),
            None => libsql::Value::Null,
        };
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO replies ({REPLY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    reply.id.to_string(),
                    reply.lead_id.to_string(),
                    opt_uuid(reply.campaign_id),
                    opt_uuid(reply.message_id),
                    ts(reply.received_at),
                    reply.from_email.clone(),
                    reply.subject.clone(),
                    reply.body.clone(),
                    reply.sentiment.as_str(),
                    raw,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_reply: {e}")))?;
        Ok(())
    }

    async fn replies_for_lead(&self, lead_id: Uuid) -> Result<Vec<Reply>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {REPLY_COLUMNS} FROM replies WHERE lead_id = ?1 ORDER BY received_at ASC"
                ),
                params![lead_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("replies_for_lead: {e}")))?;

        let mut replies = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_reply(&row) {
                Ok(r) => replies.push(r),
                Err(e) => tracing::warn!("Skipping reply row: {e}"),
            }
        }
        Ok(replies)
    }

    // ── Unsubscribes ────────────────────────────────────────────────

    async fn add_unsubscribe(
        &self,
        email: &str,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let Some(email) = normalize_email(email) else {
            return Err(DatabaseError::Constraint(
                "add_unsubscribe: empty email".into(),
            ));
        };
        self.conn()
            .execute(
                "INSERT INTO unsubscribes (email, reason, created_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(email) DO UPDATE SET reason = COALESCE(excluded.reason, unsubscribes.reason)",
                params![email, opt_text(reason), ts(at)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_unsubscribe: {e}")))?;
        Ok(())
    }

    async fn is_unsubscribed(&self, email: &str) -> Result<bool, DatabaseError> {
        let Some(email) = normalize_email(email) else {
            return Ok(false);
        };
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM unsubscribes WHERE email = ?1",
                params![email],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("is_unsubscribed: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(int(&row, 0)? > 0),
            Ok(None) => Ok(false),
            Err(e) => Err(DatabaseError::Query(format!("is_unsubscribed: {e}"))),
        }
    }

    // ── Metrics ─────────────────────────────────────────────────────

    async fn campaign_counts(&self, campaign_id: Uuid) -> Result<CampaignCounts, DatabaseError> {
        let mut counts = CampaignCounts::default();

        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*), COUNT(DISTINCT e.lead_id),
                        SUM(CASE WHEN l.stage = 'BOOKED' THEN 1 ELSE 0 END)
                 FROM enrollments e JOIN leads l ON l.id = e.lead_id
                 WHERE e.campaign_id = ?1",
                params![campaign_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("campaign_counts: {e}")))?;
        if let Ok(Some(row)) = rows.next().await {
            counts.enrollments = int(&row, 0)? as u64;
            counts.leads = int(&row, 1)? as u64;
            counts.booked_leads = row.get::<i64>(2).unwrap_or(0) as u64;
        }

        for (status, n) in self
            .grouped_counts(
                "campaign_counts messages",
                "SELECT status, COUNT(*) FROM messages WHERE campaign_id = ?1 GROUP BY status",
                campaign_id,
            )
            .await?
        {
            counts.messages_by_status.insert(parse_enum(&status)?, n);
        }

        for (sentiment, n) in self
            .grouped_counts(
                "campaign_counts replies",
                "SELECT sentiment, COUNT(*) FROM replies WHERE campaign_id = ?1 GROUP BY sentiment",
                campaign_id,
            )
            .await?
        {
            counts.replies_by_sentiment.insert(parse_enum(&sentiment)?, n);
        }

        Ok(counts)
    }

    async fn dashboard_counts(
        &self,
        sent_since: DateTime<Utc>,
        replies_since: DateTime<Utc>,
    ) -> Result<DashboardCounts, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT
                    (SELECT COUNT(*) FROM leads),
                    (SELECT COUNT(*) FROM leads WHERE stage IN ('NEW', 'CONTACTED') AND do_not_contact = 0),
                    (SELECT COUNT(*) FROM leads WHERE stage = 'REPLIED'),
                    (SELECT COUNT(*) FROM leads WHERE stage = 'BOOKED'),
                    (SELECT COUNT(*) FROM campaigns WHERE status = 'RUNNING'),
                    (SELECT COUNT(*) FROM enrollments WHERE status = 'ACTIVE'),
                    (SELECT COUNT(*) FROM messages WHERE status = 'SCHEDULED'),
                    (SELECT COUNT(*) FROM messages WHERE sent_at IS NOT NULL AND sent_at >= ?1),
                    (SELECT COUNT(*) FROM replies WHERE received_at >= ?2)",
                params![ts(sent_since), ts(replies_since)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("dashboard_counts: {e}")))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(DashboardCounts::default()),
            Err(e) => return Err(DatabaseError::Query(format!("dashboard_counts: {e}"))),
        };
        let n = |idx: i32| int(&row, idx).map(|v| v as u64);

        Ok(DashboardCounts {
            total_leads: n(0)?,
            active_leads: n(1)?,
            replied_leads: n(2)?,
            booked_leads: n(3)?,
            running_campaigns: n(4)?,
            active_enrollments: n(5)?,
            scheduled_messages: n(6)?,
            messages_sent_since: n(7)?,
            replies_since: n(8)?,
        })
    }

    async fn lead_stage_distribution(&self) -> Result<HashMap<LeadStage, u64>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT stage, COUNT(*) FROM leads GROUP BY stage", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("lead_stage_distribution: {e}")))?;

        let mut distribution = HashMap::new();
        while let Ok(Some(row)) = rows.next().await {
            let stage: LeadStage = parse_enum(&text(&row, 0)?)?;
            distribution.insert(stage, int(&row, 1)? as u64);
        }
        Ok(distribution)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sentiment::Sentiment;
    use chrono::Duration;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn campaign() -> Campaign {
        Campaign::new("Intro", "me@agency.com")
            .with_step(0, "Hi {{contact}}", "Body 1")
            .with_step(3, "Follow up", "Body 2")
    }

    async fn seeded(db: &LibSqlBackend, email: &str) -> (Lead, Campaign) {
        let lead = Lead::new("Acme", "Jane").with_email(email);
        db.insert_lead(&lead).await.unwrap();
        let c = campaign();
        db.insert_campaign(&c).await.unwrap();
        (lead, c)
    }

    fn message_at(lead: &Lead, c: &Campaign, at: DateTime<Utc>) -> Message {
        Message::scheduled(lead.id, &c.steps[0], at, "s".into(), "b".into())
    }

    #[test]
    fn timestamps_are_fixed_width() {
        let a = ts(DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().to_utc());
        let b = ts(DateTime::parse_from_rfc3339("2026-01-01T00:00:00.5Z").unwrap().to_utc());
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(a, "2026-01-01T00:00:00.000000Z");
    }

    #[test]
    fn parse_datetime_accepts_sqlite_format() {
        let dt = parse_datetime("2026-02-03 04:05:06");
        assert_eq!(ts(dt), "2026-02-03T04:05:06.000000Z");
        assert_eq!(parse_datetime("garbage"), DateTime::<Utc>::MIN_UTC);
    }

    // ── Lead tests ──────────────────────────────────────────────────

    #[tokio::test]
    async fn insert_and_get_lead() {
        let db = test_db().await;
        let mut lead = Lead::new("Acme", "Jane")
            .with_email("Jane@Acme.com")
            .with_industry("Dental")
            .with_score(70);
        lead.tags = vec!["vip".into(), "oslo".into()];
        db.insert_lead(&lead).await.unwrap();

        let fetched = db.get_lead(lead.id).await.unwrap().unwrap();
        assert_eq!(fetched.email.as_deref(), Some("jane@acme.com"));
        assert_eq!(fetched.tags, vec!["vip", "oslo"]);
        assert_eq!(fetched.score, 70);
        assert_eq!(fetched.stage, LeadStage::New);
        assert!(!fetched.do_not_contact);
        assert!(db.get_lead(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_email_is_constraint_error() {
        let db = test_db().await;
        db.insert_lead(&Lead::new("A", "a").with_email("x@y.com"))
            .await
            .unwrap();
        let err = db
            .insert_lead(&Lead::new("B", "b").with_email("X@y.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }

    #[tokio::test]
    async fn find_by_email_is_case_insensitive() {
        let db = test_db().await;
        let lead = Lead::new("Acme", "Jane").with_email("jane@acme.com");
        db.insert_lead(&lead).await.unwrap();

        let found = db.find_lead_by_email("  JANE@Acme.COM ").await.unwrap();
        assert_eq!(found.unwrap().id, lead.id);
        assert!(db.find_lead_by_email("other@acme.com").await.unwrap().is_none());
        assert!(db.find_lead_by_email("").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn contactable_excludes_suppressed_and_emailless() {
        let db = test_db().await;
        let ok = Lead::new("Ok", "a").with_email("ok@x.com");
        let dnc = Lead::new("Dnc", "b").with_email("dnc@x.com").with_do_not_contact();
        let mut unsub = Lead::new("Unsub", "c").with_email("unsub@x.com");
        unsub.unsubscribed_at = Some(Utc::now());
        let no_email = Lead::new("None", "d");
        let listed = Lead::new("Listed", "e").with_email("Listed@x.com");
        for l in [&ok, &dnc, &unsub, &no_email, &listed] {
            db.insert_lead(l).await.unwrap();
        }
        db.add_unsubscribe("listed@X.com", None, Utc::now())
            .await
            .unwrap();

        let found = db
            .find_contactable_leads(&LeadQuery::default())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, ok.id);

        let by_ids = db
            .find_contactable_leads(&LeadQuery::by_ids(vec![dnc.id, ok.id, listed.id]))
            .await
            .unwrap();
        assert_eq!(by_ids.len(), 1);
        assert!(
            db.find_contactable_leads(&LeadQuery::by_ids(Vec::new()))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn contactable_applies_audience_rules() {
        let db = test_db().await;
        let a = Lead::new("A", "a")
            .with_email("a@x.com")
            .with_industry("Dental Clinic")
            .with_city("Oslo")
            .with_score(80);
        let b = Lead::new("B", "b")
            .with_email("b@x.com")
            .with_industry("dental")
            .with_city("Bergen")
            .with_score(80);
        let c = Lead::new("C", "c")
            .with_email("c@x.com")
            .with_industry("Dental")
            .with_city("Oslo")
            .with_score(10);
        let d = Lead::new("D", "d").with_email("d@x.com").with_city("Oslo");
        for l in [&a, &b, &c, &d] {
            db.insert_lead(l).await.unwrap();
        }

        let q = LeadQuery {
            industry_contains: Some("DENTAL".into()),
            city_contains: Some("osl".into()),
            min_score: Some(50),
            ..Default::default()
        };
        let found = db.find_contactable_leads(&q).await.unwrap();
        assert_eq!(found.iter().map(|l| l.id).collect::<Vec<_>>(), vec![a.id]);

        let q = LeadQuery {
            industry_contains: Some("dental".into()),
            ..Default::default()
        };
        assert_eq!(db.find_contactable_leads(&q).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn record_sent_only_advances_new() {
        let db = test_db().await;
        let new_lead = Lead::new("A", "a").with_email("a@x.com");
        let mut booked = Lead::new("B", "b").with_email("b@x.com");
        booked.stage = LeadStage::Booked;
        db.insert_lead(&new_lead).await.unwrap();
        db.insert_lead(&booked).await.unwrap();

        let now = Utc::now();
        db.record_lead_sent(new_lead.id, "Sent: Hi", now).await.unwrap();
        db.record_lead_sent(booked.id, "Sent: Hi", now).await.unwrap();

        let a = db.get_lead(new_lead.id).await.unwrap().unwrap();
        assert_eq!(a.stage, LeadStage::Contacted);
        assert_eq!(a.last_activity.as_deref(), Some("Sent: Hi"));
        assert!(a.last_touch_at.is_some());
        let b = db.get_lead(booked.id).await.unwrap().unwrap();
        assert_eq!(b.stage, LeadStage::Booked);
    }

    #[tokio::test]
    async fn suppress_by_email_keeps_first_timestamp() {
        let db = test_db().await;
        let lead = Lead::new("A", "a").with_email("a@x.com");
        db.insert_lead(&lead).await.unwrap();

        let first = Utc::now() - Duration::days(2);
        let ids = db.suppress_leads_by_email("A@x.com", first).await.unwrap();
        assert_eq!(ids, vec![lead.id]);
        db.suppress_leads_by_email("a@x.com", Utc::now()).await.unwrap();

        let fetched = db.get_lead(lead.id).await.unwrap().unwrap();
        assert!(fetched.do_not_contact);
        assert_eq!(ts(fetched.unsubscribed_at.unwrap()), ts(first));
        assert!(db.suppress_leads_by_email("nobody@x.com", first).await.unwrap().is_empty());
    }

    // ── Campaign tests ──────────────────────────────────────────────

    #[tokio::test]
    async fn campaign_round_trip_with_steps() {
        let db = test_db().await;
        let c = campaign()
            .with_daily_limit(7)
            .with_audience(AudienceRule {
                industry: Some("dental".into()),
                geo_contains: None,
                min_score: Some(40),
            });
        db.insert_campaign(&c).await.unwrap();

        let fetched = db.get_campaign(c.id).await.unwrap().unwrap();
        assert_eq!(fetched.daily_limit, 7);
        assert_eq!(fetched.audience.industry.as_deref(), Some("dental"));
        assert_eq!(fetched.steps.len(), 2);
        assert_eq!(fetched.steps[1].day_offset, 3);
        assert_eq!(fetched.steps[0].subject_template, "Hi {{contact}}");
        assert!(db.get_campaign(Uuid::new_v4()).await.unwrap().is_none());
    }

    // ── Enrollment tests ────────────────────────────────────────────

    #[tokio::test]
    async fn enrollment_insert_is_idempotent_per_pair() {
        let db = test_db().await;
        let (lead, c) = seeded(&db, "a@x.com").await;

        let first = Enrollment::new(lead.id, c.id, Utc::now());
        assert!(db.insert_enrollment_if_absent(&first).await.unwrap());
        let second = Enrollment::new(lead.id, c.id, Utc::now());
        assert!(!db.insert_enrollment_if_absent(&second).await.unwrap());

        let stored = db.get_enrollment(lead.id, c.id).await.unwrap().unwrap();
        assert_eq!(stored.id, first.id);
    }

    #[tokio::test]
    async fn enrollment_transitions_are_cas() {
        let db = test_db().await;
        let (lead, c) = seeded(&db, "a@x.com").await;
        let e = Enrollment::new(lead.id, c.id, Utc::now());
        db.insert_enrollment_if_absent(&e).await.unwrap();

        assert!(
            db.transition_enrollment(e.id, EnrollmentStatus::Stopped, Some("Lead replied to campaign"))
                .await
                .unwrap()
        );
        // Terminal states do not move again.
        assert!(
            !db.transition_enrollment(e.id, EnrollmentStatus::Completed, None)
                .await
                .unwrap()
        );
        assert!(
            !db.transition_enrollment(e.id, EnrollmentStatus::Active, None)
                .await
                .unwrap()
        );

        let stored = db.get_enrollment(lead.id, c.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EnrollmentStatus::Stopped);
        assert_eq!(stored.stopped_reason.as_deref(), Some("Lead replied to campaign"));
        assert!(db.active_enrollments_for_lead(lead.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_enrollment_frees_pair() {
        let db = test_db().await;
        let (lead, c) = seeded(&db, "a@x.com").await;
        let e = Enrollment::new(lead.id, c.id, Utc::now());
        db.insert_enrollment_if_absent(&e).await.unwrap();
        db.delete_enrollment(e.id).await.unwrap();
        assert!(db.get_enrollment(lead.id, c.id).await.unwrap().is_none());
        assert!(
            db.insert_enrollment_if_absent(&Enrollment::new(lead.id, c.id, Utc::now()))
                .await
                .unwrap()
        );
    }

    // ── Message tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn due_messages_ordered_and_limited() {
        let db = test_db().await;
        let (lead, c) = seeded(&db, "a@x.com").await;
        let now = Utc::now();

        let late = message_at(&lead, &c, now - Duration::minutes(1));
        let early = message_at(&lead, &c, now - Duration::hours(2));
        let future = message_at(&lead, &c, now + Duration::hours(1));
        for m in [&late, &early, &future] {
            db.insert_message(m).await.unwrap();
        }

        let due = db.due_messages(now, 10).await.unwrap();
        assert_eq!(due.iter().map(|m| m.id).collect::<Vec<_>>(), vec![early.id, late.id]);
        assert_eq!(db.due_messages(now, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mark_sent_only_from_scheduled() {
        let db = test_db().await;
        let (lead, c) = seeded(&db, "a@x.com").await;
        let m = message_at(&lead, &c, Utc::now());
        db.insert_message(&m).await.unwrap();

        assert!(db.mark_message_sent(m.id, Some("<abc@x>"), Utc::now()).await.unwrap());
        assert!(!db.mark_message_sent(m.id, Some("<def@x>"), Utc::now()).await.unwrap());

        let stored = db.get_message(m.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Sent);
        assert_eq!(stored.provider_message_id.as_deref(), Some("<abc@x>"));
        assert!(stored.sent_at.is_some());

        assert!(
            db.transition_message(m.id, MessageStatus::Replied, None)
                .await
                .unwrap()
        );
        assert!(
            !db.transition_message(m.id, MessageStatus::Canceled, Some("late"))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn cancel_scheduled_scoped_by_campaign() {
        let db = test_db().await;
        let (lead, c) = seeded(&db, "a@x.com").await;
        let other = campaign();
        db.insert_campaign(&other).await.unwrap();

        let m1 = message_at(&lead, &c, Utc::now());
        let m2 = message_at(&lead, &other, Utc::now());
        let sent = message_at(&lead, &c, Utc::now());
        for m in [&m1, &m2, &sent] {
            db.insert_message(m).await.unwrap();
        }
        db.mark_message_sent(sent.id, None, Utc::now()).await.unwrap();

        let n = db
            .cancel_scheduled_messages(lead.id, Some(c.id), "Canceled due to reply")
            .await
            .unwrap();
        assert_eq!(n, 1);
        let stored = db.get_message(m1.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Canceled);
        assert_eq!(stored.error.as_deref(), Some("Canceled due to reply"));
        assert_eq!(
            db.get_message(sent.id).await.unwrap().unwrap().status,
            MessageStatus::Sent
        );

        let n = db
            .cancel_scheduled_messages(lead.id, None, "Canceled due to unsubscribe")
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(
            db.get_message(m2.id).await.unwrap().unwrap().status,
            MessageStatus::Canceled
        );
    }

    #[tokio::test]
    async fn latest_sent_and_provider_lookup() {
        let db = test_db().await;
        let (lead, c) = seeded(&db, "a@x.com").await;
        let old = message_at(&lead, &c, Utc::now());
        let recent = message_at(&lead, &c, Utc::now());
        db.insert_message(&old).await.unwrap();
        db.insert_message(&recent).await.unwrap();
        db.mark_message_sent(old.id, Some("old-id"), Utc::now() - Duration::days(3))
            .await
            .unwrap();
        db.mark_message_sent(recent.id, Some("new-id"), Utc::now())
            .await
            .unwrap();

        assert_eq!(db.latest_sent_message(lead.id).await.unwrap().unwrap().id, recent.id);
        assert_eq!(
            db.find_message_by_provider_id(lead.id, "old-id")
                .await
                .unwrap()
                .unwrap()
                .id,
            old.id
        );
        assert!(
            db.find_message_by_provider_id(Uuid::new_v4(), "old-id")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn reschedule_only_from_failed() {
        let db = test_db().await;
        let (lead, c) = seeded(&db, "a@x.com").await;
        let m = message_at(&lead, &c, Utc::now());
        db.insert_message(&m).await.unwrap();

        let later = Utc::now() + Duration::hours(5);
        assert!(!db.reschedule_message(m.id, later).await.unwrap());

        db.transition_message(m.id, MessageStatus::Failed, Some("smtp down"))
            .await
            .unwrap();
        assert!(db.reschedule_message(m.id, later).await.unwrap());

        let stored = db.get_message(m.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Scheduled);
        assert!(stored.error.is_none());
        assert_eq!(ts(stored.scheduled_for), ts(later));
    }

    // ── Reply + unsubscribe tests ───────────────────────────────────

    #[tokio::test]
    async fn reply_round_trip() {
        let db = test_db().await;
        let (lead, c) = seeded(&db, "a@x.com").await;
        let reply = Reply {
            id: Uuid::new_v4(),
            lead_id: lead.id,
            campaign_id: Some(c.id),
            message_id: None,
            received_at: Utc::now(),
            from_email: "a@x.com".into(),
            subject: "Re: Hi".into(),
            body: "Sounds good".into(),
            sentiment: Sentiment::Positive,
            raw: Some(serde_json::json!({"provider": "test"})),
        };
        db.insert_reply(&reply).await.unwrap();

        let stored = db.replies_for_lead(lead.id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].sentiment, Sentiment::Positive);
        assert_eq!(stored[0].campaign_id, Some(c.id));
        assert_eq!(stored[0].raw.as_ref().unwrap()["provider"], "test");
    }

    #[tokio::test]
    async fn unsubscribe_upsert() {
        let db = test_db().await;
        db.add_unsubscribe("A@x.com", Some("link"), Utc::now())
            .await
            .unwrap();
        db.add_unsubscribe("a@x.com", None, Utc::now()).await.unwrap();
        assert!(db.is_unsubscribed("a@X.COM").await.unwrap());
        assert!(!db.is_unsubscribed("b@x.com").await.unwrap());
        assert!(db.add_unsubscribe(" ", None, Utc::now()).await.is_err());
    }

    // ── Metrics tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn campaign_and_dashboard_counts() {
        let db = test_db().await;
        let mut lead = Lead::new("Acme", "Jane").with_email("a@x.com");
        lead.stage = LeadStage::Booked;
        db.insert_lead(&lead).await.unwrap();
        let c = campaign();
        db.insert_campaign(&c).await.unwrap();
        db.insert_enrollment_if_absent(&Enrollment::new(lead.id, c.id, Utc::now()))
            .await
            .unwrap();
        let m = message_at(&lead, &c, Utc::now());
        let queued = message_at(&lead, &c, Utc::now() + Duration::days(1));
        db.insert_message(&m).await.unwrap();
        db.insert_message(&queued).await.unwrap();
        db.mark_message_sent(m.id, None, Utc::now()).await.unwrap();

        let counts = db.campaign_counts(c.id).await.unwrap();
        assert_eq!(counts.enrollments, 1);
        assert_eq!(counts.leads, 1);
        assert_eq!(counts.booked_leads, 1);
        assert_eq!(counts.messages_by_status[&MessageStatus::Sent], 1);
        assert_eq!(counts.messages_by_status[&MessageStatus::Scheduled], 1);
        assert!(counts.replies_by_sentiment.is_empty());

        let empty = db.campaign_counts(Uuid::new_v4()).await.unwrap();
        assert_eq!(empty, CampaignCounts::default());

        let dash = db
            .dashboard_counts(Utc::now() - Duration::hours(1), Utc::now() - Duration::days(7))
            .await
            .unwrap();
        assert_eq!(dash.total_leads, 1);
        assert_eq!(dash.active_leads, 0);
        assert_eq!(dash.booked_leads, 1);
        assert_eq!(dash.active_enrollments, 1);
        assert_eq!(dash.scheduled_messages, 1);
        assert_eq!(dash.messages_sent_since, 1);
        assert_eq!(dash.running_campaigns, 0);

        let dist = db.lead_stage_distribution().await.unwrap();
        assert_eq!(dist.get(&LeadStage::Booked), Some(&1));
        assert_eq!(dist.get(&LeadStage::New), None);
    }

    #[tokio::test]
    async fn local_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("outreach.db");
        let lead = Lead::new("Acme", "Jane").with_email("jane@acme.com");
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.insert_lead(&lead).await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(db.get_lead(lead.id).await.unwrap().is_some());
    }
}
