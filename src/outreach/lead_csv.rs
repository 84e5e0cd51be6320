//! Lead CSV import and export.
//!
//! Header names match case-insensitively and may come in any order; only
//! `company` and `contactName` are required. Any bad row rejects the file.

use csv::{ReaderBuilder, Trim, Writer};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{CsvError, DatabaseError, Result};
use crate::outreach::model::{DEFAULT_LEAD_SCORE, Lead, is_valid_email, normalize_email};
use crate::store::Database;

/// Export column order.
pub const CSV_COLUMNS: [&str; 11] = [
    "company",
    "contactName",
    "role",
    "email",
    "phone",
    "website",
    "city",
    "industry",
    "score",
    "tags",
    "notes",
];

const REQUIRED_COLUMNS: [&str; 2] = ["company", "contactname"];

/// One parsed CSV row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeadRow {
    pub company: String,
    pub contact_name: String,
    pub role: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub city: Option<String>,
    pub industry: Option<String>,
    pub score: Option<i64>,
    pub tags: Vec<String>,
    pub notes: Option<String>,
}

impl LeadRow {
    pub fn into_lead(self) -> Lead {
        let mut lead = Lead::new(self.company, self.contact_name);
        lead.role = self.role;
        lead.email = self.email;
        lead.phone = self.phone;
        lead.website = self.website;
        lead.city = self.city;
        lead.industry = self.industry;
        lead.score = self.score.unwrap_or(DEFAULT_LEAD_SCORE);
        lead.tags = self.tags;
        lead.notes = self.notes;
        lead
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub imported: usize,
    /// Rows whose email already belongs to a lead.
    pub skipped: usize,
    pub errors: Vec<String>,
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(String::from)
}

/// Parse CSV text into rows. Errors from every bad row are collected and
/// returned together.
pub fn parse_leads_csv(input: &str) -> std::result::Result<Vec<LeadRow>, CsvError> {
    if input.trim().is_empty() {
        return Err(CsvError::Empty);
    }

    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .trim(Trim::All)
        .from_reader(input.trim().as_bytes());

    let headers: Vec<String> = reader.headers()?.iter().map(|h| h.to_lowercase()).collect();
    let missing: Vec<String> = REQUIRED_COLUMNS
        .iter()
        .filter(|c| !headers.iter().any(|h| h == *c))
        .map(|c| c.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(CsvError::MissingColumns(missing));
    }
    let column = |name: &str| headers.iter().position(|h| h == name);
    let idx = |name: &str| column(&name.to_lowercase());

    let mut rows = Vec::new();
    let mut errors = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record?;
        let line = record.position().map(|p| p.line()).unwrap_or(i as u64 + 2);

        if record.iter().all(|f| f.is_empty()) {
            continue;
        }
        if record.len() != headers.len() {
            errors.push(format!("Line {line}: Column count mismatch"));
            continue;
        }

        let get = |name: &str| non_empty(idx(name).and_then(|i| record.get(i)));

        let (Some(company), Some(contact_name)) = (get("company"), get("contactName")) else {
            errors.push(format!(
                "Line {line}: Missing required fields (company, contactName)"
            ));
            continue;
        };

        let score = match get("score") {
            Some(raw) => match raw.parse::<i64>() {
                Ok(s) => Some(s),
                Err(_) => {
                    errors.push(format!("Line {line}: Invalid score '{raw}'"));
                    continue;
                }
            },
            None => None,
        };

        let email = get("email").and_then(|e| normalize_email(&e));
        if let Some(e) = &email {
            if !is_valid_email(e) {
                errors.push(format!("Line {line}: Invalid email '{e}'"));
                continue;
            }
        }

        rows.push(LeadRow {
            company,
            contact_name,
            role: get("role"),
            email,
            phone: get("phone"),
            website: get("website"),
            city: get("city"),
            industry: get("industry"),
            score,
            tags: get("tags")
                .map(|t| {
                    t.split(';')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            notes: get("notes"),
        });
    }

    if errors.is_empty() {
        Ok(rows)
    } else {
        Err(CsvError::Rows(errors))
    }
}

/// Parse and insert leads, skipping emails that already exist. A lead whose
/// email is on the unsubscribe list comes in as do-not-contact.
pub async fn import_leads_csv(db: &dyn Database, input: &str) -> Result<ImportReport> {
    let rows = parse_leads_csv(input)?;
    let mut report = ImportReport::default();

    for row in rows {
        let company = row.company.clone();
        let mut lead = row.into_lead();

        if let Some(email) = lead.email.as_deref() {
            if db.find_lead_by_email(email).await?.is_some() {
                report.skipped += 1;
                continue;
            }
            if db.is_unsubscribed(email).await? {
                lead.do_not_contact = true;
            }
        }

        match db.insert_lead(&lead).await {
            Ok(()) => report.imported += 1,
            // Same email twice in one file.
            Err(DatabaseError::Constraint(_)) => report.skipped += 1,
            Err(e) => {
                warn!(company = %company, "Lead import failed: {e}");
                report.errors.push(format!("Failed to import {company}: {e}"));
            }
        }
    }

    info!(
        imported = report.imported,
        skipped = report.skipped,
        errors = report.errors.len(),
        "CSV import complete"
    );
    Ok(report)
}

/// Render leads as CSV in `CSV_COLUMNS` order, tags joined by `;`.
pub fn export_leads_csv(leads: &[Lead]) -> std::result::Result<String, CsvError> {
    let mut writer = Writer::from_writer(Vec::new());
    writer.write_record(CSV_COLUMNS)?;

    for lead in leads {
        let opt = |v: &Option<String>| v.clone().unwrap_or_default();
        writer.write_record([
            lead.company.clone(),
            lead.contact_name.clone(),
            opt(&lead.role),
            opt(&lead.email),
            opt(&lead.phone),
            opt(&lead.website),
            opt(&lead.city),
            opt(&lead.industry),
            lead.score.to_string(),
            lead.tags.join(";"),
            opt(&lead.notes),
        ])?;
    }

    let bytes = writer
        .into_inner()
        .map_err(|e| CsvError::Write(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| CsvError::Write(e.to_string()))
}
