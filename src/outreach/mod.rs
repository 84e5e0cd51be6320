//! Outreach sequencing: enrollment, sending, replies, suppression.

pub mod authoring;
pub mod enrollment;
pub mod lead_csv;
pub mod metrics;
pub mod model;
pub mod replies;
pub mod reschedule;
pub mod unsubscribe;
pub mod worker;

pub use authoring::{NewCampaign, NewStep, StepWarning, create_campaign};
pub use enrollment::{EnrollmentReport, EnrollmentService};
pub use lead_csv::{ImportReport, export_leads_csv, import_leads_csv, parse_leads_csv};
pub use metrics::{CampaignMetrics, DashboardMetrics};
pub use replies::{InboundEmail, ProcessedReply, ReplyHandler, ReplyOutcome};
pub use reschedule::reschedule_failed;
pub use unsubscribe::{UnsubscribeOutcome, UnsubscribeService};
pub use worker::{SendReport, SendWorker};
