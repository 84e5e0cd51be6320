//! Persistence layer: libSQL-backed storage for the outreach model.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{CampaignCounts, DashboardCounts, Database};
