//! Outreach engine: multi-step cold email sequences with reply-aware
//! stopping and suppression.

pub mod config;
pub mod error;
pub mod mailer;
pub mod outreach;
pub mod security;
pub mod sentiment;
pub mod server;
pub mod store;
pub mod templating;
