//! Deployment API access

pub mod client;
pub mod requests;
