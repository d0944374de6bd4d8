//! Data models

pub mod event;
pub mod request;
pub mod result;
