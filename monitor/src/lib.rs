//! Deployment Monitor Library
//!
//! Execution engine that drives deployment requests through their lifecycle,
//! coordinating redundant monitor instances through a distributed lock.

pub mod app;
pub mod authn;
pub mod errors;
pub mod events;
pub mod filesys;
pub mod http;
pub mod lock;
pub mod logs;
pub mod models;
pub mod persistence;
pub mod processor;
pub mod runner;
pub mod server;
pub mod storage;
pub mod utils;
pub mod workers;
