//! Job orchestrator — multi-tenant async job core.

pub mod api;
pub mod cache;
pub mod config;
pub mod context;
pub mod delegation;
pub mod envelope;
pub mod error;
pub mod jobs;
pub mod notify;
pub mod retry;
pub mod store;
pub mod worker;
