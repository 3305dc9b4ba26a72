//! Persistence layer — libSQL-backed durable storage for jobs.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::{JobTransition, LibSqlBackend};
pub use traits::JobStore;
