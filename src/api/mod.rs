//! HTTP + WebSocket surface.
//!
//! - `extract` — request context from headers, error responses
//! - `routes` — job REST endpoints and the job status socket

pub mod extract;
pub mod routes;

pub use extract::{ApiError, RequestContext};
pub use routes::{AppState, job_routes};
