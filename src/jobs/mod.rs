//! Job registry.
//!
//! - `model` — Job record and its state machine (queued → processing → terminal)
//! - `memo` — canonical params hashing for result memoization
//! - `registry` — durable + cached job records, single-writer status updates

pub mod memo;
pub mod model;
pub mod registry;

pub use model::{Job, JobStatus, JobType, JobUpdate};
pub use registry::JobRegistry;
