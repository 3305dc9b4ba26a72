//! Worker system — job handlers and the dispatcher that runs them.
//!
//! - `handler` — `JobHandler` trait, per-execution context, handler registry
//! - `dispatcher` — submission, bounded worker pool, timeouts, cancellation
//! - `builtin` — handlers for the built-in job types
//! - `embedding` — `Embedder` trait and the local hashing embedder

pub mod builtin;
pub mod dispatcher;
pub mod embedding;
pub mod handler;

pub use dispatcher::{Delegation, Dispatcher, SubmitOptions, SubmitOutcome};
pub use embedding::{Embedder, HashingEmbedder};
pub use handler::{ExecutionContext, HandlerRegistry, JobHandler};
