//! Notification channel.
//!
//! - `model` — job events and the WebSocket wire frames
//! - `hub` — per-job subscriber registry with bounded, non-blocking fan-out
//! - `ws` — the per-connection socket loop with heartbeat

pub mod hub;
pub mod model;
pub mod ws;

pub use hub::{NotificationHub, Subscription};
pub use model::{ClientAction, JobEvent, ServerFrame};
