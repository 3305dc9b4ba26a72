//! Cache-aside layer.
//!
//! - `ttl` — data types and their expiry tiers
//! - `key` — tenant-first compound keys
//! - `store` — the fast store trait and its in-memory implementation
//! - `aside` — cache → durable → generate protocol and coordinated invalidation

pub mod aside;
pub mod key;
pub mod store;
pub mod ttl;

pub use aside::{CacheAside, CacheMetrics, CacheSource, Fetcher, Generator, InvalidationReport};
pub use key::CacheKey;
pub use store::{FastStore, InMemoryFastStore};
pub use ttl::{DataType, TtlPolicy, TtlTier};
