//! Shared job store for suiteq builds.
//!
//! All build state lives in a shared key-value store. Every operation that
//! must happen exactly once (reservation, requeue, election, lease reclaim,
//! worker removal) is a single atomic round-trip, so workers never need to
//! coordinate with each other directly.
//!
//! Two backends implement [`JobStore`]:
//! - [`RedisJobStore`] (production, Lua scripts)
//! - [`MemoryJobStore`] (tests and single-host runs)

pub mod error;
pub mod fingerprint;
pub mod keys;
pub mod memory;
pub mod redis_store;
mod scripts;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use keys::BuildKeys;
pub use memory::{MemoryBackend, MemoryJobStore};
pub use redis_store::RedisJobStore;
pub use store::{BuildStatus, BuildTimestamps, JobStore, LostJob};
