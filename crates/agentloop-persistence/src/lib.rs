//! Durable [`SessionStore`] implementations.
//!
//! ## Available stores
//!
//! - **Files** ([`FileSessionStore`]): one JSONL event log per thread in a
//!   local directory. Always available.
//! - **Redis** ([`RedisSessionStore`]): event lists plus a sorted index, with
//!   optional TTL. Behind the `redis` feature.
//!
//! [`InMemorySessionStore`] lives in `agentloop-core` and is re-exported here.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use agentloop_persistence::{FileSessionStore, SessionStore};
//!
//! let store: Arc<dyn SessionStore> = Arc::new(FileSessionStore::new(".agentloop/sessions"));
//! ```

pub mod file_store;

#[cfg(feature = "redis")]
pub mod redis_store;

pub use file_store::FileSessionStore;

#[cfg(feature = "redis")]
pub use redis_store::{RedisSessionStore, RedisSessionStoreBuilder};

pub use agentloop_core::persistence::{
    InMemorySessionStore, Session, SessionEvent, SessionStore, SessionSummary, ThreadId,
};
