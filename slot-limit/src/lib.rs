//! # slot-limit
//!
//! `slot-limit` bounds the number of in-flight requests per upstream account and per user,
//! across any number of processes, using nothing but atomic procedures executed by a shared
//! key-value store.
//!
//! ## Core Philosophy
//!
//! Counting in-flight requests with "read, compare, write" from many callers races. Here every
//! decision is folded into a single atomic procedure run by the store itself, so the store
//! serializes competing callers per key and no caller-side lock is ever taken.
//!
//! ## Key Concepts
//!
//! * **Slot Ledger**: one sorted set per scope. Members are request ids, scores are the
//!   admission time taken from the *store's* clock, never the caller's.
//! * **Wait Counter**: one bounded integer per user, counting callers parked before admission.
//! * **Lazy Expiry**: every operation sweeps stale members inline and keys carry their own
//!   expiry, eliminating the need for a background sweeper.
//! * **Store Trait**: a unified interface over the atomic procedures, implemented by
//!   [`RedisStore`] and the in-process [`MemoryStore`].
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use slot_limit::ConcurrencyCache;
//! use slot_limit::MemoryStore;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), slot_limit::StoreError> {
//! let cache = ConcurrencyCache::new(Arc::new(MemoryStore::new()), 15);
//!
//! if cache.try_acquire_account_slot(42, 10, "req-1").await? {
//!     // Request admitted, talk to the upstream account
//!     cache.release_account_slot(42, "req-1").await?;
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;

mod cache;
mod config;
mod error;
mod keys;
mod memory_store;
mod redis_store;

pub use cache::ConcurrencyCache;
pub use config::ConfigError;
pub use config::DEFAULT_SLOT_TTL_MINUTES;
pub use config::MAX_SLOT_TTL_MINUTES;
pub use config::SlotConfig;
pub use error::StoreError;
pub use keys::ACCOUNT_SLOT_KEY_PREFIX;
pub use keys::USER_SLOT_KEY_PREFIX;
pub use keys::WAIT_QUEUE_KEY_PREFIX;
pub use memory_store::MemoryStore;
pub use redis_store::RedisStore;

/// The dimension a slot ledger limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    /// A single upstream account.
    Account,
    /// A single calling user.
    User,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Account => f.write_str("account"),
            Scope::User => f.write_str("user"),
        }
    }
}

/// The atomic procedures a shared store must provide.
///
/// Every method is one round trip and one indivisible unit from the point of view of
/// other callers touching the same key. Time is always read by the store, which is why
/// only the `ttl` travels with the call.
///
/// Stores must be `Send` and `Sync` to allow sharing across tasks via `Arc`.
#[async_trait]
pub trait SlotStore: Debug + Send + Sync {
    /// Sweep stale members, then refresh `request_id` if present, or add it if the
    /// ledger holds fewer than `max_concurrency` members.
    ///
    /// Returns `false` when the ledger is full. Nothing is mutated beyond the sweep in
    /// that case.
    async fn acquire(
        &self,
        key: &str,
        max_concurrency: u32,
        ttl: Duration,
        request_id: &str,
    ) -> Result<bool, StoreError>;

    /// Remove `request_id` from the ledger. Absent members are ignored.
    async fn release(&self, key: &str, request_id: &str) -> Result<(), StoreError>;

    /// Sweep stale members and return how many remain.
    async fn count(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Increment the counter unless it already reached `max_wait`.
    ///
    /// The key expiry is set only when the counter becomes 1.
    async fn enter_wait(&self, key: &str, max_wait: u32, ttl: Duration)
    -> Result<bool, StoreError>;

    /// Decrement the counter if it is positive.
    async fn leave_wait(&self, key: &str) -> Result<(), StoreError>;

    /// Read the counter, treating an absent key as zero.
    async fn wait_count(&self, key: &str) -> Result<u64, StoreError>;
}
