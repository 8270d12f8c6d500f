use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::one::RefMut;
use quanta::Clock;
use quanta::Instant;

use crate::SlotStore;
use crate::StoreError;

/// Every this many procedures, expired keys of the whole map are dropped.
const PURGE_INTERVAL: u64 = 1024;

#[derive(Debug)]
enum Value {
    /// Placeholder for a key that does not exist as far as callers can tell.
    Vacant,
    /// request id -> admission second
    Ledger(HashMap<String, i64>),
    Counter(i64),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn vacant() -> Self {
        Self {
            value: Value::Vacant,
            expires_at: None,
        }
    }

    /// Expired keys and empty ledgers are indistinguishable from missing keys.
    fn is_absent(&self, now: Instant) -> bool {
        if self.expires_at.is_some_and(|at| at <= now) {
            return true;
        }
        match &self.value {
            Value::Vacant => true,
            Value::Ledger(members) => members.is_empty(),
            Value::Counter(_) => false,
        }
    }
}

/// An in-process store with the same observable behaviour as [`RedisStore`](crate::RedisStore).
///
/// Each key is guarded by its `DashMap` shard lock for the whole procedure, which gives the
/// same per-key serialization Redis gives scripts. Keys expire lazily on access, sorted
/// sets vanish with their last member and scores are whole seconds of the store clock.
/// Keys nobody touches again are purged every few procedures, or on
/// [`MemoryStore::purge_expired`].
///
/// State is process-scoped: use it for tests, benchmarks and single-instance deployments.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    clock: Clock,
    anchor: Instant,
    procedures: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Clock::new())
    }

    /// Creates a store reading time from `clock`.
    ///
    /// Pass a clock from [`Clock::mock`] to drive time by hand.
    pub fn with_clock(clock: Clock) -> Self {
        let anchor = clock.now();
        Self {
            entries: DashMap::new(),
            clock,
            anchor,
            procedures: AtomicU64::new(0),
        }
    }

    /// Whether `key` currently exists, applying expiry.
    pub fn contains_key(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.entries
            .get(key)
            .is_some_and(|entry| !entry.is_absent(now))
    }

    fn now_secs(&self, now: Instant) -> i64 {
        now.duration_since(self.anchor).as_secs() as i64
    }

    /// Locks `key` for the duration of a procedure, resetting it if it has expired.
    fn lock(&self, key: &str, now: Instant) -> RefMut<'_, String, Entry> {
        let mut entry = self
            .entries
            .entry(key.to_owned())
            .or_insert_with(Entry::vacant);
        if entry.is_absent(now) {
            *entry = Entry::vacant();
        }
        entry
    }

    /// Drops `key` if the last procedure left it empty. Must not be called while holding
    /// the lock on `key`.
    fn reap(&self, key: &str, now: Instant) {
        self.entries.remove_if(key, |_, entry| entry.is_absent(now));

        let done = self.procedures.fetch_add(1, Ordering::Relaxed) + 1;
        if done % PURGE_INTERVAL == 0 {
            self.purge_at(now);
        }
    }

    /// Drops every expired or empty key.
    pub fn purge_expired(&self) {
        self.purge_at(self.clock.now());
    }

    fn purge_at(&self, now: Instant) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_absent(now));
        tracing::trace!(purged = before.saturating_sub(self.entries.len()), "memory store purge");
    }
}

fn ttl_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)
}

fn sweep(members: &mut HashMap<String, i64>, expire_before: i64) {
    members.retain(|_, admitted| *admitted > expire_before);
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType {
        key: key.to_owned(),
    }
}

#[async_trait]
impl SlotStore for MemoryStore {
    async fn acquire(
        &self,
        key: &str,
        max_concurrency: u32,
        ttl: Duration,
        request_id: &str,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let now_secs = self.now_secs(now);
        let expire_before = now_secs.saturating_sub(ttl_secs(ttl));

        let granted = {
            let mut entry = self.lock(key, now);
            if matches!(entry.value, Value::Vacant) {
                entry.value = Value::Ledger(HashMap::new());
            }
            let Value::Ledger(members) = &mut entry.value else {
                return Err(wrong_type(key));
            };

            sweep(members, expire_before);

            let granted = members.contains_key(request_id)
                || (members.len() as u64) < u64::from(max_concurrency);
            if granted {
                members.insert(request_id.to_owned(), now_secs);
                // Beyond the clock's range the key never expires
                entry.expires_at = now.checked_add(ttl);
            }
            granted
        };

        self.reap(key, now);
        Ok(granted)
    }

    async fn release(&self, key: &str, request_id: &str) -> Result<(), StoreError> {
        let now = self.clock.now();
        {
            let mut entry = self.lock(key, now);
            match &mut entry.value {
                Value::Vacant => {}
                Value::Ledger(members) => {
                    members.remove(request_id);
                }
                Value::Counter(_) => return Err(wrong_type(key)),
            }
        }
        self.reap(key, now);
        Ok(())
    }

    async fn count(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let expire_before = self.now_secs(now).saturating_sub(ttl_secs(ttl));

        let count = {
            let mut entry = self.lock(key, now);
            match &mut entry.value {
                Value::Vacant => 0,
                Value::Ledger(members) => {
                    sweep(members, expire_before);
                    members.len() as u64
                }
                Value::Counter(_) => return Err(wrong_type(key)),
            }
        };

        self.reap(key, now);
        Ok(count)
    }

    async fn enter_wait(
        &self,
        key: &str,
        max_wait: u32,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();

        let granted = {
            let mut entry = self.lock(key, now);
            let current = match entry.value {
                Value::Vacant => 0,
                Value::Counter(current) => current,
                Value::Ledger(_) => return Err(wrong_type(key)),
            };

            if current >= i64::from(max_wait) {
                false
            } else {
                let next = current + 1;
                entry.value = Value::Counter(next);
                // Only the creating increment arms the expiry
                if next == 1 {
                    entry.expires_at = now.checked_add(ttl);
                }
                true
            }
        };

        self.reap(key, now);
        Ok(granted)
    }

    async fn leave_wait(&self, key: &str) -> Result<(), StoreError> {
        let now = self.clock.now();
        {
            let mut entry = self.lock(key, now);
            match &mut entry.value {
                Value::Vacant => {}
                Value::Counter(current) => {
                    if *current > 0 {
                        *current -= 1;
                    }
                }
                Value::Ledger(_) => return Err(wrong_type(key)),
            }
        }
        self.reap(key, now);
        Ok(())
    }

    async fn wait_count(&self, key: &str) -> Result<u64, StoreError> {
        let now = self.clock.now();
        let Some(entry) = self.entries.get(key) else {
            return Ok(0);
        };
        if entry.is_absent(now) {
            return Ok(0);
        }
        match entry.value {
            Value::Counter(current) => Ok(current.max(0) as u64),
            Value::Vacant => Ok(0),
            Value::Ledger(_) => Err(wrong_type(key)),
        }
    }
}
