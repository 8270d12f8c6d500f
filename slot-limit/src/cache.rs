use std::sync::Arc;
use std::time::Duration;

use crate::Scope;
use crate::SlotConfig;
use crate::SlotStore;
use crate::StoreError;
use crate::config::clamp_ttl_secs;
use crate::config::normalize_ttl_minutes;
use crate::keys::slot_key;
use crate::keys::wait_queue_key;

/// Per-account and per-user concurrency slots plus per-user wait counters.
///
/// The cache holds no mutable state of its own: just a handle to the store and the TTL.
/// Any number of caches, in any number of processes, may point at the same store.
///
/// `Ok(false)` means "checked and denied"; `Err(_)` means "could not check". Callers
/// must not treat one as the other.
#[derive(Debug)]
pub struct ConcurrencyCache<S>
where
    S: ?Sized,
{
    store: Arc<S>,
    ttl: Duration,
}

impl<S> Clone for ConcurrencyCache<S>
where
    S: ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            ttl: self.ttl,
        }
    }
}

impl<S> ConcurrencyCache<S>
where
    S: SlotStore + ?Sized,
{
    /// Creates a cache whose slots and keys live for `slot_ttl_minutes`.
    ///
    /// Zero or negative values select the 15 minute default.
    pub fn new(store: Arc<S>, slot_ttl_minutes: i64) -> Self {
        Self::with_ttl(store, normalize_ttl_minutes(slot_ttl_minutes))
    }

    pub fn from_config(store: Arc<S>, config: &SlotConfig) -> Self {
        Self::with_ttl(store, config.slot_ttl())
    }

    /// Creates a cache with an exact TTL. Stores work in whole seconds, so anything
    /// shorter than a second selects the default instead. The TTL is capped at
    /// [`MAX_SLOT_TTL_MINUTES`](crate::MAX_SLOT_TTL_MINUTES).
    pub fn with_ttl(store: Arc<S>, ttl: Duration) -> Self {
        let ttl = if ttl.as_secs() == 0 {
            normalize_ttl_minutes(0)
        } else {
            clamp_ttl_secs(ttl)
        };
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Sweeps stale slots of `scope_id`, then admits `request_id` if it already holds a
    /// slot or if fewer than `max_concurrency` slots remain.
    ///
    /// Re-acquiring with the same `request_id` refreshes the slot instead of taking a
    /// second one, which makes retries safe.
    pub async fn try_acquire_slot(
        &self,
        scope: Scope,
        scope_id: i64,
        max_concurrency: u32,
        request_id: &str,
    ) -> Result<bool, StoreError> {
        let key = slot_key(scope, scope_id);
        let granted = self
            .store
            .acquire(&key, max_concurrency, self.ttl, request_id)
            .await
            .inspect_err(|error| tracing::warn!(%key, request_id, %error, "slot acquire failed"))?;
        tracing::debug!(%key, request_id, max_concurrency, granted, "slot acquire");
        Ok(granted)
    }

    /// Releases the slot held by `request_id`. Releasing a slot that is not held, or that
    /// already expired, does nothing.
    pub async fn release_slot(
        &self,
        scope: Scope,
        scope_id: i64,
        request_id: &str,
    ) -> Result<(), StoreError> {
        let key = slot_key(scope, scope_id);
        self.store
            .release(&key, request_id)
            .await
            .inspect_err(|error| tracing::warn!(%key, request_id, %error, "slot release failed"))?;
        tracing::debug!(%key, request_id, "slot release");
        Ok(())
    }

    /// Sweeps stale slots of `scope_id` and returns how many remain.
    ///
    /// This prunes as a side effect. The value may be stale by the time it is returned
    /// if other callers are acquiring concurrently.
    pub async fn get_concurrency(&self, scope: Scope, scope_id: i64) -> Result<u64, StoreError> {
        let key = slot_key(scope, scope_id);
        self.store
            .count(&key, self.ttl)
            .await
            .inspect_err(|error| tracing::warn!(%key, %error, "slot count failed"))
    }

    pub async fn try_acquire_account_slot(
        &self,
        account_id: i64,
        max_concurrency: u32,
        request_id: &str,
    ) -> Result<bool, StoreError> {
        self.try_acquire_slot(Scope::Account, account_id, max_concurrency, request_id)
            .await
    }

    pub async fn release_account_slot(
        &self,
        account_id: i64,
        request_id: &str,
    ) -> Result<(), StoreError> {
        self.release_slot(Scope::Account, account_id, request_id)
            .await
    }

    pub async fn get_account_concurrency(&self, account_id: i64) -> Result<u64, StoreError> {
        self.get_concurrency(Scope::Account, account_id).await
    }

    pub async fn try_acquire_user_slot(
        &self,
        user_id: i64,
        max_concurrency: u32,
        request_id: &str,
    ) -> Result<bool, StoreError> {
        self.try_acquire_slot(Scope::User, user_id, max_concurrency, request_id)
            .await
    }

    pub async fn release_user_slot(&self, user_id: i64, request_id: &str) -> Result<(), StoreError> {
        self.release_slot(Scope::User, user_id, request_id).await
    }

    pub async fn get_user_concurrency(&self, user_id: i64) -> Result<u64, StoreError> {
        self.get_concurrency(Scope::User, user_id).await
    }

    /// Parks one more caller in the wait queue of `user_id`, unless `max_wait` callers
    /// are already parked.
    ///
    /// The counter's expiry is armed by the increment that creates it and never pushed
    /// back, so a lost decrement cannot block the queue for longer than one TTL.
    pub async fn increment_wait_count(&self, user_id: i64, max_wait: u32) -> Result<bool, StoreError> {
        let key = wait_queue_key(user_id);
        let granted = self
            .store
            .enter_wait(&key, max_wait, self.ttl)
            .await
            .inspect_err(|error| tracing::warn!(%key, %error, "wait queue increment failed"))?;
        tracing::debug!(%key, max_wait, granted, "wait queue increment");
        Ok(granted)
    }

    /// Removes one caller from the wait queue of `user_id`. Never goes below zero.
    pub async fn decrement_wait_count(&self, user_id: i64) -> Result<(), StoreError> {
        let key = wait_queue_key(user_id);
        self.store
            .leave_wait(&key)
            .await
            .inspect_err(|error| tracing::warn!(%key, %error, "wait queue decrement failed"))
    }

    /// The number of callers parked in the wait queue of `user_id`.
    pub async fn get_wait_count(&self, user_id: i64) -> Result<u64, StoreError> {
        let key = wait_queue_key(user_id);
        self.store
            .wait_count(&key)
            .await
            .inspect_err(|error| tracing::warn!(%key, %error, "wait queue read failed"))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use async_trait::async_trait;
    use more_asserts::assert_le;
    use quanta::Clock;

    use super::*;
    use crate::MemoryStore;

    fn mock_cache(ttl: Duration) -> (ConcurrencyCache<MemoryStore>, Arc<quanta::Mock>) {
        let (clock, mock) = Clock::mock();
        let cache = ConcurrencyCache::with_ttl(Arc::new(MemoryStore::with_clock(clock)), ttl);
        (cache, mock)
    }

    #[test]
    fn test_ttl_normalization() {
        let store = Arc::new(MemoryStore::new());
        assert_eq!(
            ConcurrencyCache::new(store.clone(), 0).ttl(),
            Duration::from_secs(900)
        );
        assert_eq!(
            ConcurrencyCache::new(store.clone(), -1).ttl(),
            Duration::from_secs(900)
        );
        assert_eq!(
            ConcurrencyCache::new(store.clone(), 2).ttl(),
            Duration::from_secs(120)
        );
        assert_eq!(
            ConcurrencyCache::with_ttl(store.clone(), Duration::from_millis(500)).ttl(),
            Duration::from_secs(900)
        );
        assert_eq!(
            ConcurrencyCache::with_ttl(store, Duration::from_millis(1500)).ttl(),
            Duration::from_secs(1)
        );
    }

    #[tokio::test]
    async fn test_oversized_ttl_is_capped() {
        let max = Duration::from_secs(crate::MAX_SLOT_TTL_MINUTES as u64 * 60);
        let store = Arc::new(MemoryStore::new());

        let cache = ConcurrencyCache::new(store.clone(), i64::MAX / 60);
        assert_eq!(cache.ttl(), max);
        assert!(cache.try_acquire_account_slot(1, 1, "A").await.unwrap());
        assert!(cache.increment_wait_count(1, 1).await.unwrap());
        assert_eq!(cache.get_account_concurrency(1).await.unwrap(), 1);

        let cache = ConcurrencyCache::with_ttl(store, Duration::MAX);
        assert_eq!(cache.ttl(), max);
        assert!(cache.try_acquire_user_slot(1, 1, "A").await.unwrap());
    }

    #[tokio::test]
    async fn scenario_release_frees_a_slot() {
        let (cache, _mock) = mock_cache(Duration::from_secs(60));

        assert!(cache.try_acquire_account_slot(1, 2, "A").await.unwrap());
        assert!(cache.try_acquire_account_slot(1, 2, "B").await.unwrap());
        assert!(!cache.try_acquire_account_slot(1, 2, "C").await.unwrap());

        cache.release_account_slot(1, "B").await.unwrap();
        assert!(cache.try_acquire_account_slot(1, 2, "C").await.unwrap());
        assert_eq!(cache.get_account_concurrency(1).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn scenario_wait_queue_of_one() {
        let (cache, _mock) = mock_cache(Duration::from_secs(60));

        assert!(cache.increment_wait_count(9, 1).await.unwrap());
        assert!(!cache.increment_wait_count(9, 1).await.unwrap());
        cache.decrement_wait_count(9).await.unwrap();
        assert!(cache.increment_wait_count(9, 1).await.unwrap());
    }

    #[tokio::test]
    async fn scenario_stale_slots_expire() {
        let (cache, mock) = mock_cache(Duration::from_secs(1));

        assert!(cache.try_acquire_user_slot(3, 1, "A").await.unwrap());
        mock.increment(Duration::from_millis(1100));

        assert_eq!(cache.get_user_concurrency(3).await.unwrap(), 0);
        assert!(cache.try_acquire_user_slot(3, 1, "B").await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_scope_key_disappears() {
        let (cache, mock) = mock_cache(Duration::from_secs(5));

        assert!(cache.try_acquire_account_slot(4, 3, "A").await.unwrap());
        assert!(cache.store().contains_key("concurrency:account:4"));

        mock.increment(Duration::from_secs(6));
        assert!(!cache.store().contains_key("concurrency:account:4"));
    }

    #[tokio::test]
    async fn test_scopes_are_independent() {
        let (cache, _mock) = mock_cache(Duration::from_secs(60));

        assert!(cache.try_acquire_account_slot(5, 1, "A").await.unwrap());
        assert!(cache.try_acquire_user_slot(5, 1, "B").await.unwrap());
        assert!(!cache.try_acquire_account_slot(5, 1, "B").await.unwrap());
        assert!(cache.try_acquire_account_slot(6, 1, "B").await.unwrap());

        assert_eq!(cache.get_account_concurrency(5).await.unwrap(), 1);
        assert_eq!(cache.get_user_concurrency(5).await.unwrap(), 1);
        assert_eq!(cache.get_wait_count(5).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_idempotent_reacquire_at_capacity() {
        let (cache, _mock) = mock_cache(Duration::from_secs(60));

        assert!(cache.try_acquire_user_slot(1, 1, "A").await.unwrap());
        for _ in 0..3 {
            assert!(cache.try_acquire_user_slot(1, 1, "A").await.unwrap());
        }
        assert_eq!(cache.get_user_concurrency(1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_limit_is_per_call() {
        let (cache, _mock) = mock_cache(Duration::from_secs(60));

        assert!(cache.try_acquire_account_slot(1, 3, "A").await.unwrap());
        assert!(cache.try_acquire_account_slot(1, 3, "B").await.unwrap());

        // A lower limit does not evict anyone, it just stops new admissions
        assert!(!cache.try_acquire_account_slot(1, 1, "C").await.unwrap());
        assert_eq!(cache.get_account_concurrency(1).await.unwrap(), 2);

        assert!(cache.try_acquire_account_slot(1, 3, "C").await.unwrap());
    }

    #[tokio::test]
    async fn test_idempotent_release() {
        let (cache, _mock) = mock_cache(Duration::from_secs(60));

        assert!(cache.try_acquire_account_slot(1, 5, "A").await.unwrap());
        assert!(cache.try_acquire_account_slot(1, 5, "B").await.unwrap());

        cache.release_account_slot(1, "A").await.unwrap();
        cache.release_account_slot(1, "A").await.unwrap();
        cache.release_account_slot(1, "never").await.unwrap();
        cache.release_account_slot(99, "never").await.unwrap();

        assert_eq!(cache.get_account_concurrency(1).await.unwrap(), 1);
        assert!(cache.try_acquire_account_slot(1, 1, "B").await.unwrap());
    }

    #[tokio::test]
    async fn test_decrement_absent_counter_is_noop() {
        let (cache, _mock) = mock_cache(Duration::from_secs(60));

        cache.decrement_wait_count(1).await.unwrap();
        assert_eq!(cache.get_wait_count(1).await.unwrap(), 0);

        assert!(cache.increment_wait_count(1, 3).await.unwrap());
        cache.decrement_wait_count(1).await.unwrap();
        cache.decrement_wait_count(1).await.unwrap();
        assert_eq!(cache.get_wait_count(1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_wait_counter_never_exceeds_limit() {
        let (cache, _mock) = mock_cache(Duration::from_secs(60));
        let cache = Arc::new(cache);

        let mut handles = vec![];
        for _ in 0..40 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.increment_wait_count(2, 10).await.unwrap()
            }));
        }
        let granted = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| matches!(r, Ok(true)))
            .count();

        assert_eq!(granted, 10);
        assert_eq!(cache.get_wait_count(2).await.unwrap(), 10);
        assert!(!cache.increment_wait_count(2, 10).await.unwrap());
        assert_eq!(cache.get_wait_count(2).await.unwrap(), 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_bounded_concurrency_under_churn() {
        let capacity = 8;
        let cache = ConcurrencyCache::new(Arc::new(MemoryStore::new()), 15);

        let mut handles = vec![];
        for task in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                let mut admitted = HashSet::new();
                for i in 0..50 {
                    let request_id = format!("{task}-{i}");
                    if cache
                        .try_acquire_account_slot(7, capacity, &request_id)
                        .await
                        .unwrap()
                    {
                        let in_flight = cache.get_account_concurrency(7).await.unwrap();
                        assert_le!(in_flight, u64::from(capacity));
                        admitted.insert(request_id.clone());
                        tokio::task::yield_now().await;
                        cache.release_account_slot(7, &request_id).await.unwrap();
                    }
                }
                admitted.len()
            }));
        }

        let admitted: usize = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .sum();

        assert!(admitted > 0);
        assert_eq!(cache.get_account_concurrency(7).await.unwrap(), 0);
    }

    /// A store that cannot be reached.
    #[derive(Debug)]
    struct BrokenStore;

    fn broken() -> StoreError {
        StoreError::WrongType {
            key: "unreachable".to_string(),
        }
    }

    #[async_trait]
    impl SlotStore for BrokenStore {
        async fn acquire(&self, _: &str, _: u32, _: Duration, _: &str) -> Result<bool, StoreError> {
            Err(broken())
        }

        async fn release(&self, _: &str, _: &str) -> Result<(), StoreError> {
            Err(broken())
        }

        async fn count(&self, _: &str, _: Duration) -> Result<u64, StoreError> {
            Err(broken())
        }

        async fn enter_wait(&self, _: &str, _: u32, _: Duration) -> Result<bool, StoreError> {
            Err(broken())
        }

        async fn leave_wait(&self, _: &str) -> Result<(), StoreError> {
            Err(broken())
        }

        async fn wait_count(&self, _: &str) -> Result<u64, StoreError> {
            Err(broken())
        }
    }

    #[tokio::test]
    async fn test_store_failures_are_not_denials() {
        let cache: ConcurrencyCache<dyn SlotStore> = ConcurrencyCache::new(Arc::new(BrokenStore), 15);

        assert!(cache.try_acquire_account_slot(1, 10, "A").await.is_err());
        assert!(cache.release_user_slot(1, "A").await.is_err());
        assert!(cache.get_user_concurrency(1).await.is_err());
        assert!(cache.increment_wait_count(1, 10).await.is_err());
        assert!(cache.decrement_wait_count(1).await.is_err());
        assert!(cache.get_account_concurrency(1).await.is_err());
        assert!(cache.get_wait_count(1).await.is_err());
    }
}
