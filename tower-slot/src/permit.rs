use slot_limit::ConcurrencyCache;
use slot_limit::Scope;
use slot_limit::SlotStore;
use slot_limit::StoreError;

use crate::SlotRequest;
use crate::WaitQueue;

/// A granted concurrency slot.
///
/// Release it with [`SlotPermit::release`]. If the permit is dropped instead (for instance
/// because the request future was cancelled) the release is spawned onto the current
/// Tokio runtime. Without a runtime the slot is left to expire with its TTL.
pub struct SlotPermit<St>
where
    St: SlotStore + ?Sized + 'static,
{
    cache: ConcurrencyCache<St>,
    scope: Scope,
    scope_id: i64,
    request_id: String,
    released: bool,
}

impl<St> SlotPermit<St>
where
    St: SlotStore + ?Sized + 'static,
{
    /// Makes a single admission attempt. `Ok(None)` means the scope is full.
    pub async fn try_acquire(
        cache: &ConcurrencyCache<St>,
        request: &SlotRequest,
    ) -> Result<Option<Self>, StoreError> {
        let granted = cache
            .try_acquire_slot(
                request.scope,
                request.scope_id,
                request.max_concurrency,
                &request.request_id,
            )
            .await?;

        Ok(granted.then(|| Self {
            cache: cache.clone(),
            scope: request.scope,
            scope_id: request.scope_id,
            request_id: request.request_id.clone(),
            released: false,
        }))
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Gives the slot back. Failures are logged: the TTL reclaims the slot eventually.
    pub async fn release(mut self) {
        self.released = true;
        // Errors are already logged by the cache
        let _ = self
            .cache
            .release_slot(self.scope, self.scope_id, &self.request_id)
            .await;
    }
}

impl<St> Drop for SlotPermit<St>
where
    St: SlotStore + ?Sized + 'static,
{
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                request_id = %self.request_id,
                "slot permit dropped outside a runtime; leaving it to expire"
            );
            return;
        };

        let cache = self.cache.clone();
        let scope = self.scope;
        let scope_id = self.scope_id;
        let request_id = std::mem::take(&mut self.request_id);
        handle.spawn(async move {
            let _ = cache.release_slot(scope, scope_id, &request_id).await;
        });
    }
}

/// Membership of a user's wait queue, left on [`WaitTicket::leave`] or on drop.
pub struct WaitTicket<St>
where
    St: SlotStore + ?Sized + 'static,
{
    cache: ConcurrencyCache<St>,
    user_id: i64,
    left: bool,
}

impl<St> WaitTicket<St>
where
    St: SlotStore + ?Sized + 'static,
{
    /// Joins the wait queue. `Ok(None)` means the queue is full.
    pub async fn enter(
        cache: &ConcurrencyCache<St>,
        queue: WaitQueue,
    ) -> Result<Option<Self>, StoreError> {
        let granted = cache
            .increment_wait_count(queue.user_id, queue.max_wait)
            .await?;

        Ok(granted.then(|| Self {
            cache: cache.clone(),
            user_id: queue.user_id,
            left: false,
        }))
    }

    pub async fn leave(mut self) {
        self.left = true;
        let _ = self.cache.decrement_wait_count(self.user_id).await;
    }
}

impl<St> Drop for WaitTicket<St>
where
    St: SlotStore + ?Sized + 'static,
{
    fn drop(&mut self) {
        if self.left {
            return;
        }
        // Without a runtime the counter's own expiry clears it
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let cache = self.cache.clone();
            let user_id = self.user_id;
            handle.spawn(async move {
                let _ = cache.decrement_wait_count(user_id).await;
            });
        }
    }
}
