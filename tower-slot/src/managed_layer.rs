use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use slot_limit::ConcurrencyCache;
use slot_limit::SlotStore;
use tower::BoxError;
use tower::Layer;
use tower::Service;
use tower::util::BoxCloneSyncService;

use crate::SlotError;
use crate::SlotRequest;
use crate::service::SlotService;

/// A pre-composed admission stack for dispatchers.
///
/// Each request is first tried against its slot ledger. If the scope is full the request
/// joins its user's wait queue (when [`SlotRequest::wait_queue`] is set) and retries with
/// jittered backoff for up to `max_wait`.
///
/// ### Error Responsibilities:
/// - **`SlotError::WaitQueueFull`**: too many requests of the user are already parked.
/// - **`SlotError::Timeout`**: no slot freed up within `max_wait`.
/// - **`SlotError::Store`**: the store could not be reached.
/// - **`SlotError::Inner`**: any error of the inner service.
pub struct ManagedSlotLayer<St, F, Req>
where
    St: ?Sized,
{
    cache: ConcurrencyCache<St>,
    classify: Arc<F>,
    max_wait: Duration,
    _phantom: PhantomData<fn(Req)>,
}

// Note: Deriving Clone causes issues when using the layer with Axum.
// We'll just implemented it explicitly.
impl<St, F, Req> Clone for ManagedSlotLayer<St, F, Req>
where
    St: ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            classify: Arc::clone(&self.classify),
            max_wait: self.max_wait,
            _phantom: PhantomData,
        }
    }
}

impl<S, St, F, Req> Layer<S> for ManagedSlotLayer<St, F, Req>
where
    St: SlotStore + ?Sized + 'static,
    F: Fn(&Req) -> SlotRequest + Send + Sync + 'static,
    S: Service<Req, Error = BoxError> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    Req: Send + 'static,
{
    type Service = BoxCloneSyncService<Req, S::Response, BoxError>;

    fn layer(&self, inner: S) -> Self::Service {
        let svc = SlotService::new(inner, self.cache.clone(), Arc::clone(&self.classify))
            .with_max_wait(self.max_wait);

        // Map the mixed errors into SlotError
        let mapped_svc = tower::util::MapErr::new(svc, |err: BoxError| {
            if err.is::<SlotError>() {
                err
            } else {
                // Wrap any other inner service errors
                Box::from(SlotError::Inner(err.to_string()))
            }
        });

        BoxCloneSyncService::new(mapped_svc)
    }
}

impl<St, F, Req> ManagedSlotLayer<St, F, Req>
where
    St: ?Sized,
{
    pub fn new(cache: ConcurrencyCache<St>, classify: F, max_wait: Duration) -> Self {
        Self {
            cache,
            classify: Arc::new(classify),
            max_wait,
            _phantom: PhantomData,
        }
    }
}
