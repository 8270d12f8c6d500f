use std::sync::Arc;
use std::time::Duration;

use slot_limit::ConcurrencyCache;
use tower::Layer;

use crate::service::SlotService;

/// Applies concurrency slot admission to requests.
///
/// `classify` maps each request to the scope, limit and request id it is admitted under.
pub struct SlotLayer<St, F>
where
    St: ?Sized,
{
    cache: ConcurrencyCache<St>,
    classify: Arc<F>,
    max_wait: Option<Duration>,
}

impl<St, F> Clone for SlotLayer<St, F>
where
    St: ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            classify: Arc::clone(&self.classify),
            max_wait: self.max_wait,
        }
    }
}

impl<St, F> SlotLayer<St, F>
where
    St: ?Sized,
{
    /// Create a SlotLayer that fails fast with `SlotError::ConcurrencyFull`.
    pub fn new(cache: ConcurrencyCache<St>, classify: F) -> Self {
        SlotLayer {
            cache,
            classify: Arc::new(classify),
            max_wait: None,
        }
    }

    /// Wait up to `max_wait` for a slot, retrying with jittered exponential backoff.
    ///
    /// If the total wait exceeds this duration, the service will return
    /// `SlotError::Timeout`.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }
}

impl<St, F, S> Layer<S> for SlotLayer<St, F>
where
    St: ?Sized,
{
    type Service = SlotService<S, St, F>;

    fn layer(&self, service: S) -> Self::Service {
        let svc = SlotService::new(service, self.cache.clone(), Arc::clone(&self.classify));
        match self.max_wait {
            Some(max_wait) => svc.with_max_wait(max_wait),
            None => svc,
        }
    }
}
