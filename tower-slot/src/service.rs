use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use rand::Rng;
use slot_limit::ConcurrencyCache;
use slot_limit::SlotStore;
use slot_limit::StoreError;
use tower::BoxError;
use tower::Service;

use crate::SlotError;
use crate::SlotPermit;
use crate::SlotRequest;
use crate::WaitTicket;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(2);
const BACKOFF_MULTIPLIER: f64 = 1.5;
const BACKOFF_JITTER: f64 = 0.2;

#[derive(Clone, Debug)]
pub(crate) struct SlotServiceMetrics {
    granted: Counter<u64>,
    denied: Counter<u64>,
    wait_denied: Counter<u64>,
}

impl SlotServiceMetrics {
    fn new() -> Self {
        let meter = global::meter("slot_admission");
        Self {
            granted: meter.u64_counter("slot_granted").build(),
            denied: meter.u64_counter("slot_denied").build(),
            wait_denied: meter.u64_counter("wait_denied").build(),
        }
    }
}

/// Admits each request into a concurrency slot before calling the inner service, and
/// releases the slot once the inner future resolves.
pub struct SlotService<S, St, F>
where
    St: ?Sized,
{
    inner: S,
    cache: ConcurrencyCache<St>,
    classify: Arc<F>,
    max_wait: Option<Duration>,
    instruments: SlotServiceMetrics,
}

// Manually implement Clone so that St and F need not be Clone
impl<S, St, F> Clone for SlotService<S, St, F>
where
    S: Clone,
    St: ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            cache: self.cache.clone(),
            classify: Arc::clone(&self.classify),
            max_wait: self.max_wait,
            instruments: self.instruments.clone(),
        }
    }
}

impl<S, St, F> SlotService<S, St, F>
where
    St: ?Sized,
{
    pub fn new(inner: S, cache: ConcurrencyCache<St>, classify: Arc<F>) -> Self {
        Self {
            inner,
            cache,
            classify,
            max_wait: None,
            instruments: SlotServiceMetrics::new(),
        }
    }

    /// Wait up to `max_wait` for a slot instead of failing fast.
    ///
    /// While waiting the request is counted in the wait queue named by
    /// [`SlotRequest::wait_queue`], if any.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }
}

impl<S, St, F, Req> Service<Req> for SlotService<S, St, F>
where
    S: Service<Req, Error = BoxError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    St: SlotStore + ?Sized + 'static,
    F: Fn(&Req) -> SlotRequest + Send + Sync + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = BoxError;
    // We return a BoxFuture because admission is an async round trip to the store
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Slots are taken in call(): a slot must never be held by a request that is not
        // going to be sent.
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let request = (*self.classify)(&req);
        // The ready service goes into the future, the fresh clone must be polled again
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let cache = self.cache.clone();
        let max_wait = self.max_wait;
        let instruments = self.instruments.clone();

        Box::pin(async move {
            let permit = admit(&cache, &request, max_wait, &instruments).await?;
            let result = inner.call(req).await;
            permit.release().await;
            result
        })
    }
}

pub(crate) async fn admit<St>(
    cache: &ConcurrencyCache<St>,
    request: &SlotRequest,
    max_wait: Option<Duration>,
    instruments: &SlotServiceMetrics,
) -> Result<SlotPermit<St>, SlotError>
where
    St: SlotStore + ?Sized + 'static,
{
    let attributes = [KeyValue::new("scope", request.scope.to_string())];

    if let Some(permit) = SlotPermit::try_acquire(cache, request).await? {
        instruments.granted.add(1, &attributes);
        return Ok(permit);
    }

    let Some(max_wait) = max_wait else {
        instruments.denied.add(1, &attributes);
        tracing::debug!(request_id = %request.request_id, scope = %request.scope, "concurrency full");
        return Err(SlotError::ConcurrencyFull {
            scope: request.scope,
        });
    };

    let ticket = match request.wait_queue {
        Some(queue) => match WaitTicket::enter(cache, queue).await? {
            Some(ticket) => Some(ticket),
            None => {
                instruments.wait_denied.add(1, &attributes);
                tracing::debug!(user_id = queue.user_id, "wait queue full");
                return Err(SlotError::WaitQueueFull);
            }
        },
        None => None,
    };

    let waited = tokio::time::timeout(max_wait, wait_for_slot(cache, request)).await;
    if let Some(ticket) = ticket {
        ticket.leave().await;
    }

    match waited {
        Ok(Ok(permit)) => {
            instruments.granted.add(1, &attributes);
            Ok(permit)
        }
        Ok(Err(err)) => Err(err.into()),
        Err(_) => {
            instruments.denied.add(1, &attributes);
            tracing::debug!(request_id = %request.request_id, ?max_wait, "timed out waiting for a slot");
            Err(SlotError::Timeout)
        }
    }
}

async fn wait_for_slot<St>(
    cache: &ConcurrencyCache<St>,
    request: &SlotRequest,
) -> Result<SlotPermit<St>, StoreError>
where
    St: SlotStore + ?Sized + 'static,
{
    let mut backoff = INITIAL_BACKOFF;
    loop {
        tokio::time::sleep(jitter(backoff)).await;
        if let Some(permit) = SlotPermit::try_acquire(cache, request).await? {
            return Ok(permit);
        }
        backoff = backoff.mul_f64(BACKOFF_MULTIPLIER).min(MAX_BACKOFF);
    }
}

fn jitter(backoff: Duration) -> Duration {
    let factor = rand::rng().random_range(1.0 - BACKOFF_JITTER..=1.0 + BACKOFF_JITTER);
    backoff.mul_f64(factor)
}
