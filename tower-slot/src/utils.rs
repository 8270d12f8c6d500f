use std::time::Duration;

use slot_limit::ConcurrencyCache;
use tower::ServiceBuilder;
use tower::layer::util::Stack;

use crate::SlotLayer;

/// Service Builder Extension with additional useful functions for tower::ServiceBuilder.
pub trait ServiceBuilderExt<L> {
    /// Add a fail-fast slot layer
    fn slot_limit<St, F>(
        self,
        cache: ConcurrencyCache<St>,
        classify: F,
    ) -> ServiceBuilder<Stack<SlotLayer<St, F>, L>>
    where
        St: ?Sized;

    /// Add a slot layer that waits up to `max_wait` for capacity
    fn waiting_slot_limit<St, F>(
        self,
        cache: ConcurrencyCache<St>,
        classify: F,
        max_wait: Duration,
    ) -> ServiceBuilder<Stack<SlotLayer<St, F>, L>>
    where
        St: ?Sized;
}

impl<L> ServiceBuilderExt<L> for ServiceBuilder<L> {
    fn slot_limit<St, F>(
        self,
        cache: ConcurrencyCache<St>,
        classify: F,
    ) -> ServiceBuilder<Stack<SlotLayer<St, F>, L>>
    where
        St: ?Sized,
    {
        self.layer(SlotLayer::new(cache, classify))
    }

    fn waiting_slot_limit<St, F>(
        self,
        cache: ConcurrencyCache<St>,
        classify: F,
        max_wait: Duration,
    ) -> ServiceBuilder<Stack<SlotLayer<St, F>, L>>
    where
        St: ?Sized,
    {
        self.layer(SlotLayer::new(cache, classify).with_max_wait(max_wait))
    }
}
