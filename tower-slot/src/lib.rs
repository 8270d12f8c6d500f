//! # Tower Slot
//!
//! `tower-slot` puts the distributed concurrency slots of [`slot_limit`] in front of any
//! [Tower](https://github.com/tower-rs/tower) service.
//!
//! ## The Admission Stack
//! Every request is classified into a [`SlotRequest`] (scope, limit and request id). The
//! service then:
//!
//! 1. **Admits**: takes a slot in the scope's ledger, or rejects with
//!    `SlotError::ConcurrencyFull` when failing fast.
//! 2. **Waits** (optional): parks the request in its user's bounded wait queue and retries
//!    with jittered backoff, failing with `SlotError::WaitQueueFull` or `SlotError::Timeout`.
//! 3. **Releases**: gives the slot back once the inner future resolves, or in the
//!    background if the request is cancelled.
//!
//! The [`ManagedSlotLayer`] composes all three and maps every error into [`SlotError`].
//!
//! ## Feature Flags
//!
//! - `axum`: Enables `IntoResponse` for [`SlotError`], allowing automatic conversion
//!   to HTTP status codes (429, 408, 503, 500).

mod error;
mod layer;
mod managed_layer;
mod permit;
mod request;
mod service;
mod utils;


pub use error::SlotError;
pub use layer::SlotLayer;
pub use managed_layer::ManagedSlotLayer;
pub use permit::SlotPermit;
pub use permit::WaitTicket;
pub use request::SlotRequest;
pub use request::WaitQueue;
pub use service::SlotService;
pub use utils::ServiceBuilderExt;
