use slot_limit::Scope;
use slot_limit::StoreError;

/// Errors produced by the Tower Slot middleware stack.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SlotError {
    /// Every concurrency slot of the scope is taken.
    ///
    /// When the `axum` feature is enabled, this converts to `429 Too Many Requests`.
    #[error("Concurrency limit reached for {scope}")]
    ConcurrencyFull {
        /// The scope that ran out of slots.
        scope: Scope,
    },

    /// Too many requests of this user are already waiting for a slot.
    ///
    /// When the `axum` feature is enabled, this converts to `429 Too Many Requests`.
    #[error("Too many pending requests; wait queue is full")]
    WaitQueueFull,

    /// The request waited for a slot longer than the configured maximum.
    ///
    /// When the `axum` feature is enabled, this converts to `408 Request Timeout`.
    #[error("Request timed out waiting for a concurrency slot")]
    Timeout,

    /// The slot store could not be consulted. Nothing is known about capacity.
    ///
    /// When the `axum` feature is enabled, this converts to `503 Service Unavailable`.
    #[error("Slot store unavailable: {0}")]
    Store(String),

    /// An unexpected error occurred in the inner service.
    ///
    /// The string contains the `Display` representation of the inner error.
    /// When the `axum` feature is enabled, this converts to `500 Internal Server Error`.
    #[error("Internal service error: {0}")]
    Inner(String),
}

impl From<StoreError> for SlotError {
    fn from(err: StoreError) -> Self {
        Self::Store(err.to_string())
    }
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for SlotError {
    fn into_response(self) -> axum::response::Response {
        use http::StatusCode;

        let status = match self {
            Self::ConcurrencyFull { .. } | Self::WaitQueueFull => StatusCode::TOO_MANY_REQUESTS,
            Self::Timeout => StatusCode::REQUEST_TIMEOUT,
            Self::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Inner(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, self.to_string()).into_response()
    }
}
