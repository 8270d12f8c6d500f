use slot_limit::Scope;

/// The admission parameters of one request, produced by the layer's classifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotRequest {
    pub scope: Scope,
    pub scope_id: i64,
    pub max_concurrency: u32,
    /// Unique per request. Reusing an id re-acquires (refreshes) the same slot.
    pub request_id: String,
    /// Gate waiting on the wait queue of a user. Only consulted when the layer is allowed
    /// to wait.
    pub wait_queue: Option<WaitQueue>,
}

/// A user's wait queue and its depth.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitQueue {
    pub user_id: i64,
    pub max_wait: u32,
}

impl SlotRequest {
    pub fn account(account_id: i64, max_concurrency: u32, request_id: impl Into<String>) -> Self {
        Self {
            scope: Scope::Account,
            scope_id: account_id,
            max_concurrency,
            request_id: request_id.into(),
            wait_queue: None,
        }
    }

    pub fn user(user_id: i64, max_concurrency: u32, request_id: impl Into<String>) -> Self {
        Self {
            scope: Scope::User,
            scope_id: user_id,
            max_concurrency,
            request_id: request_id.into(),
            wait_queue: None,
        }
    }

    /// Count the request in the wait queue of `user_id` while it waits for a slot.
    pub fn with_wait_queue(mut self, user_id: i64, max_wait: u32) -> Self {
        self.wait_queue = Some(WaitQueue { user_id, max_wait });
        self
    }
}
