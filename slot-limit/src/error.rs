/// Failures to run an atomic procedure against the store.
///
/// A denied acquisition is not an error: it is `Ok(false)`. Anything in here means the
/// store could not be asked, so the caller cannot know whether capacity was available.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The Redis round trip or script execution failed.
    #[error("redis store error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The key exists but holds a different kind of value than the procedure expects.
    #[error("key {key} holds the wrong kind of value")]
    WrongType {
        /// The offending key.
        key: String,
    },
}
