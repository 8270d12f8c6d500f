use crate::Scope;

/// Prefix of account ledgers: `concurrency:account:{account_id}`.
pub const ACCOUNT_SLOT_KEY_PREFIX: &str = "concurrency:account:";
/// Prefix of user ledgers: `concurrency:user:{user_id}`.
pub const USER_SLOT_KEY_PREFIX: &str = "concurrency:user:";
/// Prefix of wait counters: `concurrency:wait:{user_id}`.
pub const WAIT_QUEUE_KEY_PREFIX: &str = "concurrency:wait:";

pub(crate) fn slot_key(scope: Scope, id: i64) -> String {
    let prefix = match scope {
        Scope::Account => ACCOUNT_SLOT_KEY_PREFIX,
        Scope::User => USER_SLOT_KEY_PREFIX,
    };
    format!("{prefix}{id}")
}

pub(crate) fn wait_queue_key(user_id: i64) -> String {
    format!("{WAIT_QUEUE_KEY_PREFIX}{user_id}")
}
