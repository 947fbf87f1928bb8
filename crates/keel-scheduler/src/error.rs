//! Scheduler error types.

use keel_core::QueueState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The ledger and the caller disagree about a job's state. Not retryable.
    #[error("illegal transition for {key}: {} -> {to}", state_label(.from))]
    IllegalTransition {
        key: String,
        from: Option<QueueState>,
        to: QueueState,
    },

    #[error("coordination store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("malformed store reply: {0}")]
    MalformedReply(String),

    #[error(transparent)]
    Core(#[from] keel_core::Error),
}

fn state_label(state: &Option<QueueState>) -> &'static str {
    state.map_or("<none>", |s| s.as_str())
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
