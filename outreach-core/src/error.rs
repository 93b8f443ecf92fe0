use chrono::NaiveTime;
use thiserror::Error;
use uuid::Uuid;

use crate::compliance::CapLimit;
use crate::types::MessageStatus;

/// Bad input, rejected before any state changes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("message content is empty")]
    EmptyContent,

    #[error("message content is {length} characters, limit is {limit}")]
    ContentTooLong { length: usize, limit: usize },

    #[error("quiet hours end {end} must be after start {start}")]
    InvalidQuietHours { start: NaiveTime, end: NaiveTime },

    #[error("no next day after {0}")]
    DateOutOfRange(chrono::NaiveDate),

    #[error("unknown message status '{0}'")]
    UnknownStatus(String),

    #[error("unknown channel '{0}'")]
    UnknownChannel(String),

    #[error("invalid job request: {0}")]
    InvalidJobRequest(String),

    #[error("no message ids given")]
    EmptyBatch,

    #[error("at most {limit} message ids per request, got {count}")]
    BatchTooLarge { count: usize, limit: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot move message from {from} to {to}")]
pub struct TransitionError {
    pub from: MessageStatus,
    pub to: MessageStatus,
}

/// Outcome of a failed QueueService operation.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("message {0} not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("{limit} frequency cap reached ({sent}/{cap})")]
    FrequencyCap { limit: CapLimit, sent: u32, cap: u32 },

    #[error("contact has opted out")]
    OptOut,

    #[error("approval rate limit reached ({approved}/{cap} this hour)")]
    RateLimited { approved: u32, cap: u32 },

    /// Someone else changed the message between our read and our write.
    #[error("message {0} was modified concurrently")]
    Conflict(Uuid),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl QueueError {
    /// Stable machine-readable code returned to API callers.
    pub fn code(&self) -> &'static str {
        match self {
            QueueError::NotFound(_) => "not_found",
            QueueError::Validation(_) => "validation_error",
            QueueError::Transition(_) => "invalid_transition",
            QueueError::FrequencyCap { .. } => "frequency_cap_reached",
            QueueError::OptOut => "opt_out",
            QueueError::RateLimited { .. } => "rate_limited",
            QueueError::Conflict(_) => "conflict",
            QueueError::Storage(_) => "internal_error",
        }
    }
}
