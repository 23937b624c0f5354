//! Error types shared by the session, registry and supervisor layers.

use crate::UserId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid value: {0}")]
    Validation(String),

    #[error("user {user_id} already has {what}")]
    Conflict { user_id: UserId, what: &'static str },

    #[error("nothing active for user {0}")]
    NotFound(UserId),

    #[error("job queue is full ({capacity} waiting)")]
    Busy { capacity: usize },

    #[error("could not read source media: {0}")]
    Probe(String),

    #[error("could not start encoder: {0}")]
    Spawn(String),

    #[error("encode failed: {message}")]
    EncodeFailure {
        message: String,
        exit_code: Option<i32>,
    },

    #[error("encode cancelled")]
    Cancelled,

    #[error("rendering failed: {0}")]
    Reporter(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn encode_failure(message: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self::EncodeFailure {
            message: message.into(),
            exit_code,
        }
    }

    /// True for errors that are reported to the caller without touching any state.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::Conflict { .. } | Error::NotFound(_) | Error::Busy { .. }
        )
    }
}
