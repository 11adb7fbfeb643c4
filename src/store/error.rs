use ulid::Ulid;

use crate::model::{BookingStatus, JobState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound(Ulid),
    AlreadyExists(String),
    InvalidTransition { from: JobState, to: JobState },
    BookingClosed { id: Ulid, status: BookingStatus },
    LimitExceeded(&'static str),
    /// The write-ahead log refused or lost the write. Retryable.
    Wal(String),
}

impl StoreError {
    /// Persistence failures are the only kind worth retrying.
    pub fn is_persistence(&self) -> bool {
        matches!(self, StoreError::Wal(_))
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "not found: {id}"),
            StoreError::AlreadyExists(what) => write!(f, "already exists: {what}"),
            StoreError::InvalidTransition { from, to } => {
                write!(f, "invalid job transition: {from} -> {to}")
            }
            StoreError::BookingClosed { id, status } => {
                write!(f, "booking {id} is already {}", status.label())
            }
            StoreError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            StoreError::Wal(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}
