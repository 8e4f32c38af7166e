//! Error types shared by the queue components.

use std::fmt;

use thiserror::Error;

use crate::gitserver::GitserverError;

/// Failures reported by a work store or one of its transactions.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("work item {0} not found")]
    ItemNotFound(i64),

    #[error("work item {0} is not held by this transaction")]
    NotHeld(i64),

    #[error("unknown savepoint {0}")]
    UnknownSavepoint(u64),

    #[error("transaction aborted: {0}")]
    Aborted(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("time out of range: {0}")]
    TimeOutOfRange(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A collection of errors raised while attempting a batch of independent
/// operations. Every operation is attempted before the batch is reported.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<StoreError>,
}

impl MultiError {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: StoreError) {
        self.errors.push(err);
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[StoreError] {
        &self.errors
    }

    /// `Ok(())` when nothing failed.
    pub fn into_result(self) -> Result<(), MultiError> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.len() {
            0 => write!(f, "no errors"),
            1 => write!(f, "{}", self.errors[0]),
            n => {
                write!(f, "{n} errors occurred:")?;
                for err in &self.errors {
                    write!(f, "\n\t* {err}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for MultiError {}

/// Errors surfaced by the lease manager, scheduler, resetter and worker.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to reclaim leases: {0}")]
    Reclaim(#[from] MultiError),

    #[error(transparent)]
    Gitserver(#[from] GitserverError),
}

pub type Result<T, E = QueueError> = std::result::Result<T, E>;
