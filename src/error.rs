use rusqlite::Error as RusqliteError;
use std::fmt;
use std::io;
use serde::Serialize;
use thiserror::Error;

/// Where a batched run stopped. Batches before `batch_index` are committed and stay committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFailure {
    pub batch_index: usize,
    pub committed_batches: usize,
    pub committed_units: usize,
    /// Label of the last unit in the last committed batch ("committed up to" marker)
    pub committed_through: Option<String>,
    /// Label of the unit whose statement failed, if the failure happened inside a unit
    pub offending_unit: Option<String>,
    pub detail: String,
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batch {} failed ({}); {} batch(es) / {} unit(s) committed",
            self.batch_index, self.detail, self.committed_batches, self.committed_units
        )?;
        if let Some(unit) = &self.offending_unit {
            write!(f, "; offending unit: {}", unit)?;
        }
        if let Some(through) = &self.committed_through {
            write!(f, "; committed through: {}", through)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum CatMergeError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError),

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Confirmation required ({conflict_count} flagged): {message}")]
    Conflict { conflict_count: usize, message: String },

    #[error("Refusing unscoped run: {group_count} duplicate groups exceeds the threshold of {threshold}; narrow the scope to a single container")]
    ScaleGuard { group_count: usize, threshold: usize },

    #[error("Transaction failure: {0}")]
    TransactionFailure(BatchFailure),

    #[error("Rollback rejected: {0}")]
    RollbackState(String),

    #[error("Error: {0}")]
    Error(String),
}

impl CatMergeError {
    /// True for the errors that are raised before any transaction opens
    pub fn is_pre_transaction(&self) -> bool {
        matches!(
            self,
            CatMergeError::Validation(_)
                | CatMergeError::Conflict { .. }
                | CatMergeError::ScaleGuard { .. }
                | CatMergeError::RollbackState(_)
        )
    }
}
