//! Error types for RevDB
//!
//! Every public operation reports one of these. Errors are returned to the
//! caller of the operation that detected them; they never abort an enclosing
//! transaction on their own.

use crate::storage::StorageError;
use std::time::Duration;

/// Result type for database operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during database operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The supplied parent revision is not the document's current winner.
    #[error("Conflict on document '{doc_id}': parent {parent:?} does not match current revision {current:?}")]
    Conflict {
        doc_id: String,
        parent: Option<String>,
        current: Option<String>,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// A revision references an attachment digest the attachment store does not hold.
    #[error("Attachment {digest} referenced by document '{doc_id}' is missing from the attachment store")]
    AttachmentMissing { doc_id: String, digest: String },

    #[error("Write lock not acquired within {0:?}")]
    Busy(Duration),

    #[error("Database is closed")]
    Closed,
}

impl Error {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub(crate) fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// True for [`Error::Conflict`].
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict { .. })
    }
}
