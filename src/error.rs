//! Error types for the segmerge library.
//!
//! All fallible operations return [`Result`], whose error side is the
//! [`MergeError`] enum. The first four variants mirror how a merge reacts to a
//! failure:
//!
//! - [`MergeError::Configuration`]: invalid strategy parameters, raised when the
//!   parameters are set, never later.
//! - [`MergeError::ResourceExceeded`]: a planned merge would go over its memory
//!   or disk quota. Detected before anything is written.
//! - [`MergeError::CorruptData`]: malformed segment, primary key or patch data.
//!   Aborts the whole merge run.
//! - [`MergeError::Logic`]: an operation addressed outside the expected doc id
//!   range. Aborts only that operation.
//!
//! # Examples
//!
//! ```
//! use segmerge::error::{MergeError, Result};
//!
//! fn set_conflict_count(count: usize) -> Result<()> {
//!     if count < 2 {
//!         return Err(MergeError::configuration("conflict_segment_count must be >= 2"));
//!     }
//!     Ok(())
//! }
//!
//! assert!(set_conflict_count(1).is_err());
//! ```

use std::io;

use thiserror::Error;

/// The main error type for segmerge operations.
#[derive(Error, Debug)]
pub enum MergeError {
    /// Invalid or missing strategy parameter.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Projected memory/disk use is over quota.
    #[error("Resource exceeded: {0}")]
    ResourceExceeded(String),

    /// Malformed segment, primary key or patch data.
    #[error("Corrupt data: {0}")]
    CorruptData(String),

    /// Operation addressed outside the expected doc id range.
    #[error("Logic error: {0}")]
    Logic(String),

    /// I/O errors (file operations, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Requested entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation cancelled
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error for other cases
    #[error("Error: {0}")]
    Other(String),

    /// Errors raised by caller-provided work items.
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with MergeError.
pub type Result<T> = std::result::Result<T, MergeError>;

impl MergeError {
    /// Create a new configuration error.
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        MergeError::Configuration(msg.into())
    }

    /// Create a new resource exceeded error.
    pub fn resource_exceeded<S: Into<String>>(msg: S) -> Self {
        MergeError::ResourceExceeded(msg.into())
    }

    /// Create a new corrupt data error.
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        MergeError::CorruptData(msg.into())
    }

    /// Create a new logic error.
    pub fn logic<S: Into<String>>(msg: S) -> Self {
        MergeError::Logic(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        MergeError::Storage(msg.into())
    }

    /// Create a new not found error.
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        MergeError::NotFound(msg.into())
    }

    /// Create a new cancelled error.
    pub fn cancelled<S: Into<String>>(msg: S) -> Self {
        MergeError::Cancelled(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        MergeError::Other(msg.into())
    }

    /// Create a new internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        MergeError::Other(format!("Internal error: {}", msg.into()))
    }

    /// Whether a failed plan may be retried with reduced scope.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MergeError::ResourceExceeded(_) | MergeError::Io(_) | MergeError::Cancelled(_)
        )
    }

    /// Whether the error must abort the whole merge run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MergeError::CorruptData(_))
    }
}
