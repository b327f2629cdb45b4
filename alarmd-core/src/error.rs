//! Error types for alarmd.

use thiserror::Error;

use crate::datetime::DateTime;

/// Errors that can surface from alarmd-core operations.
///
/// Backend failures never show up here: they are absorbed by the engine
/// and only ever shrink a query result.
#[derive(Error, Debug)]
pub enum AlarmError {
    #[error("Invalid range: begin {begin} is not before end {end}")]
    InvalidRange { begin: DateTime, end: DateTime },

    #[error("Invalid local time: {0}")]
    InvalidTime(String),

    #[error("Unknown timezone: {0}")]
    Timezone(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for alarmd-core operations.
pub type AlarmResult<T> = Result<T, AlarmError>;
