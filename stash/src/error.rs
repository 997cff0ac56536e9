//! Error handling.

use std::error::Error as StdError;
use std::io;

use displaydoc::Display;

pub type StashResult<T> = Result<T, StashError>;

/// An error.
#[derive(Debug, Display)]
pub enum StashError {
    /// Invalid pool alias "{name}"
    InvalidPoolAlias { name: String },

    /// Invalid identifier "{id}": {reason}
    InvalidIdentifier { id: String, reason: &'static str },

    /// Hashing error: {0}
    HashError(super::hash::Error),

    /// I/O error: {error}.
    IoError { error: io::Error },
}

impl StashError {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidPoolAlias { .. } => "InvalidPoolAlias",
            Self::InvalidIdentifier { .. } => "InvalidIdentifier",
            Self::HashError(_) => "HashError",
            Self::IoError { .. } => "IoError",
        }
    }
}

impl StdError for StashError {}

impl From<io::Error> for StashError {
    fn from(error: io::Error) -> Self {
        Self::IoError { error }
    }
}

impl From<super::hash::Error> for StashError {
    fn from(error: super::hash::Error) -> Self {
        Self::HashError(error)
    }
}
