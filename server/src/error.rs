//! Error handling.

use std::error::Error as StdError;

use anyhow::Error as AnyError;
use displaydoc::Display;

use stash::error::StashError;

pub type ServerResult<T> = Result<T, ServerError>;

/// An error.
#[derive(Debug, Display)]
pub enum ServerError {
    // Validation
    /// The file is larger than the pool allows ({size} > {limit} bytes).
    PoolSizeExceeded { size: u64, limit: u64 },

    /// The file is larger than the upload quota of the account ({size} > {limit} bytes).
    QuotaExceeded { size: u64, limit: u64 },

    /// The chunk "{chunk_id}" is not part of the fragment.
    UnknownChunk { chunk_id: String },

    /// The chunk "{chunk_id}" has already been uploaded.
    ChunkAlreadyUploaded { chunk_id: String },

    /// The chunk is larger than the chunk size ({size} > {limit} bytes).
    ChunkTooLarge { size: u64, limit: u64 },

    /// The fragment is missing {missing} chunk(s).
    FragmentIncomplete { missing: usize },

    /// The attachment has no content hash.
    HashMissing,

    /// The attachment is not eligible for analysis.
    NotEligibleForAnalysis,

    /// The attachment is not in temporary storage.
    NotInTemporaryStorage,

    /// The attachment has not been moved to permanent storage yet.
    NotInPermanentStorage,

    /// The destination {index} does not exist.
    InvalidDestination { index: usize },

    /// The destination {index} does not accept boosts.
    DestinationNotBoostable { index: usize },

    /// The boost status cannot be changed to "{status}".
    InvalidBoostStatus { status: String },

    /// The usage "{usage}" is not accepted.
    InvalidUsage { usage: String },

    /// The attachment cannot be used as a thumbnail.
    NotThumbnailCandidate,

    /// The requester does not own the resource.
    NotOwner,

    // Not found
    /// The requested attachment does not exist.
    NoSuchAttachment,

    /// The requested fragment does not exist.
    NoSuchFragment,

    /// The requested pool does not exist.
    NoSuchPool,

    /// The requested boost does not exist.
    NoSuchBoost,

    // Conflict
    /// The pool already exists.
    PoolAlreadyExists,

    /// The attachment is still referenced by {ref_count} other attachment(s).
    AttachmentStillReferenced { ref_count: i32 },

    /// The fragment is being merged.
    FragmentMerging,

    // Infrastructure
    /// Failed to persist the deduplication link: {0}
    LinkPersistFailure(AnyError),

    /// Database error: {0}
    DatabaseError(AnyError),

    /// Storage error: {0}
    StorageError(AnyError),

    /// Analysis error: {0}
    AnalysisError(AnyError),

    /// General request error: {0}
    RequestError(AnyError),

    /// Error from the common components.
    StashError(StashError),
}

/// The category of an error.
///
/// Callers branch on this instead of individual variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The request itself is invalid.
    Validation,

    /// A referenced record does not exist.
    NotFound,

    /// The request conflicts with the current state.
    Conflict,

    /// The storage backend failed.
    Storage,

    /// A database operation or transaction failed.
    Transaction,

    /// Something else went wrong.
    Internal,
}

impl ServerError {
    pub fn database_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::DatabaseError(AnyError::new(error))
    }

    pub fn storage_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::StorageError(AnyError::new(error))
    }

    pub fn analysis_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::AnalysisError(AnyError::new(error))
    }

    pub fn request_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::RequestError(AnyError::new(error))
    }

    pub fn link_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::LinkPersistFailure(AnyError::new(error))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::PoolSizeExceeded { .. } => "PoolSizeExceeded",
            Self::QuotaExceeded { .. } => "QuotaExceeded",
            Self::UnknownChunk { .. } => "UnknownChunk",
            Self::ChunkAlreadyUploaded { .. } => "ChunkAlreadyUploaded",
            Self::ChunkTooLarge { .. } => "ChunkTooLarge",
            Self::FragmentIncomplete { .. } => "FragmentIncomplete",
            Self::HashMissing => "HashMissing",
            Self::NotEligibleForAnalysis => "NotEligibleForAnalysis",
            Self::NotInTemporaryStorage => "NotInTemporaryStorage",
            Self::NotInPermanentStorage => "NotInPermanentStorage",
            Self::InvalidDestination { .. } => "InvalidDestination",
            Self::DestinationNotBoostable { .. } => "DestinationNotBoostable",
            Self::InvalidBoostStatus { .. } => "InvalidBoostStatus",
            Self::InvalidUsage { .. } => "InvalidUsage",
            Self::NotThumbnailCandidate => "NotThumbnailCandidate",
            Self::NotOwner => "NotOwner",

            Self::NoSuchAttachment => "NoSuchAttachment",
            Self::NoSuchFragment => "NoSuchFragment",
            Self::NoSuchPool => "NoSuchPool",
            Self::NoSuchBoost => "NoSuchBoost",

            Self::PoolAlreadyExists => "PoolAlreadyExists",
            Self::AttachmentStillReferenced { .. } => "AttachmentStillReferenced",
            Self::FragmentMerging => "FragmentMerging",

            Self::LinkPersistFailure(_) => "LinkPersistFailure",
            Self::DatabaseError(_) => "DatabaseError",
            Self::StorageError(_) => "StorageError",
            Self::AnalysisError(_) => "AnalysisError",
            Self::RequestError(_) => "RequestError",
            Self::StashError(e) => e.name(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::PoolSizeExceeded { .. }
            | Self::QuotaExceeded { .. }
            | Self::UnknownChunk { .. }
            | Self::ChunkAlreadyUploaded { .. }
            | Self::ChunkTooLarge { .. }
            | Self::FragmentIncomplete { .. }
            | Self::HashMissing
            | Self::NotEligibleForAnalysis
            | Self::NotInTemporaryStorage
            | Self::NotInPermanentStorage
            | Self::InvalidDestination { .. }
            | Self::DestinationNotBoostable { .. }
            | Self::InvalidBoostStatus { .. }
            | Self::InvalidUsage { .. }
            | Self::NotThumbnailCandidate
            | Self::NotOwner
            | Self::RequestError(_) => ErrorCategory::Validation,

            Self::StashError(StashError::IoError { .. }) => ErrorCategory::Internal,
            Self::StashError(_) => ErrorCategory::Validation,

            Self::NoSuchAttachment | Self::NoSuchFragment | Self::NoSuchPool | Self::NoSuchBoost => {
                ErrorCategory::NotFound
            }

            Self::PoolAlreadyExists
            | Self::AttachmentStillReferenced { .. }
            | Self::FragmentMerging => ErrorCategory::Conflict,

            Self::StorageError(_) => ErrorCategory::Storage,
            Self::LinkPersistFailure(_) | Self::DatabaseError(_) => ErrorCategory::Transaction,
            Self::AnalysisError(_) => ErrorCategory::Internal,
        }
    }

    /// Returns whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Storage)
    }
}

impl StdError for ServerError {}

impl From<StashError> for ServerError {
    fn from(error: StashError) -> Self {
        Self::StashError(error)
    }
}

impl From<sea_orm::DbErr> for ServerError {
    fn from(error: sea_orm::DbErr) -> Self {
        Self::database_error(error)
    }
}
