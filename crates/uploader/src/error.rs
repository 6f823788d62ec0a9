//! Error types for upload sessions and the progress store.

use mitt_protocol::{ErrorKind, UploadFailure, UploadStatus};
use mitt_transfer::TransferError;
use mitt_upload_api::ApiError;

/// Terminal failure of one upload session.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// The server refused to open a session, or answered with part
    /// destinations that do not match the plan.
    #[error("could not start upload session: {0}")]
    SessionInit(String),

    #[error("part {index} destination authorization expired")]
    PartAuthExpired { index: u32 },

    #[error("{operation} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        message: String,
    },

    #[error("upload session conflict: {0}")]
    Conflict(String),

    #[error("server is missing parts {missing:?}; retry the upload")]
    IncompleteParts { missing: Vec<u32> },

    #[error("upload cancelled")]
    Cancelled,

    #[error("file error: {0}")]
    Transfer(#[from] TransferError),

    #[error("upload API error: {0}")]
    Api(ApiError),

    #[error("part task failed: {0}")]
    Internal(String),
}

impl From<ApiError> for UploadError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::SessionInit { status, body } => {
                Self::SessionInit(format!("server answered {status}: {body}"))
            }
            ApiError::PartAuthExpired { index, .. } => Self::PartAuthExpired { index },
            ApiError::Conflict(msg) => Self::Conflict(msg),
            ApiError::IncompleteParts { missing } => Self::IncompleteParts { missing },
            ApiError::Cancelled => Self::Cancelled,
            other => Self::Api(other),
        }
    }
}

impl UploadError {
    /// Failure category shown alongside the message.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SessionInit(_) => ErrorKind::SessionInit,
            Self::PartAuthExpired { .. } => ErrorKind::PartAuthExpired,
            Self::RetriesExhausted { .. } => ErrorKind::TransientNetwork,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::IncompleteParts { .. } => ErrorKind::IncompleteParts,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Transfer(_) => ErrorKind::Io,
            Self::Api(_) | Self::Internal(_) => ErrorKind::Other,
        }
    }

    /// Projection attached to a `failed` progress record.
    pub fn to_failure(&self) -> UploadFailure {
        UploadFailure {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Errors returned by [`crate::ProgressStore`] operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no upload for video {0}")]
    NotFound(String),

    #[error("upload for video {video_id} is {status}, not finished")]
    NotTerminal {
        video_id: String,
        status: UploadStatus,
    },

    #[error("upload for video {video_id} is {status} and cannot be retried")]
    NotRetryable {
        video_id: String,
        status: UploadStatus,
    },

    #[error("upload for video {video_id} is {status} and can no longer be cancelled")]
    NotCancellable {
        video_id: String,
        status: UploadStatus,
    },

    #[error("video {0} belongs to a different organization")]
    OrganizationMismatch(String),

    /// The entry was reported from elsewhere and no local file is attached.
    #[error("no local file retained for video {0}")]
    FileUnavailable(String),

    #[error("invalid part plan: {0}")]
    Plan(#[from] TransferError),
}
