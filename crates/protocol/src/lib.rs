//! Wire types shared between the upload client and the Upload API.
//!
//! `messages` holds the HTTP request/response bodies; `types` holds the
//! observable projections (status, progress, persisted active uploads).

pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use messages::{
    CompletePartRequest, FinalizeRequest, FinalizeResponse, InitUploadRequest,
    InitUploadResponse, MissingPartsResponse, PartAuthorization, UploadStatusResponse,
};
pub use types::{ActiveUpload, ErrorKind, UploadFailure, UploadProgress, UploadStatus};
