//! Session negotiation contract.
//!
//! `UploadApi` is implemented over HTTP by [`crate::HttpUploadApi`]; tests
//! implement it in memory to inject conflicts and missing parts.

use std::future::Future;
use std::pin::Pin;

use mitt_protocol::messages::{
    FinalizeResponse, InitUploadRequest, InitUploadResponse, UploadStatusResponse,
};

use crate::error::ApiError;

/// Boxed future returned by the API traits.
pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send + 'a>>;

/// The video an upload is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UploadTarget {
    pub organization_id: String,
    pub video_id: String,
}

impl UploadTarget {
    pub fn new(organization_id: impl Into<String>, video_id: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
            video_id: video_id.into(),
        }
    }
}

impl std::fmt::Display for UploadTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.organization_id, self.video_id)
    }
}

/// Server-side half of a multipart upload.
pub trait UploadApi: Send + Sync {
    /// Opens a multipart session and returns one destination per part.
    ///
    /// Fails with [`ApiError::SessionInit`] when the video does not exist or
    /// does not belong to the organization.
    fn initialize<'a>(
        &'a self,
        target: &'a UploadTarget,
        request: InitUploadRequest,
    ) -> ApiFuture<'a, InitUploadResponse>;

    /// Records that a part reached its destination.
    ///
    /// [`ApiError::Conflict`] means the session was superseded or finalized
    /// elsewhere and must not be retried.
    fn report_part_complete<'a>(
        &'a self,
        target: &'a UploadTarget,
        session_id: &'a str,
        part_index: u32,
        checksum: &'a str,
    ) -> ApiFuture<'a, ()>;

    /// Assembles the parts into the durable object.
    ///
    /// This is the authoritative completion check:
    /// [`ApiError::IncompleteParts`] lists the parts the server lacks.
    fn finalize<'a>(
        &'a self,
        target: &'a UploadTarget,
        session_id: &'a str,
    ) -> ApiFuture<'a, FinalizeResponse>;

    /// Returns the server's view of an existing session, or `None` if there
    /// is none.
    fn query_status<'a>(
        &'a self,
        target: &'a UploadTarget,
    ) -> ApiFuture<'a, Option<UploadStatusResponse>>;

    /// Uploads a thumbnail image for the video in a single request.
    fn upload_thumbnail<'a>(
        &'a self,
        target: &'a UploadTarget,
        image: Vec<u8>,
        content_type: &'a str,
    ) -> ApiFuture<'a, ()>;
}
