//! Upload API client over HTTP+JSON.
//!
//! Async HTTP client using `reqwest`; every request carries the session
//! cookie the host application authenticated with.

use std::time::Duration;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::StatusCode;
use reqwest::header::{COOKIE, HeaderMap, HeaderValue};
use tracing::debug;

use mitt_protocol::messages::{
    CompletePartRequest, FinalizeRequest, FinalizeResponse, InitUploadRequest,
    InitUploadResponse, MissingPartsResponse, UploadStatusResponse,
};

use crate::api::{ApiFuture, UploadApi, UploadTarget};
use crate::error::ApiError;

/// Characters left unescaped in a path segment (RFC 3986 unreserved).
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Default timeout for negotiation requests.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Upload API client.
pub struct HttpUploadApi {
    http: reqwest::Client,
    base_url: String,
}

impl HttpUploadApi {
    /// Creates a client for the API rooted at `base_url`.
    ///
    /// `session_cookie` is sent verbatim as the `Cookie` header.
    pub fn new(base_url: &str, session_cookie: Option<&str>) -> Result<Self, ApiError> {
        Self::with_timeout(base_url, session_cookie, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Same as [`new`](Self::new) with an explicit per-request timeout.
    pub fn with_timeout(
        base_url: &str,
        session_cookie: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        if let Some(cookie) = session_cookie {
            headers.insert(
                COOKIE,
                HeaderValue::from_str(cookie).map_err(|_| ApiError::InvalidCookie)?,
            );
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Builds `{base}/orgs/{org}/videos/{video}/upload{suffix}`.
    fn upload_url(&self, target: &UploadTarget, suffix: &str) -> String {
        format!(
            "{}/orgs/{}/videos/{}/upload{}",
            self.base_url,
            utf8_percent_encode(&target.organization_id, PATH_SEGMENT),
            utf8_percent_encode(&target.video_id, PATH_SEGMENT),
            suffix
        )
    }

    async fn do_initialize(
        &self,
        target: &UploadTarget,
        request: InitUploadRequest,
    ) -> Result<InitUploadResponse, ApiError> {
        let url = self.upload_url(target, "/init");
        let resp = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(ApiError::from_send)?;
        let status = resp.status();

        if status.is_success() {
            let body = resp.bytes().await.map_err(ApiError::from_send)?;
            let parsed: InitUploadResponse = serde_json::from_slice(&body)?;
            debug!(
                target = %target,
                session = %parsed.session_id,
                parts = parsed.parts.len(),
                "upload session initialized"
            );
            return Ok(parsed);
        }

        // Anything the server will not retry into success is an init failure.
        let body = resp.text().await.unwrap_or_default();
        Err(match status_error(status, body) {
            ApiError::Api { status, body } => ApiError::SessionInit { status, body },
            transient => transient,
        })
    }

    async fn do_report_part_complete(
        &self,
        target: &UploadTarget,
        session_id: &str,
        part_index: u32,
        checksum: &str,
    ) -> Result<(), ApiError> {
        let url = self.upload_url(target, &format!("/parts/{part_index}/complete"));
        let body = CompletePartRequest {
            checksum: checksum.to_string(),
            session_id: session_id.to_string(),
        };
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(ApiError::from_send)?;
        let status = resp.status();

        if status.is_success() {
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::CONFLICT => ApiError::Conflict(body),
            s => status_error(s, body),
        })
    }

    async fn do_finalize(
        &self,
        target: &UploadTarget,
        session_id: &str,
    ) -> Result<FinalizeResponse, ApiError> {
        let url = self.upload_url(target, "/complete");
        let body = FinalizeRequest {
            session_id: session_id.to_string(),
        };
        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(ApiError::from_send)?;
        let status = resp.status();

        if status.is_success() {
            let body = resp.bytes().await.map_err(ApiError::from_send)?;
            return Ok(serde_json::from_slice(&body)?);
        }

        let body = resp.text().await.unwrap_or_default();
        if status == StatusCode::CONFLICT {
            // A 409 either lists missing parts or reports a finalized/superseded session.
            return Err(match serde_json::from_str::<MissingPartsResponse>(&body) {
                Ok(missing) if !missing.missing_part_indexes.is_empty() => {
                    ApiError::IncompleteParts {
                        missing: missing.missing_part_indexes,
                    }
                }
                _ => ApiError::Conflict(body),
            });
        }
        Err(status_error(status, body))
    }

    async fn do_query_status(
        &self,
        target: &UploadTarget,
    ) -> Result<Option<UploadStatusResponse>, ApiError> {
        let url = self.upload_url(target, "/status");
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(ApiError::from_send)?;
        let status = resp.status();

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status.is_success() {
            let body = resp.bytes().await.map_err(ApiError::from_send)?;
            return Ok(Some(serde_json::from_slice(&body)?));
        }

        let body = resp.text().await.unwrap_or_default();
        Err(status_error(status, body))
    }

    async fn do_upload_thumbnail(
        &self,
        target: &UploadTarget,
        image: Vec<u8>,
        content_type: &str,
    ) -> Result<(), ApiError> {
        let url = self.upload_url(target, "/thumbnail");
        let part = reqwest::multipart::Part::bytes(image)
            .file_name("thumbnail.jpg")
            .mime_str(content_type)?;
        let form = reqwest::multipart::Form::new().part("thumbnail", part);

        let resp = self
            .http
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(ApiError::from_send)?;
        let status = resp.status();

        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(status_error(status, body))
    }
}

/// Maps a non-success status that has no endpoint-specific meaning.
fn status_error(status: StatusCode, body: String) -> ApiError {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        ApiError::Transient(format!("{status}: {body}"))
    } else {
        ApiError::Api {
            status: status.as_u16(),
            body,
        }
    }
}

impl UploadApi for HttpUploadApi {
    fn initialize<'a>(
        &'a self,
        target: &'a UploadTarget,
        request: InitUploadRequest,
    ) -> ApiFuture<'a, InitUploadResponse> {
        Box::pin(self.do_initialize(target, request))
    }

    fn report_part_complete<'a>(
        &'a self,
        target: &'a UploadTarget,
        session_id: &'a str,
        part_index: u32,
        checksum: &'a str,
    ) -> ApiFuture<'a, ()> {
        Box::pin(self.do_report_part_complete(target, session_id, part_index, checksum))
    }

    fn finalize<'a>(
        &'a self,
        target: &'a UploadTarget,
        session_id: &'a str,
    ) -> ApiFuture<'a, FinalizeResponse> {
        Box::pin(self.do_finalize(target, session_id))
    }

    fn query_status<'a>(
        &'a self,
        target: &'a UploadTarget,
    ) -> ApiFuture<'a, Option<UploadStatusResponse>> {
        Box::pin(self.do_query_status(target))
    }

    fn upload_thumbnail<'a>(
        &'a self,
        target: &'a UploadTarget,
        image: Vec<u8>,
        content_type: &'a str,
    ) -> ApiFuture<'a, ()> {
        Box::pin(self.do_upload_thumbnail(target, image, content_type))
    }
}
