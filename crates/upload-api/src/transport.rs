//! Part transport: one HTTP PUT of one byte range to a pre-authorized URL.
//!
//! Transports never retry on their own. They classify failures so the
//! coordinator can decide: 4xx means the authorization is dead, timeouts,
//! resets and 5xx are transient.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream;
use reqwest::header::{CONTENT_LENGTH, ETAG};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use mitt_protocol::messages::PartAuthorization;
use mitt_transfer::checksum_bytes;

use crate::api::ApiFuture;
use crate::error::ApiError;

/// Called with the cumulative number of bytes handed to the wire for the
/// current attempt of a part.
pub type BytesCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Slice size used to stream a part body and report byte progress.
const STREAM_SLICE: usize = 256 * 1024;

/// Default timeout for a single part transfer.
const DEFAULT_PART_TIMEOUT: Duration = Duration::from_secs(300);

/// Proof that a part reached its destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartReceipt {
    /// Destination `ETag` when provided, otherwise the SHA-256 of the part.
    pub checksum: String,
}

/// Sends one part's bytes to its destination.
pub trait PartTransport: Send + Sync {
    /// Transfers `payload` to `authorization.url`.
    ///
    /// Must return [`ApiError::Cancelled`] promptly once `cancel` fires,
    /// without reporting success for the interrupted part.
    fn send<'a>(
        &'a self,
        authorization: &'a PartAuthorization,
        payload: Bytes,
        on_bytes: BytesCallback,
        cancel: CancellationToken,
    ) -> ApiFuture<'a, PartReceipt>;
}

/// `reqwest`-backed part transport.
pub struct HttpPartTransport {
    http: reqwest::Client,
}

impl Default for HttpPartTransport {
    fn default() -> Self {
        Self::new(DEFAULT_PART_TIMEOUT).unwrap_or_else(|_| Self {
            http: reqwest::Client::new(),
        })
    }
}

impl HttpPartTransport {
    /// Creates a transport whose transfers time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self { http })
    }

    async fn put_part(
        &self,
        authorization: &PartAuthorization,
        payload: Bytes,
        on_bytes: BytesCallback,
    ) -> Result<PartReceipt, ApiError> {
        let len = payload.len();
        let digest = checksum_bytes(&payload);

        let slices: Vec<Bytes> = (0..len)
            .step_by(STREAM_SLICE)
            .map(|start| payload.slice(start..(start + STREAM_SLICE).min(len)))
            .collect();
        let sent = Arc::new(AtomicU64::new(0));
        let body_stream = stream::iter(slices.into_iter().map(move |slice| {
            let total = sent.fetch_add(slice.len() as u64, Ordering::Relaxed) + slice.len() as u64;
            on_bytes(total);
            Ok::<Bytes, std::io::Error>(slice)
        }));

        let resp = self
            .http
            .put(&authorization.url)
            .header(CONTENT_LENGTH, len)
            .body(reqwest::Body::wrap_stream(body_stream))
            .send()
            .await
            .map_err(ApiError::from_send)?;
        let status = resp.status();

        if status.is_success() {
            let etag = resp
                .headers()
                .get(ETAG)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim_matches('"').to_string())
                .filter(|v| !v.is_empty());
            debug!(part = authorization.index, bytes = len, "part transferred");
            return Ok(PartReceipt {
                checksum: etag.unwrap_or(digest),
            });
        }

        if status.is_client_error() && status.as_u16() != 408 && status.as_u16() != 429 {
            return Err(ApiError::PartAuthExpired {
                index: authorization.index,
                status: status.as_u16(),
            });
        }

        let body = resp.text().await.unwrap_or_default();
        Err(ApiError::Transient(format!(
            "part {} destination returned {status}: {body}",
            authorization.index
        )))
    }
}

impl PartTransport for HttpPartTransport {
    fn send<'a>(
        &'a self,
        authorization: &'a PartAuthorization,
        payload: Bytes,
        on_bytes: BytesCallback,
        cancel: CancellationToken,
    ) -> ApiFuture<'a, PartReceipt> {
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ApiError::Cancelled),
                result = self.put_part(authorization, payload, on_bytes) => result,
            }
        })
    }
}
