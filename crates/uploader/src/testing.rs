//! In-memory `UploadApi` and `PartTransport` for coordinator and store tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use mitt_protocol::messages::{
    FinalizeResponse, InitUploadRequest, InitUploadResponse, PartAuthorization,
    UploadStatusResponse,
};
use mitt_upload_api::{
    ApiError, ApiFuture, BytesCallback, PartReceipt, PartTransport, UploadApi, UploadTarget,
};

use crate::config::RetryConfig;
use crate::coordinator::CoordinatorConfig;
use crate::types::VideoFile;

/// Coordinator settings with millisecond backoff.
pub(crate) fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        retry: RetryConfig {
            max_attempts: 4,
            initial_delay_ms: 1,
            max_delay_ms: 4,
            backoff_factor: 2.0,
        },
        ..CoordinatorConfig::default()
    }
}

pub(crate) async fn write_file(dir: &Path, name: &str, data: &[u8]) -> VideoFile {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    VideoFile::open(&path).await.unwrap()
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ApiCall {
    Init { total_bytes: u64, part_size: u64 },
    Report { session_id: String, index: u32 },
    Finalize { session_id: String },
    Status,
    Thumbnail { bytes: usize, content_type: String },
}

#[derive(Default)]
pub(crate) struct MockApi {
    pub calls: Mutex<Vec<ApiCall>>,
    sessions: AtomicU32,
    /// Number of destinations `initialize` returns instead of the planned count.
    pub part_count_override: Mutex<Option<usize>>,
    /// Session id `initialize` returns instead of a fresh one.
    pub reuse_session: Mutex<Option<String>>,
    pub expires_at: Mutex<Option<DateTime<Utc>>>,
    pub status: Mutex<Option<UploadStatusResponse>>,
    pub init_errors: Mutex<VecDeque<ApiError>>,
    pub report_errors: Mutex<VecDeque<ApiError>>,
    pub finalize_errors: Mutex<VecDeque<ApiError>>,
    pub thumbnail_errors: Mutex<VecDeque<ApiError>>,
}

impl MockApi {
    pub fn calls(&self) -> Vec<ApiCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn reports(&self) -> Vec<u32> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ApiCall::Report { index, .. } => Some(index),
                _ => None,
            })
            .collect()
    }

    pub fn finalize_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ApiCall::Finalize { .. }))
            .count()
    }

    pub fn init_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, ApiCall::Init { .. }))
            .count()
    }

    fn record(&self, call: ApiCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl UploadApi for MockApi {
    fn initialize<'a>(
        &'a self,
        _target: &'a UploadTarget,
        request: InitUploadRequest,
    ) -> ApiFuture<'a, InitUploadResponse> {
        self.record(ApiCall::Init {
            total_bytes: request.total_bytes,
            part_size: request.part_size,
        });
        let result = match self.init_errors.lock().unwrap().pop_front() {
            Some(e) => Err(e),
            None => {
                let planned = request.total_bytes.div_ceil(request.part_size).max(1) as usize;
                let count = self.part_count_override.lock().unwrap().unwrap_or(planned);
                let session_id = self.reuse_session.lock().unwrap().clone().unwrap_or_else(|| {
                    format!("session-{}", self.sessions.fetch_add(1, Ordering::SeqCst) + 1)
                });
                let expires_at = *self.expires_at.lock().unwrap();
                let parts = (0..count as u32)
                    .map(|index| PartAuthorization {
                        index,
                        url: format!("mock://bucket/{session_id}/part-{index}"),
                        expires_at,
                    })
                    .collect();
                Ok(InitUploadResponse { session_id, parts })
            }
        };
        Box::pin(std::future::ready(result))
    }

    fn report_part_complete<'a>(
        &'a self,
        _target: &'a UploadTarget,
        session_id: &'a str,
        part_index: u32,
        _checksum: &'a str,
    ) -> ApiFuture<'a, ()> {
        self.record(ApiCall::Report {
            session_id: session_id.to_string(),
            index: part_index,
        });
        let result = match self.report_errors.lock().unwrap().pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        };
        Box::pin(std::future::ready(result))
    }

    fn finalize<'a>(
        &'a self,
        target: &'a UploadTarget,
        session_id: &'a str,
    ) -> ApiFuture<'a, FinalizeResponse> {
        self.record(ApiCall::Finalize {
            session_id: session_id.to_string(),
        });
        let result = match self.finalize_errors.lock().unwrap().pop_front() {
            Some(e) => Err(e),
            None => Ok(FinalizeResponse {
                object_location: format!(
                    "videos/{}/{}.mp4",
                    target.organization_id, target.video_id
                ),
            }),
        };
        Box::pin(std::future::ready(result))
    }

    fn query_status<'a>(
        &'a self,
        _target: &'a UploadTarget,
    ) -> ApiFuture<'a, Option<UploadStatusResponse>> {
        self.record(ApiCall::Status);
        let status = self.status.lock().unwrap().clone();
        Box::pin(std::future::ready(Ok(status)))
    }

    fn upload_thumbnail<'a>(
        &'a self,
        _target: &'a UploadTarget,
        image: Vec<u8>,
        content_type: &'a str,
    ) -> ApiFuture<'a, ()> {
        self.record(ApiCall::Thumbnail {
            bytes: image.len(),
            content_type: content_type.to_string(),
        });
        let result = match self.thumbnail_errors.lock().unwrap().pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        };
        Box::pin(std::future::ready(result))
    }
}

#[derive(Default)]
pub(crate) struct MockTransport {
    sends: Mutex<Vec<u32>>,
    failures: Mutex<HashMap<u32, VecDeque<ApiError>>>,
    payloads: Mutex<BTreeMap<u32, Vec<u8>>>,
    /// Keep every send open until it is cancelled.
    pub hold: AtomicBool,
    pub record_payloads: AtomicBool,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl MockTransport {
    /// Makes the next send of part `index` fail with `err`.
    pub fn fail_next(&self, index: u32, err: ApiError) {
        self.failures
            .lock()
            .unwrap()
            .entry(index)
            .or_default()
            .push_back(err);
    }

    /// Part index of every send attempt, in call order.
    pub fn sends(&self) -> Vec<u32> {
        self.sends.lock().unwrap().clone()
    }

    /// Recorded part bodies concatenated in index order.
    pub fn assembled(&self) -> Vec<u8> {
        self.payloads
            .lock()
            .unwrap()
            .values()
            .flatten()
            .copied()
            .collect()
    }
}

impl PartTransport for MockTransport {
    fn send<'a>(
        &'a self,
        authorization: &'a PartAuthorization,
        payload: Bytes,
        on_bytes: BytesCallback,
        cancel: CancellationToken,
    ) -> ApiFuture<'a, PartReceipt> {
        Box::pin(async move {
            let index = authorization.index;
            self.sends.lock().unwrap().push(index);
            let failure = self
                .failures
                .lock()
                .unwrap()
                .get_mut(&index)
                .and_then(|q| q.pop_front());
            if let Some(e) = failure {
                return Err(e);
            }

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let outcome = if self.hold.load(Ordering::SeqCst) {
                cancel.cancelled().await;
                Err(ApiError::Cancelled)
            } else {
                on_bytes(payload.len() as u64 / 2);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(ApiError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_millis(2)) => Ok(()),
                }
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            outcome?;

            on_bytes(payload.len() as u64);
            if self.record_payloads.load(Ordering::SeqCst) {
                self.payloads
                    .lock()
                    .unwrap()
                    .insert(index, payload.to_vec());
            }
            Ok(PartReceipt {
                checksum: format!("etag-{index}"),
            })
        })
    }
}
