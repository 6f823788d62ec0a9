//! Upload coordinator: drives one session from `initializing` to a terminal
//! state.
//!
//! Parts are sent through a bounded window of concurrent tasks. Each task
//! owns its part's retry loop and reports the part to the server once the
//! transfer succeeds; the coordinator loop only collects results and byte
//! progress. The first fatal part error aborts every sibling.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use mitt_protocol::messages::{InitUploadRequest, PartAuthorization};
use mitt_protocol::{UploadFailure, UploadProgress, UploadStatus};
use mitt_transfer::{ByteRange, PartPlan, UploadSession, plan_parts, read_part};
use mitt_upload_api::{ApiError, BytesCallback, PartTransport, UploadApi, UploadTarget};

use crate::config::{RetryConfig, UploaderConfig};
use crate::error::UploadError;
use crate::types::{FinalizedUpload, ProgressCallback, VideoFile};

/// Settings for one coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub part_size: u64,
    pub max_parts: u32,
    pub concurrency: usize,
    pub retry: RetryConfig,
    pub resume_from_server: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from(&UploaderConfig::default())
    }
}

impl From<&UploaderConfig> for CoordinatorConfig {
    fn from(config: &UploaderConfig) -> Self {
        Self {
            part_size: config.part_size,
            max_parts: config.max_parts,
            concurrency: config.concurrency.max(1),
            retry: config.retry.clone(),
            resume_from_server: config.resume_from_server,
        }
    }
}

/// What to upload and where.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub target: UploadTarget,
    pub file: Arc<VideoFile>,
    /// Set on retries: ask the server which parts of the session it already
    /// holds before sending anything.
    pub resume: bool,
}

/// Runs a single upload session.
///
/// A coordinator is used for one session only; retrying an upload builds a
/// new coordinator.
pub struct UploadCoordinator {
    api: Arc<dyn UploadApi>,
    transport: Arc<dyn PartTransport>,
    config: CoordinatorConfig,
    cancel: CancellationToken,
}

impl UploadCoordinator {
    pub fn new(
        api: Arc<dyn UploadApi>,
        transport: Arc<dyn PartTransport>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            api,
            transport,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that cancels this session. Cancelling after finalize has been
    /// requested has no effect.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Uploads `request.file` and finalizes the session.
    ///
    /// `on_progress` sees every projection, including the terminal one.
    pub async fn run(
        &self,
        request: UploadRequest,
        on_progress: ProgressCallback,
    ) -> Result<FinalizedUpload, UploadError> {
        self.execute(request, on_progress).await.0
    }

    /// Like [`Self::run`], also returning the final part bookkeeping.
    async fn execute(
        &self,
        request: UploadRequest,
        on_progress: ProgressCallback,
    ) -> (Result<FinalizedUpload, UploadError>, Option<UploadSession>) {
        let mut projection = Projection::new(&request, on_progress);
        let mut session = None;
        let result = self.drive(&request, &mut projection, &mut session).await;

        match &result {
            Ok(done) => {
                info!(
                    upload = %request.target,
                    session = %done.session_id,
                    location = %done.object_location,
                    "upload completed"
                );
            }
            Err(UploadError::Cancelled) => {
                info!(upload = %request.target, "upload cancelled");
                if let Some(s) = session.as_mut() {
                    s.status = UploadStatus::Cancelled;
                }
                projection.emit_terminal(UploadStatus::Cancelled, None);
            }
            Err(e) => {
                error!(upload = %request.target, error = %e, "upload failed");
                if let Some(s) = session.as_mut() {
                    s.status = UploadStatus::Failed;
                }
                projection.emit_terminal(UploadStatus::Failed, Some(e.to_failure()));
            }
        }

        (result, session)
    }

    async fn drive(
        &self,
        request: &UploadRequest,
        projection: &mut Projection,
        slot: &mut Option<UploadSession>,
    ) -> Result<FinalizedUpload, UploadError> {
        let target = &request.target;
        let file = &request.file;
        let api = &*self.api;

        let plan = plan_parts(file.size, self.config.part_size, self.config.max_parts)?;
        projection.total_parts = plan.len() as u32;
        projection.emit(UploadStatus::Initializing, 0, 0, 0, None);

        let server_view = if request.resume && self.config.resume_from_server {
            let lookup = retry_transient(
                &self.config.retry,
                "status query",
                &self.cancel,
                move || api.query_status(target),
                || {},
            )
            .await;
            match lookup {
                Ok(view) => view,
                Err(UploadError::Cancelled) => return Err(UploadError::Cancelled),
                Err(e) => {
                    warn!(upload = %target, error = %e, "status query failed, sending every part");
                    None
                }
            }
        } else {
            None
        };

        let init_request = InitUploadRequest {
            total_bytes: file.size,
            part_size: plan.part_size,
        };
        let init = retry_transient(
            &self.config.retry,
            "session init",
            &self.cancel,
            move || api.initialize(target, init_request.clone()),
            || projection.retries += 1,
        )
        .await?;

        let authorizations = match_authorizations(&plan, init.parts)?;
        let session = slot.insert(UploadSession::new(
            init.session_id,
            target.organization_id.clone(),
            target.video_id.clone(),
            file.size,
            plan.part_size,
            &plan.ranges,
            authorizations,
        ));
        info!(
            upload = %target,
            session = %session.session_id,
            parts = session.total_parts(),
            part_size = session.part_size,
            "upload session opened"
        );

        if let Some(view) = server_view
            && view.session_id == session.session_id
        {
            for index in view.completed_part_indexes {
                if index < session.total_parts() {
                    session.mark_uploaded(index, None);
                }
            }
            info!(
                session = %session.session_id,
                already_uploaded = session.completed_parts(),
                "resuming session"
            );
        }

        projection.emit_session(UploadStatus::Uploading, session, 0);
        self.transfer_parts(request, session, projection).await?;

        // Past this point the session belongs to the server.
        if self.cancel.is_cancelled() {
            session.abort_in_flight();
            return Err(UploadError::Cancelled);
        }

        if !session.is_fully_uploaded() {
            return Err(UploadError::Internal(format!(
                "{} of {} parts acknowledged before finalize",
                session.completed_parts(),
                session.total_parts()
            )));
        }

        session.status = UploadStatus::Completing;
        projection.emit_session(UploadStatus::Completing, session, 0);

        let detached = CancellationToken::new();
        let session_id = session.session_id.as_str();
        let finalized = retry_transient(
            &self.config.retry,
            "finalize",
            &detached,
            move || api.finalize(target, session_id),
            || projection.retries += 1,
        )
        .await?;

        session.status = UploadStatus::Completed;
        projection.emit(
            UploadStatus::Completed,
            file.size,
            session.total_parts(),
            0,
            None,
        );

        Ok(FinalizedUpload {
            video_id: target.video_id.clone(),
            organization_id: target.organization_id.clone(),
            session_id: session.session_id.clone(),
            object_location: finalized.object_location,
        })
    }

    /// Sends every pending part through a window of at most `concurrency`
    /// tasks.
    async fn transfer_parts(
        &self,
        request: &UploadRequest,
        session: &mut UploadSession,
        projection: &mut Projection,
    ) -> Result<(), UploadError> {
        let pending = session.pending_indexes();
        if pending.is_empty() {
            return Ok(());
        }

        let part_cancel = self.cancel.child_token();
        let (signals_tx, mut signals_rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(PartContext {
            api: Arc::clone(&self.api),
            transport: Arc::clone(&self.transport),
            target: request.target.clone(),
            session_id: session.session_id.clone(),
            file: Arc::clone(&request.file),
            retry: self.config.retry.clone(),
            cancel: part_cancel.clone(),
            signals: signals_tx,
        });

        let mut queue = pending.into_iter();
        let mut join_set: JoinSet<(u32, Result<PartDone, UploadError>)> = JoinSet::new();
        let mut in_flight: HashMap<u32, u64> = HashMap::new();
        let mut failure = None;
        let mut failed_part = None;

        loop {
            while join_set.len() < self.config.concurrency && !part_cancel.is_cancelled() {
                let Some(index) = queue.next() else { break };
                let Some(part) = session.part(index) else {
                    continue;
                };
                let job = PartJob {
                    index,
                    range: part.range,
                    authorization: part.authorization.clone(),
                };
                session.mark_uploading(index);
                in_flight.insert(index, 0);
                debug!(part = index, bytes = job.range.len(), "part started");
                join_set.spawn(run_part(Arc::clone(&ctx), job));
            }

            if join_set.is_empty() {
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    failure = Some(UploadError::Cancelled);
                    break;
                }
                Some(signal) = signals_rx.recv() => {
                    match signal {
                        PartSignal::Bytes { index, sent } => {
                            let part_len = session.part(index).map_or(0, |p| p.range.len());
                            if let Some(live) = in_flight.get_mut(&index) {
                                *live = sent.min(part_len);
                            }
                        }
                        PartSignal::Retried { index, resend } => {
                            projection.retries += 1;
                            if resend && let Some(live) = in_flight.get_mut(&index) {
                                *live = 0;
                            }
                        }
                    }
                    projection.emit_session(UploadStatus::Uploading, session, in_flight.values().sum());
                }
                Some(joined) = join_set.join_next() => {
                    match joined {
                        Ok((_, Ok(done))) => {
                            in_flight.remove(&done.index);
                            session.mark_uploaded(done.index, Some(done.checksum));
                            debug!(
                                part = done.index,
                                completed = session.completed_parts(),
                                total = session.total_parts(),
                                "part acknowledged"
                            );
                            projection.emit_session(UploadStatus::Uploading, session, in_flight.values().sum());
                        }
                        Ok((index, Err(e))) => {
                            if !matches!(e, UploadError::Cancelled) {
                                failed_part = Some(index);
                            }
                            failure = Some(e);
                            break;
                        }
                        Err(e) => {
                            failure = Some(UploadError::Internal(e.to_string()));
                            break;
                        }
                    }
                }
            }
        }

        while let Ok(signal) = signals_rx.try_recv() {
            if let PartSignal::Retried { .. } = signal {
                projection.retries += 1;
            }
        }

        let Some(err) = failure else {
            return Ok(());
        };

        part_cancel.cancel();
        join_set.abort_all();
        while join_set.join_next().await.is_some() {}
        session.abort_in_flight();
        if let Some(index) = failed_part {
            session.mark_failed(index);
            debug!(part = index, "part failed");
        }
        Err(err)
    }
}

/// Checks that the server issued exactly one destination per planned part,
/// numbered `0..n`, and returns them in index order.
fn match_authorizations(
    plan: &PartPlan,
    mut parts: Vec<PartAuthorization>,
) -> Result<Vec<PartAuthorization>, UploadError> {
    parts.sort_by_key(|p| p.index);
    if parts.len() != plan.len() {
        return Err(UploadError::SessionInit(format!(
            "server issued {} part destinations for {} planned parts",
            parts.len(),
            plan.len()
        )));
    }
    if let Some((position, part)) = parts
        .iter()
        .enumerate()
        .find(|(position, p)| p.index as usize != *position)
    {
        return Err(UploadError::SessionInit(format!(
            "part destination {} found where {position} was expected",
            part.index
        )));
    }
    Ok(parts)
}

/// Calls `call` until it succeeds, fails permanently, or transient failures
/// use up the attempt budget. `on_retry` runs before each backoff.
async fn retry_transient<T, F, Fut>(
    policy: &RetryConfig,
    operation: &str,
    cancel: &CancellationToken,
    mut call: F,
    mut on_retry: impl FnMut(),
) -> Result<T, UploadError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            result = call() => result,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                on_retry();
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) if e.is_transient() => {
                return Err(UploadError::RetriesExhausted {
                    operation: operation.to_string(),
                    attempts: attempt,
                    message: e.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Part tasks
// ---------------------------------------------------------------------------

/// Shared state handed to every part task of a session.
struct PartContext {
    api: Arc<dyn UploadApi>,
    transport: Arc<dyn PartTransport>,
    target: UploadTarget,
    session_id: String,
    file: Arc<VideoFile>,
    retry: RetryConfig,
    cancel: CancellationToken,
    signals: mpsc::UnboundedSender<PartSignal>,
}

struct PartJob {
    index: u32,
    range: ByteRange,
    authorization: PartAuthorization,
}

struct PartDone {
    index: u32,
    checksum: String,
}

enum PartSignal {
    /// Cumulative bytes on the wire for the current attempt.
    Bytes { index: u32, sent: u64 },
    /// A transient failure is being retried; `resend` is set when the part
    /// body goes out again.
    Retried { index: u32, resend: bool },
}

/// Runs one part task, tagging its outcome with the part index.
async fn run_part(ctx: Arc<PartContext>, job: PartJob) -> (u32, Result<PartDone, UploadError>) {
    let index = job.index;
    (index, send_part(&ctx, job).await)
}

/// Transfers one part, retrying transient failures, then reports it.
async fn send_part(ctx: &PartContext, job: PartJob) -> Result<PartDone, UploadError> {
    let index = job.index;
    let mut attempt = 0u32;

    let receipt = loop {
        attempt += 1;
        if ctx.cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        if job.authorization.is_expired_at(Utc::now()) {
            return Err(UploadError::PartAuthExpired { index });
        }

        let payload = read_part(&ctx.file.path, job.range, ctx.file.size).await?;
        let signals = ctx.signals.clone();
        let on_bytes: BytesCallback = Arc::new(move |sent| {
            let _ = signals.send(PartSignal::Bytes { index, sent });
        });

        match ctx
            .transport
            .send(&job.authorization, payload, on_bytes, ctx.cancel.clone())
            .await
        {
            Ok(receipt) => break receipt,
            Err(e) if e.is_transient() && attempt < ctx.retry.max_attempts => {
                let delay = ctx.retry.delay_for_attempt(attempt);
                warn!(
                    part = index,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "part transfer failed, retrying"
                );
                let _ = ctx.signals.send(PartSignal::Retried {
                    index,
                    resend: true,
                });
                tokio::select! {
                    biased;
                    _ = ctx.cancel.cancelled() => return Err(UploadError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) if e.is_transient() => {
                return Err(UploadError::RetriesExhausted {
                    operation: format!("part {index}"),
                    attempts: attempt,
                    message: e.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }
    };

    if ctx.cancel.is_cancelled() {
        return Err(UploadError::Cancelled);
    }

    let api = &*ctx.api;
    let target = &ctx.target;
    let session_id = ctx.session_id.as_str();
    let checksum = receipt.checksum.as_str();
    let signals = ctx.signals.clone();
    retry_transient(
        &ctx.retry,
        &format!("part {index} report"),
        &ctx.cancel,
        move || api.report_part_complete(target, session_id, index, checksum),
        move || {
            let _ = signals.send(PartSignal::Retried {
                index,
                resend: false,
            });
        },
    )
    .await?;

    Ok(PartDone {
        index,
        checksum: receipt.checksum,
    })
}

// ---------------------------------------------------------------------------
// Progress projection
// ---------------------------------------------------------------------------

/// Builds progress records and keeps acknowledged counts from ever going
/// backwards.
struct Projection {
    video_id: String,
    file_name: String,
    total_bytes: u64,
    total_parts: u32,
    retries: u32,
    uploaded_bytes: u64,
    completed_parts: u32,
    callback: ProgressCallback,
}

impl Projection {
    fn new(request: &UploadRequest, callback: ProgressCallback) -> Self {
        Self {
            video_id: request.target.video_id.clone(),
            file_name: request.file.name.clone(),
            total_bytes: request.file.size,
            total_parts: 0,
            retries: 0,
            uploaded_bytes: 0,
            completed_parts: 0,
            callback,
        }
    }

    fn emit(
        &mut self,
        status: UploadStatus,
        uploaded_bytes: u64,
        completed_parts: u32,
        in_flight_bytes: u64,
        error: Option<UploadFailure>,
    ) {
        self.uploaded_bytes = self.uploaded_bytes.max(uploaded_bytes);
        self.completed_parts = self.completed_parts.max(completed_parts);
        let progress = UploadProgress {
            video_id: self.video_id.clone(),
            file_name: self.file_name.clone(),
            total_bytes: self.total_bytes,
            uploaded_bytes: self.uploaded_bytes,
            in_flight_bytes,
            completed_parts: self.completed_parts,
            total_parts: self.total_parts,
            status,
            retries: self.retries,
            error,
        };
        (self.callback)(&progress);
    }

    fn emit_session(&mut self, status: UploadStatus, session: &UploadSession, in_flight: u64) {
        self.emit(
            status,
            session.uploaded_bytes(),
            session.completed_parts(),
            in_flight,
            None,
        );
    }

    fn emit_terminal(&mut self, status: UploadStatus, error: Option<UploadFailure>) {
        self.emit(status, 0, 0, 0, error);
    }
}
