//! Progress store: the one place upload state lives.
//!
//! Entries are published as immutable snapshots. Every mutation goes through
//! a single serialized update path that swaps the snapshot, mirrors the
//! active set to disk and notifies listeners in order. Each upload attempt
//! gets a generation number and events from a superseded attempt are
//! dropped, so a restarted upload can never be overwritten by its
//! predecessor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use mitt_protocol::{ActiveUpload, UploadProgress, UploadStatus};
use mitt_transfer::plan_parts;
use mitt_upload_api::{PartTransport, UploadApi, UploadTarget};

use crate::coordinator::{CoordinatorConfig, UploadCoordinator, UploadRequest};
use crate::error::{StoreError, UploadError};
use crate::persistence::ActiveUploadStore;
use crate::thumbnail::PostCompletionHook;
use crate::types::{ProgressCallback, UploadCallbacks, UploadEntry, VideoFile};

/// Immutable view of every tracked upload.
pub type Snapshot = Arc<Vec<UploadEntry>>;

type Listener = Arc<dyn Fn(&Snapshot) + Send + Sync>;

/// A running coordinator owned by the store.
struct RunningSession {
    generation: u64,
    cancel: CancellationToken,
    finished: watch::Receiver<bool>,
}

struct StoreInner {
    api: Arc<dyn UploadApi>,
    transport: Arc<dyn PartTransport>,
    config: CoordinatorConfig,
    mirror: Option<MirrorWriter>,
    hook: Option<Arc<dyn PostCompletionHook>>,
    interrupted: Vec<ActiveUpload>,

    entries: RwLock<Snapshot>,
    update_lock: Mutex<()>,
    listeners: RwLock<Vec<(u64, Listener)>>,
    next_listener: AtomicU64,
    sessions: Mutex<HashMap<String, RunningSession>>,
    callbacks: Mutex<HashMap<String, Arc<UploadCallbacks>>>,
    hook_tasks: Mutex<Vec<JoinHandle<()>>>,
    next_generation: AtomicU64,
}

/// Builds a [`ProgressStore`].
pub struct ProgressStoreBuilder {
    api: Arc<dyn UploadApi>,
    transport: Arc<dyn PartTransport>,
    config: CoordinatorConfig,
    persistence: Option<ActiveUploadStore>,
    hook: Option<Arc<dyn PostCompletionHook>>,
}

impl ProgressStoreBuilder {
    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Mirrors the active set through `persistence`.
    pub fn persistence(mut self, persistence: ActiveUploadStore) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Runs `hook` after every completed upload.
    pub fn hook(mut self, hook: Arc<dyn PostCompletionHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Must be called inside a Tokio runtime when persistence is set: the
    /// active set is written by a background task.
    pub fn build(self) -> ProgressStore {
        let interrupted = match &self.persistence {
            Some(p) => p.load().unwrap_or_else(|e| {
                warn!(error = %e, "failed to read active upload mirror");
                Vec::new()
            }),
            None => Vec::new(),
        };
        if !interrupted.is_empty() {
            info!(
                count = interrupted.len(),
                "uploads were still in flight when the previous run ended"
            );
        }

        let mirror = self
            .persistence
            .map(|store| MirrorWriter::spawn(store, interrupted.clone()));

        ProgressStore {
            inner: Arc::new(StoreInner {
                api: self.api,
                transport: self.transport,
                config: self.config,
                mirror,
                hook: self.hook,
                interrupted,
                entries: RwLock::new(Arc::new(Vec::new())),
                update_lock: Mutex::new(()),
                listeners: RwLock::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                sessions: Mutex::new(HashMap::new()),
                callbacks: Mutex::new(HashMap::new()),
                hook_tasks: Mutex::new(Vec::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }
}

/// Handle returned by [`ProgressStore::subscribe`]. Dropping it removes the
/// listener.
pub struct Subscription {
    id: u64,
    inner: Weak<StoreInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            write(&inner.listeners).retain(|(id, _)| *id != self.id);
        }
    }
}

/// Tracks every upload of the process and owns their coordinators.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ProgressStore {
    inner: Arc<StoreInner>,
}

impl ProgressStore {
    pub fn builder(
        api: Arc<dyn UploadApi>,
        transport: Arc<dyn PartTransport>,
    ) -> ProgressStoreBuilder {
        ProgressStoreBuilder {
            api,
            transport,
            config: CoordinatorConfig::default(),
            persistence: None,
            hook: None,
        }
    }

    /// Current snapshot of all entries.
    pub fn snapshot(&self) -> Snapshot {
        Arc::clone(&read(&self.inner.entries))
    }

    pub fn get(&self, video_id: &str) -> Option<UploadEntry> {
        self.snapshot()
            .iter()
            .find(|e| e.video_id == video_id)
            .cloned()
    }

    /// Uploads of this process that are still moving bytes.
    pub fn active_uploads(&self) -> Vec<ActiveUpload> {
        active_set(&self.snapshot())
    }

    /// Uploads that were active when the previous run stopped. Reported for
    /// diagnostics only; they are not resumed.
    pub fn interrupted_uploads(&self) -> &[ActiveUpload] {
        &self.inner.interrupted
    }

    /// Registers `listener` for every future snapshot.
    ///
    /// Listeners run on the task that produced the change, in commit order.
    /// They may read the store but must not mutate it synchronously.
    pub fn subscribe(&self, listener: impl Fn(&Snapshot) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        write(&self.inner.listeners).push((id, Arc::new(listener)));
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Starts uploading `file` to the given video.
    ///
    /// An upload already running for the video is cancelled and awaited
    /// first.
    pub async fn start_upload(
        &self,
        organization_id: &str,
        video_id: &str,
        file: VideoFile,
        callbacks: UploadCallbacks,
    ) -> Result<(), StoreError> {
        self.stop_running(video_id).await;
        lock(&self.inner.callbacks).insert(video_id.to_string(), Arc::new(callbacks));
        self.launch(
            UploadTarget::new(organization_id, video_id),
            Arc::new(file),
            false,
        )
    }

    /// Requests cancellation of an initializing or uploading session.
    pub fn cancel_upload(&self, organization_id: &str, video_id: &str) -> Result<(), StoreError> {
        let entry = self
            .get(video_id)
            .ok_or_else(|| StoreError::NotFound(video_id.to_string()))?;
        if entry.organization_id != organization_id {
            return Err(StoreError::OrganizationMismatch(video_id.to_string()));
        }
        let not_cancellable = || StoreError::NotCancellable {
            video_id: video_id.to_string(),
            status: entry.status(),
        };
        if !entry.status().is_active() {
            return Err(not_cancellable());
        }

        let sessions = lock(&self.inner.sessions);
        match sessions.get(video_id) {
            Some(s) if s.generation == entry.generation => {
                info!(video = video_id, "cancelling upload");
                s.cancel.cancel();
                Ok(())
            }
            _ => Err(not_cancellable()),
        }
    }

    /// Starts a fresh session for a failed or cancelled upload using the
    /// retained file.
    pub async fn retry_upload(&self, video_id: &str) -> Result<(), StoreError> {
        let entry = self
            .get(video_id)
            .ok_or_else(|| StoreError::NotFound(video_id.to_string()))?;
        if !matches!(
            entry.status(),
            UploadStatus::Failed | UploadStatus::Cancelled
        ) {
            return Err(StoreError::NotRetryable {
                video_id: video_id.to_string(),
                status: entry.status(),
            });
        }
        let file = entry
            .file
            .clone()
            .ok_or_else(|| StoreError::FileUnavailable(video_id.to_string()))?;

        self.stop_running(video_id).await;
        info!(video = video_id, "retrying upload");
        self.launch(
            UploadTarget::new(entry.organization_id, video_id),
            file,
            true,
        )
    }

    /// Removes a finished entry.
    pub fn dismiss_upload(&self, video_id: &str) -> Result<UploadEntry, StoreError> {
        let removed = self.update(|entries| {
            let pos = entries
                .iter()
                .position(|e| e.video_id == video_id)
                .ok_or_else(|| StoreError::NotFound(video_id.to_string()))?;
            let status = entries[pos].status();
            if !status.is_terminal() {
                return Err(StoreError::NotTerminal {
                    video_id: video_id.to_string(),
                    status,
                });
            }
            Ok(entries.remove(pos))
        })?;
        lock(&self.inner.callbacks).remove(video_id);
        Ok(removed)
    }

    /// Applies a progress event reported by another process.
    ///
    /// Such entries carry no file and cannot be retried here. Events for
    /// videos this process is uploading itself are ignored. Returns `true`
    /// if the event changed the store.
    pub fn ingest_progress(&self, organization_id: &str, progress: UploadProgress) -> bool {
        self.update(|entries| {
            match entries.iter_mut().find(|e| e.video_id == progress.video_id) {
                Some(entry) if entry.file.is_some() => Err(()),
                Some(entry) if entry.organization_id != organization_id => Err(()),
                Some(entry) => {
                    if !entry.progress.status.can_transition_to(progress.status) {
                        return Err(());
                    }
                    entry.progress = advance(&entry.progress, progress);
                    Ok(())
                }
                None => {
                    entries.push(UploadEntry {
                        video_id: progress.video_id.clone(),
                        organization_id: organization_id.to_string(),
                        file: None,
                        progress,
                        generation: 0,
                        started_at: Utc::now(),
                        object_location: None,
                    });
                    Ok(())
                }
            }
        })
        .is_ok()
    }

    /// Waits until the mirror file reflects the latest active set.
    pub async fn flush_persistence(&self) {
        if let Some(mirror) = &self.inner.mirror {
            mirror.flush().await;
        }
    }

    /// Waits until the session currently running for `video_id`, if any,
    /// has reached a terminal state and its callbacks have run.
    pub async fn wait_until_settled(&self, video_id: &str) {
        let finished = lock(&self.inner.sessions)
            .get(video_id)
            .map(|s| s.finished.clone());
        if let Some(mut finished) = finished {
            let _ = finished.wait_for(|done| *done).await;
        }
    }

    /// Waits for post-completion hooks spawned so far.
    pub async fn wait_for_hooks(&self) {
        let tasks = std::mem::take(&mut *lock(&self.inner.hook_tasks));
        for task in tasks {
            let _ = task.await;
        }
    }

    // -----------------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------------

    async fn stop_running(&self, video_id: &str) {
        let running = lock(&self.inner.sessions)
            .get(video_id)
            .map(|s| (s.cancel.clone(), s.finished.clone()));
        if let Some((cancel, mut finished)) = running {
            debug!(video = video_id, "stopping superseded session");
            cancel.cancel();
            let _ = finished.wait_for(|done| *done).await;
        }
    }

    fn launch(
        &self,
        target: UploadTarget,
        file: Arc<VideoFile>,
        resume: bool,
    ) -> Result<(), StoreError> {
        let config = &self.inner.config;
        let plan = plan_parts(file.size, config.part_size, config.max_parts)?;
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);

        let entry = UploadEntry {
            video_id: target.video_id.clone(),
            organization_id: target.organization_id.clone(),
            file: Some(Arc::clone(&file)),
            progress: UploadProgress::initializing(
                target.video_id.clone(),
                file.name.clone(),
                file.size,
                plan.len() as u32,
            ),
            generation,
            started_at: Utc::now(),
            object_location: None,
        };
        self.update(|entries| {
            match entries.iter_mut().find(|e| e.video_id == entry.video_id) {
                Some(existing) => *existing = entry,
                None => entries.push(entry),
            }
            Ok::<_, ()>(())
        })
        .ok();

        let coordinator = UploadCoordinator::new(
            Arc::clone(&self.inner.api),
            Arc::clone(&self.inner.transport),
            config.clone(),
        );
        let cancel = coordinator.cancel_token();
        let (done_tx, done_rx) = watch::channel(false);

        let mut sessions = lock(&self.inner.sessions);
        if let Some(previous) = sessions.get(&target.video_id) {
            previous.cancel.cancel();
        }
        info!(
            upload = %target,
            file = %file.name,
            bytes = file.size,
            generation,
            resume,
            "upload started"
        );
        let store = self.clone();
        let video_id = target.video_id.clone();
        tokio::spawn(async move {
            store
                .drive_session(coordinator, target, file, resume, generation)
                .await;
            let _ = done_tx.send(true);
        });
        sessions.insert(
            video_id,
            RunningSession {
                generation,
                cancel,
                finished: done_rx,
            },
        );
        Ok(())
    }

    async fn drive_session(
        &self,
        coordinator: UploadCoordinator,
        target: UploadTarget,
        file: Arc<VideoFile>,
        resume: bool,
        generation: u64,
    ) {
        let video_id = target.video_id.clone();
        let callbacks = lock(&self.inner.callbacks).get(&video_id).cloned();

        let store = self.clone();
        let progress_callbacks = callbacks.clone();
        let progress_video = video_id.clone();
        let on_progress: ProgressCallback = Arc::new(move |progress| {
            if store.apply_progress(&progress_video, generation, progress)
                && let Some(cb) = progress_callbacks
                    .as_ref()
                    .and_then(|c| c.on_progress.as_ref())
            {
                cb(progress);
            }
        });

        let request = UploadRequest {
            target: target.clone(),
            file: Arc::clone(&file),
            resume,
        };
        match coordinator.run(request, on_progress).await {
            Ok(done) => {
                self.record_location(&video_id, generation, &done.object_location);
                if let Some(cb) = callbacks.as_ref().and_then(|c| c.on_complete.as_ref()) {
                    cb(&done);
                }
                if let Some(hook) = self.inner.hook.clone() {
                    let task = tokio::spawn(async move {
                        if let Err(e) = hook.on_completed(&target, &file).await {
                            warn!(upload = %target, error = %e, "post-completion hook failed");
                        }
                    });
                    let mut tasks = lock(&self.inner.hook_tasks);
                    tasks.retain(|t| !t.is_finished());
                    tasks.push(task);
                }
            }
            Err(UploadError::Cancelled) => {}
            Err(e) => {
                if let Some(cb) = callbacks.as_ref().and_then(|c| c.on_error.as_ref()) {
                    cb(&e);
                }
            }
        }

        let mut sessions = lock(&self.inner.sessions);
        if sessions
            .get(&video_id)
            .is_some_and(|s| s.generation == generation)
        {
            sessions.remove(&video_id);
        }
    }

    /// Applies a coordinator event if it belongs to the entry's current
    /// generation and moves the status forward.
    fn apply_progress(&self, video_id: &str, generation: u64, progress: &UploadProgress) -> bool {
        self.update(|entries| {
            let entry = entries
                .iter_mut()
                .find(|e| e.video_id == video_id)
                .ok_or(())?;
            if entry.generation != generation {
                debug!(
                    video = video_id,
                    generation,
                    current = entry.generation,
                    "dropping event from superseded session"
                );
                return Err(());
            }
            if !entry.progress.status.can_transition_to(progress.status) {
                debug!(
                    video = video_id,
                    from = %entry.progress.status,
                    to = %progress.status,
                    "dropping out-of-order event"
                );
                return Err(());
            }
            entry.progress = advance(&entry.progress, progress.clone());
            Ok(())
        })
        .is_ok()
    }

    fn record_location(&self, video_id: &str, generation: u64, location: &str) {
        let _ = self.update(|entries| {
            let entry = entries
                .iter_mut()
                .find(|e| e.video_id == video_id && e.generation == generation)
                .ok_or(())?;
            entry.object_location = Some(location.to_string());
            Ok::<_, ()>(())
        });
    }

    // -----------------------------------------------------------------------
    // Update path
    // -----------------------------------------------------------------------

    /// Runs `mutate` on a copy of the entries and, if it succeeds, publishes
    /// the copy, mirrors the active set and notifies listeners. Updates are
    /// serialized; an error leaves the store untouched.
    fn update<R, E>(
        &self,
        mutate: impl FnOnce(&mut Vec<UploadEntry>) -> Result<R, E>,
    ) -> Result<R, E> {
        let _serial = lock(&self.inner.update_lock);
        let mut next = (*self.snapshot()).clone();
        let out = mutate(&mut next)?;

        let next: Snapshot = Arc::new(next);
        *write(&self.inner.entries) = Arc::clone(&next);
        self.persist_active(&next);

        let listeners: Vec<Listener> = read(&self.inner.listeners)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(&next);
        }
        Ok(out)
    }

    /// Hands the active set to the mirror writer. Runs under the update
    /// lock so writes follow update order; the file itself is written off
    /// the runtime threads.
    fn persist_active(&self, entries: &[UploadEntry]) {
        if let Some(mirror) = &self.inner.mirror {
            mirror.publish(active_set(entries));
        }
    }
}

/// Background writer of the active-upload mirror.
///
/// Bursts of changes collapse into the latest set; each write runs on the
/// blocking pool.
struct MirrorWriter {
    latest: watch::Sender<(u64, Vec<ActiveUpload>)>,
    written: watch::Receiver<u64>,
}

impl MirrorWriter {
    fn spawn(store: ActiveUploadStore, on_disk: Vec<ActiveUpload>) -> Self {
        let (latest, latest_rx) = watch::channel((0, on_disk));
        let (written_tx, written) = watch::channel(0);
        tokio::spawn(write_mirror(store, latest_rx, written_tx));
        Self { latest, written }
    }

    fn publish(&self, active: Vec<ActiveUpload>) {
        self.latest.send_if_modified(|(version, current)| {
            if *current == active {
                return false;
            }
            *current = active;
            *version += 1;
            true
        });
    }

    async fn flush(&self) {
        let target = self.latest.borrow().0;
        let mut written = self.written.clone();
        let _ = written.wait_for(|v| *v >= target).await;
    }
}

async fn write_mirror(
    store: ActiveUploadStore,
    mut latest: watch::Receiver<(u64, Vec<ActiveUpload>)>,
    written: watch::Sender<u64>,
) {
    while latest.changed().await.is_ok() {
        let (version, active) = latest.borrow_and_update().clone();
        let target = store.clone();
        match tokio::task::spawn_blocking(move || target.save(&active)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to persist active uploads"),
            Err(e) => warn!(error = %e, "active upload writer stopped"),
        }
        written.send_replace(version);
    }
}

/// Replaces `current` with `next`, never letting the acknowledged byte and
/// part counters go backwards.
fn advance(current: &UploadProgress, mut next: UploadProgress) -> UploadProgress {
    next.uploaded_bytes = next.uploaded_bytes.max(current.uploaded_bytes);
    next.completed_parts = next.completed_parts.max(current.completed_parts);
    next
}

/// Local uploads still moving bytes.
fn active_set(entries: &[UploadEntry]) -> Vec<ActiveUpload> {
    entries
        .iter()
        .filter(|e| e.file.is_some() && e.status().is_active())
        .map(|e| ActiveUpload {
            video_id: e.video_id.clone(),
            organization_id: e.organization_id.clone(),
        })
        .collect()
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}
