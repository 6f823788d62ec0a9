use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use mitt_protocol::{UploadProgress, UploadStatus};

use crate::error::UploadError;

/// Receives every progress projection a session emits.
pub type ProgressCallback = Arc<dyn Fn(&UploadProgress) + Send + Sync>;

/// A local file selected for upload.
///
/// `size` is captured when the file is selected; parts are planned from it
/// and a file that no longer has this size is refused mid-upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFile {
    pub path: PathBuf,
    pub name: String,
    pub size: u64,
}

impl VideoFile {
    /// Stats `path` and captures its name and current size.
    pub async fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let meta = tokio::fs::metadata(&path).await?;
        if !meta.is_file() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            name,
            size: meta.len(),
            path,
        })
    }
}

/// Outcome of a finalized session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedUpload {
    pub video_id: String,
    pub organization_id: String,
    pub session_id: String,
    pub object_location: String,
}

/// One upload as tracked by the progress store.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadEntry {
    pub video_id: String,
    pub organization_id: String,
    /// Retained so a failed or cancelled upload can be retried. `None` for
    /// entries reported from another process.
    pub file: Option<Arc<VideoFile>>,
    pub progress: UploadProgress,
    /// Session generation that owns this entry; events from older
    /// generations are ignored.
    pub generation: u64,
    pub started_at: DateTime<Utc>,
    pub object_location: Option<String>,
}

impl UploadEntry {
    pub fn status(&self) -> UploadStatus {
        self.progress.status
    }

    /// Whether [`crate::ProgressStore::retry_upload`] would accept this entry.
    pub fn can_retry(&self) -> bool {
        self.file.is_some()
            && matches!(
                self.progress.status,
                UploadStatus::Failed | UploadStatus::Cancelled
            )
    }
}

/// Caller hooks for one upload.
///
/// Kept with the entry so a retry reports to the same place as the
/// original attempt.
#[derive(Default)]
pub struct UploadCallbacks {
    pub(crate) on_progress: Option<Box<dyn Fn(&UploadProgress) + Send + Sync>>,
    pub(crate) on_complete: Option<Box<dyn Fn(&FinalizedUpload) + Send + Sync>>,
    pub(crate) on_error: Option<Box<dyn Fn(&UploadError) + Send + Sync>>,
}

impl UploadCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_progress(mut self, f: impl Fn(&UploadProgress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl Fn(&FinalizedUpload) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    /// Called for failures. Cancellation is not reported here.
    pub fn on_error(mut self, f: impl Fn(&UploadError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for UploadCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadCallbacks")
            .field("on_progress", &self.on_progress.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}
