//! Resumable multipart video uploads.
//!
//! [`UploadCoordinator`] moves one file to one video through a single
//! multipart session. [`ProgressStore`] owns the coordinators of a process,
//! publishes their progress as snapshots and implements cancel, retry and
//! dismiss on top of them.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod persistence;
pub mod store;
pub mod thumbnail;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, RetryConfig, ThumbnailConfig, UploaderConfig};
pub use coordinator::{CoordinatorConfig, UploadCoordinator, UploadRequest};
pub use error::{StoreError, UploadError};
pub use persistence::{ACTIVE_UPLOADS_KEY, ActiveUploadStore, PersistError};
pub use store::{ProgressStore, ProgressStoreBuilder, Snapshot, Subscription};
pub use thumbnail::{
    FfmpegFrameExtractor, FrameExtractor, HookError, PostCompletionHook, ThumbnailHook,
};
pub use types::{FinalizedUpload, ProgressCallback, UploadCallbacks, UploadEntry, VideoFile};
