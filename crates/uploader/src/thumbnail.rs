//! Post-completion hooks.
//!
//! After a session completes, the store runs its hook out of band: a frame
//! is pulled from the local file and sent as the video's thumbnail. Hook
//! failures never touch the upload's status.

use std::ffi::OsString;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use tracing::debug;

use mitt_upload_api::{ApiError, UploadApi, UploadTarget};

use crate::config::ThumbnailConfig;
use crate::types::VideoFile;

/// Boxed future returned by hook traits.
pub type HookFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, HookError>> + Send + 'a>>;

/// Content type of extracted frames.
pub const THUMBNAIL_CONTENT_TYPE: &str = "image/jpeg";

#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame extractor exited with {status}: {stderr}")]
    Extractor { status: String, stderr: String },

    #[error("frame extractor produced no image")]
    EmptyFrame,

    #[error("thumbnail upload failed: {0}")]
    Api(#[from] ApiError),
}

/// Produces a still image from a video file.
pub trait FrameExtractor: Send + Sync {
    /// Returns JPEG bytes of one frame of `video`.
    fn extract<'a>(&'a self, video: &'a Path) -> HookFuture<'a, Vec<u8>>;
}

/// Runs after a session reaches `completed`.
pub trait PostCompletionHook: Send + Sync {
    fn on_completed<'a>(&'a self, target: &'a UploadTarget, file: &'a VideoFile)
    -> HookFuture<'a, ()>;
}

/// Extracts a frame by piping one MJPEG image out of the `ffmpeg` binary.
#[derive(Debug, Clone)]
pub struct FfmpegFrameExtractor {
    program: String,
    offset_secs: f64,
}

impl FfmpegFrameExtractor {
    pub fn new(program: impl Into<String>, offset_secs: f64) -> Self {
        Self {
            program: program.into(),
            offset_secs: offset_secs.max(0.0),
        }
    }

    pub fn from_config(config: &ThumbnailConfig) -> Self {
        Self::new(config.ffmpeg_path.clone(), config.offset_secs)
    }

    fn args(&self, video: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = ["-hide_banner", "-loglevel", "error", "-ss"]
            .into_iter()
            .map(OsString::from)
            .collect();
        args.push(format!("{:.3}", self.offset_secs).into());
        args.push("-i".into());
        args.push(video.as_os_str().to_owned());
        for arg in [
            "-frames:v",
            "1",
            "-q:v",
            "3",
            "-f",
            "image2pipe",
            "-vcodec",
            "mjpeg",
            "pipe:1",
        ] {
            args.push(arg.into());
        }
        args
    }
}

impl FrameExtractor for FfmpegFrameExtractor {
    fn extract<'a>(&'a self, video: &'a Path) -> HookFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let output = tokio::process::Command::new(&self.program)
                .args(self.args(video))
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await?;

            if !output.status.success() {
                return Err(HookError::Extractor {
                    status: output.status.to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }
            if output.stdout.is_empty() {
                return Err(HookError::EmptyFrame);
            }
            debug!(video = %video.display(), bytes = output.stdout.len(), "frame extracted");
            Ok(output.stdout)
        })
    }
}

/// Uploads an extracted frame as the video's thumbnail.
pub struct ThumbnailHook {
    api: Arc<dyn UploadApi>,
    extractor: Arc<dyn FrameExtractor>,
}

impl ThumbnailHook {
    pub fn new(api: Arc<dyn UploadApi>, extractor: Arc<dyn FrameExtractor>) -> Self {
        Self { api, extractor }
    }
}

impl PostCompletionHook for ThumbnailHook {
    fn on_completed<'a>(
        &'a self,
        target: &'a UploadTarget,
        file: &'a VideoFile,
    ) -> HookFuture<'a, ()> {
        Box::pin(async move {
            let image = self.extractor.extract(&file.path).await?;
            self.api
                .upload_thumbnail(target, image, THUMBNAIL_CONTENT_TYPE)
                .await?;
            debug!(upload = %target, "thumbnail uploaded");
            Ok(())
        })
    }
}
