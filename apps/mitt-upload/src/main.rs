//! `mitt-upload`: sends a local match video to an existing video record.
//!
//! Progress is logged as parts are acknowledged. Ctrl-C cancels the upload;
//! `--retries` re-runs a failed upload, skipping parts the server already
//! holds.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, bail};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mitt_protocol::{UploadProgress, UploadStatus};
use mitt_upload_api::{HttpPartTransport, HttpUploadApi, PartTransport, UploadApi};
use mitt_uploader::{
    ActiveUploadStore, CoordinatorConfig, FfmpegFrameExtractor, ProgressStore, ThumbnailHook,
    UploadCallbacks, UploaderConfig, VideoFile,
};

#[derive(Debug, Parser)]
#[command(name = "mitt-upload", version, about = "Upload a match video to Mitt")]
struct Cli {
    /// Video file to upload.
    file: PathBuf,

    /// Organization that owns the video.
    #[arg(long)]
    org: String,

    /// Video record to attach the file to.
    #[arg(long)]
    video: String,

    /// Configuration file (defaults to `$XDG_CONFIG_HOME/mitt/uploader.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Session cookie sent with every API request.
    #[arg(long, env = "MITT_SESSION_COOKIE", hide_env_values = true)]
    cookie: Option<String>,

    /// Upload API base URL, overriding the configuration.
    #[arg(long)]
    api_url: Option<String>,

    /// Parts sent in parallel, overriding the configuration.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Retry a failed upload up to N times.
    #[arg(long, default_value_t = 0)]
    retries: u32,

    /// Skip the thumbnail after a successful upload.
    #[arg(long)]
    no_thumbnail: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,mitt_uploader=debug")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => UploaderConfig::load_from(path)?,
        None => UploaderConfig::load()?,
    };
    if let Some(url) = &cli.api_url {
        config.api_base_url = url.clone();
    }
    if let Some(n) = cli.concurrency {
        config.concurrency = n;
    }
    if cli.no_thumbnail {
        config.thumbnail.enabled = false;
    }
    config.validate()?;

    let api: Arc<dyn UploadApi> = Arc::new(
        HttpUploadApi::new(&config.api_base_url, cli.cookie.as_deref())
            .context("failed to build API client")?,
    );
    let transport: Arc<dyn PartTransport> = Arc::new(
        HttpPartTransport::new(config.part_timeout()).context("failed to build part client")?,
    );

    let mut builder = ProgressStore::builder(Arc::clone(&api), transport)
        .config(CoordinatorConfig::from(&config));
    if let Some(dir) = config.resolved_state_dir() {
        builder = builder.persistence(ActiveUploadStore::in_dir(&dir));
    }
    if config.thumbnail.enabled {
        let extractor = Arc::new(FfmpegFrameExtractor::from_config(&config.thumbnail));
        builder = builder.hook(Arc::new(ThumbnailHook::new(Arc::clone(&api), extractor)));
    }
    let store = builder.build();

    for stale in store.interrupted_uploads() {
        warn!(
            video = %stale.video_id,
            org = %stale.organization_id,
            "upload was interrupted by a previous run and has to be started again"
        );
    }

    let file = VideoFile::open(&cli.file)
        .await
        .with_context(|| format!("cannot read {}", cli.file.display()))?;
    info!(file = %file.name, bytes = file.size, "uploading");

    store
        .start_upload(&cli.org, &cli.video, file, progress_logger())
        .await?;

    let outcome = drive(&store, &cli).await;
    store.flush_persistence().await;
    outcome
}

/// Waits for the upload to settle, retrying failures while `--retries`
/// allows, and prints the object location on success.
async fn drive(store: &ProgressStore, cli: &Cli) -> anyhow::Result<()> {
    let mut retries_left = cli.retries;
    loop {
        tokio::select! {
            _ = store.wait_until_settled(&cli.video) => {}
            _ = tokio::signal::ctrl_c() => {
                warn!("interrupt received, cancelling upload");
                if let Err(e) = store.cancel_upload(&cli.org, &cli.video) {
                    warn!(error = %e, "upload could not be cancelled");
                }
                store.wait_until_settled(&cli.video).await;
            }
        }

        let entry = store
            .get(&cli.video)
            .context("upload vanished from the store")?;
        match entry.status() {
            UploadStatus::Completed => {
                store.wait_for_hooks().await;
                println!("{}", entry.object_location.unwrap_or_default());
                return Ok(());
            }
            UploadStatus::Failed if retries_left > 0 => {
                retries_left -= 1;
                warn!(remaining = retries_left, "upload failed, retrying");
                store.retry_upload(&cli.video).await?;
            }
            UploadStatus::Failed => {
                let reason = entry
                    .progress
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "unknown error".into());
                bail!("upload failed: {reason}");
            }
            UploadStatus::Cancelled => bail!("upload cancelled"),
            other => bail!("upload stopped while {other}"),
        }
    }
}

/// Logs once per acknowledged part and on every status change.
fn progress_logger() -> UploadCallbacks {
    let last: Mutex<Option<(UploadStatus, u32)>> = Mutex::new(None);
    UploadCallbacks::new().on_progress(move |p: &UploadProgress| {
        let mut last = last.lock().unwrap_or_else(|e| e.into_inner());
        let key = (p.status, p.completed_parts);
        if *last == Some(key) {
            return;
        }
        *last = Some(key);
        info!(
            status = %p.status,
            parts = format_args!("{}/{}", p.completed_parts, p.total_parts),
            percent = format_args!("{:.1}", p.percentage()),
            retries = p.retries,
            "upload progress"
        );
    })
}
