//! Per-image download flow: metadata capture, stripping re-encode, naming
//! and dispatch.

pub mod activity;

use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, FixedOffset, Local};
use thiserror::Error;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use url::Url;

pub use activity::{ActivityEntry, ActivityLog, LogKind, ACTIVITY_MAX_ENTRIES, ACTIVITY_STORAGE_KEY};

use crate::config::Settings;
use crate::metadata::chunk_reader::has_png_signature;
use crate::metadata::{extract, normalize, GenerationRecord, HistoryStore};
use crate::naming::{build_path, NamingContext};
use crate::store::SharedKvStore;
use crate::transcode::{
    Artifact, Degradation, FetchError, ImageCodec, ImageFetcher, ImageSource, OutputFormat,
    RasterCodec, TranscodeStage, Transcoder,
};

const FALLBACK_EXTENSION: &str = "png";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    /// Relative, `/`-separated path.
    pub filename: String,
}

/// Hands a finished artifact to whatever persists it. Fire-and-forget: the
/// pipeline never learns whether the write succeeded.
pub trait DownloadDispatcher: Send + Sync + 'static {
    fn dispatch(&self, request: DownloadRequest);
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("failed to write '{path}': {message}")]
    Write { path: String, message: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    pub written: usize,
    pub failed: usize,
}

/// Writes downloads below an output root on the tokio runtime.
pub struct FileDownloadDispatcher {
    output_root: PathBuf,
    fetcher: ImageFetcher,
    pending: Mutex<Vec<JoinHandle<()>>>,
    tally: Arc<WriteTally>,
}

#[derive(Debug, Default)]
struct WriteTally {
    written: AtomicUsize,
    failed: AtomicUsize,
}

impl FileDownloadDispatcher {
    pub fn new(output_root: impl Into<PathBuf>, fetcher: ImageFetcher) -> Self {
        Self {
            output_root: output_root.into(),
            fetcher,
            pending: Mutex::new(Vec::new()),
            tally: Arc::new(WriteTally::default()),
        }
    }

    pub fn output_root(&self) -> &Path {
        self.output_root.as_path()
    }

    /// Writes still being tracked. Finished ones are dropped on the next
    /// dispatch.
    pub fn pending_len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Waits for every write dispatched so far and resets the counts.
    pub async fn flush(&self) -> FlushSummary {
        let handles = mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner));
        let mut crashed = 0;
        for handle in handles {
            if let Err(error) = handle.await {
                warn!(error = %error, "download write task failed");
                crashed += 1;
            }
        }
        FlushSummary {
            written: self.tally.written.swap(0, Ordering::SeqCst),
            failed: self.tally.failed.swap(0, Ordering::SeqCst) + crashed,
        }
    }
}

impl DownloadDispatcher for FileDownloadDispatcher {
    fn dispatch(&self, request: DownloadRequest) {
        let Some(target) = resolve_target(self.output_root.as_path(), request.filename.as_str())
        else {
            warn!(filename = %request.filename, "download path has no usable segments");
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(filename = %request.filename, "download dispatched outside a runtime");
            return;
        };
        let fetcher = self.fetcher.clone();
        let tally = Arc::clone(&self.tally);
        let task = runtime.spawn(async move {
            match write_download(&fetcher, request.url.as_str(), target.as_path()).await {
                Ok(()) => {
                    info!(path = %target.display(), "download written");
                    tally.written.fetch_add(1, Ordering::SeqCst);
                }
                Err(error) => {
                    warn!(path = %target.display(), error = %error, "download write failed");
                    tally.failed.fetch_add(1, Ordering::SeqCst);
                }
            }
        });
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|handle| !handle.is_finished());
        pending.push(task);
    }
}

async fn write_download(
    fetcher: &ImageFetcher,
    url: &str,
    target: &Path,
) -> Result<(), DispatchError> {
    let fetched = fetcher.try_fetch(&ImageSource::parse(url)).await?;
    let write_error = |error: std::io::Error| DispatchError::Write {
        path: target.display().to_string(),
        message: error.to_string(),
    };
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(write_error)?;
    }
    tokio::fs::write(target, fetched.bytes)
        .await
        .map_err(write_error)
}

/// Joins the relative download path under `root`, ignoring segments that
/// could climb out of it.
fn resolve_target(root: &Path, filename: &str) -> Option<PathBuf> {
    let segments = filename
        .split(['/', '\\'])
        .filter(|segment| !matches!(*segment, "" | "." | ".."))
        .collect::<Vec<_>>();
    if segments.is_empty() {
        return None;
    }
    Some(segments.into_iter().fold(root.to_path_buf(), |path, segment| path.join(segment)))
}

#[derive(Debug, Clone, PartialEq)]
pub struct SavedImage {
    pub index: usize,
    pub filename: String,
    pub format: Option<OutputFormat>,
    pub stage: TranscodeStage,
    pub degradation: Option<Degradation>,
    pub final_quality: Option<f32>,
    pub record: Option<GenerationRecord>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImageOutcome {
    NothingToSave { index: usize },
    Dispatched(SavedImage),
}

impl ImageOutcome {
    pub fn saved(&self) -> Option<&SavedImage> {
        match self {
            Self::Dispatched(saved) => Some(saved),
            Self::NothingToSave { .. } => None,
        }
    }
}

/// Concurrent per-image tasks from one `download_visible` call. Dropping the
/// batch leaves the tasks running.
#[derive(Debug)]
pub struct DownloadBatch {
    tasks: JoinSet<ImageOutcome>,
    len: usize,
}

impl DownloadBatch {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Outcomes in completion order.
    pub async fn wait(mut self) -> Vec<ImageOutcome> {
        let mut tasks = mem::take(&mut self.tasks);
        let mut outcomes = Vec::with_capacity(self.len);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(error) => warn!(error = %error, "image download task failed"),
            }
        }
        outcomes
    }
}

impl Drop for DownloadBatch {
    fn drop(&mut self) {
        self.tasks.detach_all();
    }
}

pub struct DownloadPipeline<C: RasterCodec = ImageCodec> {
    transcoder: Transcoder<C>,
    history: HistoryStore,
    activity: ActivityLog,
    dispatcher: Arc<dyn DownloadDispatcher>,
}

impl<C: RasterCodec> DownloadPipeline<C> {
    pub fn new(
        transcoder: Transcoder<C>,
        store: SharedKvStore,
        dispatcher: Arc<dyn DownloadDispatcher>,
    ) -> Self {
        Self {
            transcoder,
            history: HistoryStore::new(Arc::clone(&store)),
            activity: ActivityLog::new(store),
            dispatcher,
        }
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn activity(&self) -> &ActivityLog {
        &self.activity
    }

    pub async fn download_item(
        &self,
        source: ImageSource,
        index: usize,
        settings: &Settings,
    ) -> ImageOutcome {
        self.download_item_at(source, index, settings, Local::now().fixed_offset())
            .await
    }

    pub async fn download_item_at(
        &self,
        source: ImageSource,
        index: usize,
        settings: &Settings,
        now: DateTime<FixedOffset>,
    ) -> ImageOutcome {
        if source.is_empty() {
            debug!(index, "empty image source, nothing to save");
            return ImageOutcome::NothingToSave { index };
        }

        let fetched = self.transcoder.fetcher().fetch(&source).await;
        let source_mime = fetched.as_ref().map(|f| f.mime_type.clone());
        let record = fetched
            .as_ref()
            .filter(|f| has_png_signature(f.bytes.as_slice()))
            .and_then(|f| normalize(&extract(f.bytes.as_slice())));

        let outcome = self
            .transcoder
            .transcode_fetched(source.clone(), fetched, settings.format, settings.quality)
            .await;
        let (extension, format) = match &outcome.artifact {
            Artifact::Encoded { format, .. } => (format.extension().to_string(), Some(*format)),
            Artifact::Original(original) => (original_extension(original), None),
        };

        let ctx = NamingContext::new(index, now).with_record(record.as_ref());
        let filename = build_path(
            settings.filename.as_str(),
            settings.sub_dir.as_str(),
            &ctx,
            extension.as_str(),
        );

        let record = record.map(|record| {
            record.with_origin(
                filename.clone(),
                source.origin(),
                source_mime.unwrap_or_default(),
            )
        });
        if let Some(record) = &record {
            if let Err(error) = self.history.append(record.clone()).await {
                self.activity
                    .error(format!("failed to save generation record: {error}"))
                    .await;
            }
        }

        self.dispatcher.dispatch(DownloadRequest {
            url: outcome.artifact.url(),
            filename: filename.clone(),
        });

        match outcome.degradation {
            Some(degradation) => {
                self.activity
                    .warn(format!("{}: {filename}", degradation.message()))
                    .await
            }
            None => {
                self.activity
                    .success(format!("download dispatched: {filename}"))
                    .await
            }
        }

        ImageOutcome::Dispatched(SavedImage {
            index,
            filename,
            format,
            stage: outcome.stage,
            degradation: outcome.degradation,
            final_quality: outcome.final_quality,
            record,
        })
    }
}

impl<C: RasterCodec> DownloadPipeline<C> {
    /// Spawns one task per image with 1-based indices. `None` for `images`
    /// means no grid was found.
    pub async fn download_visible(
        self: &Arc<Self>,
        images: Option<Vec<String>>,
        settings: &Settings,
    ) -> Option<DownloadBatch> {
        let Some(images) = images else {
            self.activity.error("no generated images found").await;
            return None;
        };
        let images = images
            .into_iter()
            .filter(|src| !src.trim().is_empty())
            .collect::<Vec<_>>();
        if images.is_empty() {
            self.activity.info("no images to download").await;
            return None;
        }

        self.activity
            .success(format!("downloading {} images", images.len()))
            .await;
        let mut tasks = JoinSet::new();
        let len = images.len();
        for (offset, src) in images.into_iter().enumerate() {
            let pipeline = Arc::clone(self);
            let settings = settings.clone();
            tasks.spawn(async move {
                pipeline
                    .download_item(ImageSource::parse(src.as_str()), offset + 1, &settings)
                    .await
            });
        }
        Some(DownloadBatch { tasks, len })
    }
}

/// Extension for an artifact that kept its original bytes.
fn original_extension(source: &ImageSource) -> String {
    let ext = match source {
        ImageSource::Url(url) => Url::parse(url)
            .ok()
            .and_then(|url| url.path_segments()?.next_back().and_then(extension_of))
            .or_else(|| {
                let path = url.split(['?', '#']).next().unwrap_or_default();
                path.rsplit('/').next().and_then(extension_of)
            }),
        ImageSource::File(path) => path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(extension_of),
        ImageSource::DataUrl(url) => url
            .strip_prefix("data:")
            .and_then(|rest| rest.split([';', ',']).next())
            .and_then(extension_for_mime),
        ImageSource::Bytes { mime_type, .. } => extension_for_mime(mime_type),
    };
    ext.unwrap_or_else(|| String::from(FALLBACK_EXTENSION))
}

fn extension_of(file_name: &str) -> Option<String> {
    let (_, ext) = file_name.rsplit_once('.')?;
    is_plain_extension(ext).then(|| ext.to_ascii_lowercase())
}

fn extension_for_mime(mime_type: &str) -> Option<String> {
    if let Some(format) = OutputFormat::from_mime_type(mime_type) {
        return Some(format.extension().to_string());
    }
    let (_, subtype) = mime_type.trim().split_once('/')?;
    is_plain_extension(subtype).then(|| subtype.to_ascii_lowercase())
}

fn is_plain_extension(ext: &str) -> bool {
    !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric())
}
