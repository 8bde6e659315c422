//! Repeated generate-then-download driver.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::time::sleep;
use tracing::debug;

use crate::config::Settings;
use crate::download::{DownloadBatch, DownloadPipeline};
use crate::transcode::{ImageCodec, RasterCodec};

/// The generation UI being driven.
pub trait GenerationPage: Send + Sync + 'static {
    /// Presses the generate trigger. `false` when the trigger is missing.
    fn press_generate(&self) -> bool;
    /// Whether the last requested generation has finished.
    fn generation_ready(&self) -> bool;
    /// Sources of the images on screen. `None` when the grid is missing.
    fn visible_images(&self) -> Option<Vec<String>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    ZeroCount,
    AlreadyRunning,
    Completed,
    Stopped,
    TriggerMissing,
    NothingToDownload,
}

/// Shared run state. `stop` only prevents new cycles; in-flight downloads
/// carry on.
#[derive(Debug, Default)]
pub struct AutomationState {
    running: AtomicBool,
    count: AtomicU32,
    max_count: AtomicU32,
}

impl AutomationState {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn max_count(&self) -> u32 {
        self.max_count.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn set_max_count(&self, max_count: u32) {
        self.max_count.store(max_count, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct AutomationSummary {
    pub generations: u32,
    pub stop_reason: StopReason,
    pub batches: Vec<DownloadBatch>,
}

pub struct AutoDownloader<P: GenerationPage, C: RasterCodec = ImageCodec> {
    page: Arc<P>,
    pipeline: Arc<DownloadPipeline<C>>,
    state: Arc<AutomationState>,
}

impl<P: GenerationPage, C: RasterCodec> AutoDownloader<P, C> {
    pub fn new(page: Arc<P>, pipeline: Arc<DownloadPipeline<C>>) -> Self {
        Self::with_state(page, pipeline, Arc::new(AutomationState::default()))
    }

    /// Shares `state` with whoever needs to stop the run or adjust its count.
    pub fn with_state(
        page: Arc<P>,
        pipeline: Arc<DownloadPipeline<C>>,
        state: Arc<AutomationState>,
    ) -> Self {
        Self {
            page,
            pipeline,
            state,
        }
    }

    pub fn state(&self) -> Arc<AutomationState> {
        Arc::clone(&self.state)
    }

    pub async fn run(&self, settings: &Settings) -> AutomationSummary {
        let activity = self.pipeline.activity();
        if settings.auto_count == 0 {
            activity.warn("auto repeat count is 0, check settings").await;
            return self.summary(StopReason::ZeroCount, Vec::new());
        }
        if self
            .state
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("auto download already running");
            return self.summary(StopReason::AlreadyRunning, Vec::new());
        }

        self.state.count.store(0, Ordering::SeqCst);
        self.state.set_max_count(settings.auto_count);
        activity
            .info(format!(
                "auto download started: {} generations",
                settings.auto_count
            ))
            .await;

        let mut batches = Vec::new();
        let reason = self.cycle(settings, &mut batches).await;

        self.state.stop();
        activity
            .warn(format!(
                "auto download stopped after {} generations",
                self.state.count()
            ))
            .await;
        self.summary(reason, batches)
    }

    async fn cycle(&self, settings: &Settings, batches: &mut Vec<DownloadBatch>) -> StopReason {
        let activity = self.pipeline.activity();
        loop {
            if !self.state.is_running() {
                return StopReason::Stopped;
            }
            let max = self.state.max_count();
            if self.state.count() >= max {
                return StopReason::Completed;
            }
            if !self.page.press_generate() {
                activity
                    .error("generate button not found, stopping auto download")
                    .await;
                return StopReason::TriggerMissing;
            }
            let current = self.state.count.fetch_add(1, Ordering::SeqCst) + 1;
            activity
                .info(format!("[{current}/{max}] generation requested"))
                .await;

            loop {
                sleep(settings.load_delay()).await;
                if self.page.generation_ready() {
                    break;
                }
                if !self.state.is_running() {
                    return StopReason::Stopped;
                }
            }

            match self
                .pipeline
                .download_visible(self.page.visible_images(), settings)
                .await
            {
                Some(batch) => {
                    batches.push(batch);
                    activity
                        .success(format!(
                            "[{current}/{max}] download started, next generation in {}ms",
                            settings.repeat_delay
                        ))
                        .await;
                }
                None => {
                    activity
                        .error("download failed, stopping auto download")
                        .await;
                    return StopReason::NothingToDownload;
                }
            }
            sleep(settings.repeat_delay()).await;
        }
    }

    fn summary(&self, stop_reason: StopReason, batches: Vec<DownloadBatch>) -> AutomationSummary {
        AutomationSummary {
            generations: self.state.count(),
            stop_reason,
            batches,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::download::DownloadDispatcher;
    use crate::fixtures::{decodable_png, RecordingDispatcher};
    use crate::store::MemoryKvStore;
    use crate::transcode::codec::to_data_url;
    use crate::transcode::Transcoder;

    struct FakePage {
        presses: AtomicUsize,
        polls: AtomicUsize,
        polls_until_ready: usize,
        has_trigger: bool,
        images: Option<Vec<String>>,
        stop_after_press: Option<Arc<AutomationState>>,
    }

    impl FakePage {
        fn with_images(images: Option<Vec<String>>) -> Self {
            Self {
                presses: AtomicUsize::new(0),
                polls: AtomicUsize::new(0),
                polls_until_ready: 2,
                has_trigger: true,
                images,
                stop_after_press: None,
            }
        }
    }

    impl GenerationPage for FakePage {
        fn press_generate(&self) -> bool {
            if self.has_trigger {
                self.presses.fetch_add(1, Ordering::SeqCst);
                if let Some(state) = &self.stop_after_press {
                    state.stop();
                }
            }
            self.has_trigger
        }

        fn generation_ready(&self) -> bool {
            let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            polls % self.polls_until_ready == 0
        }

        fn visible_images(&self) -> Option<Vec<String>> {
            self.images.clone()
        }
    }

    fn quick_settings(auto_count: u32) -> Settings {
        Settings {
            auto_count,
            load_delay: 1,
            repeat_delay: 1,
            ..Settings::default()
        }
    }

    fn pipeline() -> (Arc<DownloadPipeline>, Arc<RecordingDispatcher>) {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let pipeline = DownloadPipeline::new(
            Transcoder::new().expect("transcoder should build"),
            MemoryKvStore::shared(),
            Arc::clone(&dispatcher) as Arc<dyn DownloadDispatcher>,
        );
        (Arc::new(pipeline), dispatcher)
    }

    fn one_image() -> Option<Vec<String>> {
        Some(vec![to_data_url("image/png", &decodable_png(2, 2, &[]))])
    }

    #[tokio::test]
    async fn runs_exactly_auto_count_generations() {
        let (pipeline, dispatcher) = pipeline();
        let page = Arc::new(FakePage::with_images(one_image()));
        let driver = AutoDownloader::new(Arc::clone(&page), pipeline);

        let summary = driver.run(&quick_settings(3)).await;
        assert_eq!(summary.stop_reason, StopReason::Completed);
        assert_eq!(summary.generations, 3);
        assert_eq!(page.presses.load(Ordering::SeqCst), 3);
        assert_eq!(page.polls.load(Ordering::SeqCst), 6);
        assert!(!driver.state().is_running());

        for batch in summary.batches {
            batch.wait().await;
        }
        assert_eq!(dispatcher.filenames().len(), 3);
    }

    #[tokio::test]
    async fn zero_count_never_presses() {
        let (pipeline, _) = pipeline();
        let page = Arc::new(FakePage::with_images(one_image()));
        let driver = AutoDownloader::new(Arc::clone(&page), pipeline);
        let summary = driver.run(&quick_settings(0)).await;
        assert_eq!(summary.stop_reason, StopReason::ZeroCount);
        assert_eq!(page.presses.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_trigger_or_images_stop_the_run() {
        let (pipeline, _) = pipeline();
        let page = Arc::new(FakePage {
            has_trigger: false,
            ..FakePage::with_images(one_image())
        });
        let summary = AutoDownloader::new(page, Arc::clone(&pipeline))
            .run(&quick_settings(2))
            .await;
        assert_eq!(summary.stop_reason, StopReason::TriggerMissing);
        assert_eq!(summary.generations, 0);

        let page = Arc::new(FakePage::with_images(None));
        let summary = AutoDownloader::new(page, pipeline)
            .run(&quick_settings(2))
            .await;
        assert_eq!(summary.stop_reason, StopReason::NothingToDownload);
        assert_eq!(summary.generations, 1);
    }

    #[tokio::test]
    async fn stop_prevents_the_next_cycle() {
        let (pipeline, _) = pipeline();
        let state = Arc::new(AutomationState::default());
        let page = Arc::new(FakePage {
            stop_after_press: Some(Arc::clone(&state)),
            polls_until_ready: 1000,
            ..FakePage::with_images(one_image())
        });
        let summary = AutoDownloader::with_state(page, pipeline, Arc::clone(&state))
            .run(&quick_settings(5))
            .await;
        assert_eq!(summary.stop_reason, StopReason::Stopped);
        assert_eq!(summary.generations, 1);
        assert!(!state.is_running());
    }

    #[tokio::test]
    async fn second_run_is_refused_while_active() {
        let (pipeline, _) = pipeline();
        let page = Arc::new(FakePage::with_images(one_image()));
        let driver = AutoDownloader::new(page, pipeline);
        driver.state.running.store(true, Ordering::SeqCst);
        let summary = driver.run(&quick_settings(2)).await;
        assert_eq!(summary.stop_reason, StopReason::AlreadyRunning);
    }

    #[test]
    fn max_count_can_change_mid_run() {
        let state = AutomationState::default();
        state.set_max_count(4);
        assert_eq!(state.max_count(), 4);
        state.set_max_count(1);
        assert_eq!(state.max_count(), 1);
    }
}
