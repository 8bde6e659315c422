//! Two-stage re-encode that strips source metadata.
//!
//! Every image passes through a JPEG raster encode first, which leaves no
//! ancillary chunk of the source behind. PNG and WEBP targets then decode that
//! JPEG and encode again. Each failure resolves to the best artifact produced
//! so far instead of an error.

pub mod codec;
pub mod source;

use std::sync::Arc;

use image::DynamicImage;
use tracing::{debug, warn};

pub use codec::{CodecError, ImageCodec, OutputFormat, RasterCodec};
pub use source::{FetchError, FetchedImage, ImageFetcher, ImageSource};

use codec::to_data_url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscodeStage {
    Fetching,
    Decoding,
    Stage1Encoding,
    Stage2Encoding,
    Done,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Degradation {
    FetchFailed,
    DecodeFailed,
    Stage1EncodeFailed,
    Stage2EncodeFailed,
}

impl Degradation {
    pub fn message(self) -> &'static str {
        match self {
            Self::FetchFailed => "could not load image bytes, using original",
            Self::DecodeFailed => "could not decode image, using original",
            Self::Stage1EncodeFailed => "metadata stripping failed, using original",
            Self::Stage2EncodeFailed => "target conversion failed, saving stripped jpeg",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
    Encoded { data_url: String, format: OutputFormat },
    Original(ImageSource),
}

impl Artifact {
    pub fn data_url(&self) -> Option<&str> {
        match self {
            Self::Encoded { data_url, .. } => Some(data_url.as_str()),
            Self::Original(_) => None,
        }
    }

    /// What to hand the download dispatcher.
    pub fn url(&self) -> String {
        match self {
            Self::Encoded { data_url, .. } => data_url.clone(),
            Self::Original(source) => source.to_reference(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscodeOutcome {
    pub artifact: Artifact,
    /// `Done` or `Degraded`.
    pub stage: TranscodeStage,
    pub degradation: Option<Degradation>,
    /// Quality handed to the encode that produced the artifact.
    pub final_quality: Option<f32>,
    pub trace: Vec<TranscodeStage>,
}

enum Step {
    Fetching,
    Decoding(FetchedImage),
    Stage1Encoding(DynamicImage),
    Stage2Encoding { jpeg: Vec<u8> },
    Finished {
        artifact: Artifact,
        degradation: Option<Degradation>,
        final_quality: Option<f32>,
    },
}

impl Step {
    fn stage(&self) -> TranscodeStage {
        match self {
            Self::Fetching => TranscodeStage::Fetching,
            Self::Decoding(_) => TranscodeStage::Decoding,
            Self::Stage1Encoding(_) => TranscodeStage::Stage1Encoding,
            Self::Stage2Encoding { .. } => TranscodeStage::Stage2Encoding,
            Self::Finished {
                degradation: None, ..
            } => TranscodeStage::Done,
            Self::Finished { .. } => TranscodeStage::Degraded,
        }
    }
}

pub struct Transcoder<C: RasterCodec = ImageCodec> {
    codec: Arc<C>,
    fetcher: ImageFetcher,
}

impl Transcoder<ImageCodec> {
    pub fn new() -> Result<Self, FetchError> {
        Ok(Self::with_codec(ImageCodec, ImageFetcher::new()?))
    }
}

impl<C: RasterCodec> Transcoder<C> {
    pub fn with_codec(codec: C, fetcher: ImageFetcher) -> Self {
        Self {
            codec: Arc::new(codec),
            fetcher,
        }
    }

    pub fn fetcher(&self) -> &ImageFetcher {
        &self.fetcher
    }

    pub async fn transcode(
        &self,
        source: ImageSource,
        target: OutputFormat,
        quality: f32,
    ) -> TranscodeOutcome {
        self.run(source, None, target, quality).await
    }

    /// Same as [`Transcoder::transcode`] for callers that already loaded the
    /// bytes. `None` means the load failed.
    pub async fn transcode_fetched(
        &self,
        source: ImageSource,
        fetched: Option<FetchedImage>,
        target: OutputFormat,
        quality: f32,
    ) -> TranscodeOutcome {
        let preloaded = Some(fetched);
        self.run(source, preloaded, target, quality).await
    }

    async fn run(
        &self,
        source: ImageSource,
        mut preloaded: Option<Option<FetchedImage>>,
        target: OutputFormat,
        quality: f32,
    ) -> TranscodeOutcome {
        let mut step = Step::Fetching;
        let mut trace = Vec::new();
        loop {
            trace.push(step.stage());
            step = match step {
                Step::Fetching => {
                    let fetched = match preloaded.take() {
                        Some(fetched) => fetched,
                        None => self.fetcher.fetch(&source).await,
                    };
                    match fetched {
                        Some(fetched) => Step::Decoding(fetched),
                        None => fall_back_to_original(&source, Degradation::FetchFailed),
                    }
                }
                Step::Decoding(fetched) => {
                    match self.decode(fetched.bytes, fetched.mime_type).await {
                        Ok(image) => Step::Stage1Encoding(image),
                        Err(error) => {
                            warn!(error = %error, "source decode failed");
                            fall_back_to_original(&source, Degradation::DecodeFailed)
                        }
                    }
                }
                Step::Stage1Encoding(image) => {
                    // A JPEG target finishes here, so it gets the requested quality.
                    let stage1_quality = match target {
                        OutputFormat::Jpeg => target.effective_quality(quality),
                        _ => 1.0,
                    };
                    match self.encode(image, OutputFormat::Jpeg, stage1_quality).await {
                        Ok(jpeg) if target == OutputFormat::Jpeg => Step::Finished {
                            artifact: Artifact::Encoded {
                                data_url: to_data_url(OutputFormat::Jpeg.mime_type(), &jpeg),
                                format: OutputFormat::Jpeg,
                            },
                            degradation: None,
                            final_quality: Some(stage1_quality),
                        },
                        Ok(jpeg) => Step::Stage2Encoding { jpeg },
                        Err(error) => {
                            warn!(error = %error, "stage-1 jpeg encode failed");
                            fall_back_to_original(&source, Degradation::Stage1EncodeFailed)
                        }
                    }
                }
                Step::Stage2Encoding { jpeg } => {
                    let final_quality = target.effective_quality(quality);
                    match self.reencode(jpeg.clone(), target, final_quality).await {
                        Ok(bytes) => Step::Finished {
                            artifact: Artifact::Encoded {
                                data_url: to_data_url(target.mime_type(), &bytes),
                                format: target,
                            },
                            degradation: None,
                            final_quality: Some(final_quality),
                        },
                        Err(error) => {
                            warn!(error = %error, target = target.extension(), "stage-2 encode failed, keeping stage-1 jpeg");
                            Step::Finished {
                                artifact: Artifact::Encoded {
                                    data_url: to_data_url(OutputFormat::Jpeg.mime_type(), &jpeg),
                                    format: OutputFormat::Jpeg,
                                },
                                degradation: Some(Degradation::Stage2EncodeFailed),
                                final_quality: Some(1.0),
                            }
                        }
                    }
                }
                Step::Finished {
                    artifact,
                    degradation,
                    final_quality,
                } => {
                    let stage = trace.last().copied().unwrap_or(TranscodeStage::Done);
                    debug!(?trace, "transcode finished");
                    return TranscodeOutcome {
                        artifact,
                        stage,
                        degradation,
                        final_quality,
                        trace,
                    };
                }
            };
        }
    }

    async fn decode(&self, bytes: Vec<u8>, mime_type: String) -> Result<DynamicImage, CodecError> {
        let codec = Arc::clone(&self.codec);
        run_blocking(move || codec.decode(&bytes, mime_type.as_str())).await
    }

    async fn encode(
        &self,
        image: DynamicImage,
        format: OutputFormat,
        quality: f32,
    ) -> Result<Vec<u8>, CodecError> {
        let codec = Arc::clone(&self.codec);
        run_blocking(move || codec.encode(&image, format, quality)).await
    }

    async fn reencode(
        &self,
        jpeg: Vec<u8>,
        target: OutputFormat,
        quality: f32,
    ) -> Result<Vec<u8>, CodecError> {
        let codec = Arc::clone(&self.codec);
        run_blocking(move || {
            let image = codec.decode(&jpeg, OutputFormat::Jpeg.mime_type())?;
            codec.encode(&image, target, quality)
        })
        .await
    }
}

fn fall_back_to_original(source: &ImageSource, degradation: Degradation) -> Step {
    Step::Finished {
        artifact: Artifact::Original(source.clone()),
        degradation: Some(degradation),
        final_quality: None,
    }
}

async fn run_blocking<T, F>(func: F) -> Result<T, CodecError>
where
    F: FnOnce() -> Result<T, CodecError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(func)
        .await
        .unwrap_or_else(|error| Err(CodecError::Worker(error.to_string())))
}
