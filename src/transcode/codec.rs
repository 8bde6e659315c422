use std::io::Cursor;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum OutputFormat {
    #[default]
    Jpeg,
    Webp,
    Png,
}

impl OutputFormat {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => Some(Self::Jpeg),
            "webp" => Some(Self::Webp),
            "png" => Some(Self::Png),
            _ => None,
        }
    }

    pub fn from_mime_type(mime_type: &str) -> Option<Self> {
        match mime_type.trim().to_ascii_lowercase().as_str() {
            "image/jpeg" | "image/jpg" => Some(Self::Jpeg),
            "image/webp" => Some(Self::Webp),
            "image/png" => Some(Self::Png),
            _ => None,
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Webp => "image/webp",
            Self::Png => "image/png",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Webp => "webp",
            Self::Png => "png",
        }
    }

    /// PNG is lossless, so any requested quality collapses to 1.0. WEBP at
    /// 1.0 is encoded lossless, anything lower lossy.
    pub fn effective_quality(self, requested: f32) -> f32 {
        match self {
            Self::Png => 1.0,
            _ if requested.is_finite() => requested.clamp(0.0, 1.0),
            _ => 1.0,
        }
    }
}

impl From<String> for OutputFormat {
    fn from(value: String) -> Self {
        Self::parse(value.as_str()).unwrap_or_default()
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("decode {mime_type} failed: {message}")]
    Decode { mime_type: String, message: String },
    #[error("encode {format:?} failed: {message}")]
    Encode { format: OutputFormat, message: String },
    #[error("codec worker failed: {0}")]
    Worker(String),
}

/// Raster decode/encode used by the transcoder's stages.
pub trait RasterCodec: Send + Sync + 'static {
    fn decode(&self, bytes: &[u8], mime_type: &str) -> Result<DynamicImage, CodecError>;
    fn encode(
        &self,
        image: &DynamicImage,
        format: OutputFormat,
        quality: f32,
    ) -> Result<Vec<u8>, CodecError>;
}

#[derive(Debug, Default, Clone)]
pub struct ImageCodec;

impl RasterCodec for ImageCodec {
    fn decode(&self, bytes: &[u8], mime_type: &str) -> Result<DynamicImage, CodecError> {
        if let Some(format) = ImageFormat::from_mime_type(mime_type) {
            match image::load_from_memory_with_format(bytes, format) {
                Ok(image) => return Ok(image),
                Err(error) => {
                    debug!(mime_type, error = %error, "declared-format decode failed, sniffing content");
                }
            }
        }
        image::load_from_memory(bytes).map_err(|error| CodecError::Decode {
            mime_type: mime_type.to_string(),
            message: error.to_string(),
        })
    }

    fn encode(
        &self,
        image: &DynamicImage,
        format: OutputFormat,
        quality: f32,
    ) -> Result<Vec<u8>, CodecError> {
        let mut out = Cursor::new(Vec::new());
        let encoded = match format {
            OutputFormat::Jpeg => {
                let encoder = JpegEncoder::new_with_quality(&mut out, jpeg_quality(quality));
                DynamicImage::ImageRgb8(image.to_rgb8()).write_with_encoder(encoder)
            }
            OutputFormat::Png => image.write_with_encoder(PngEncoder::new(&mut out)),
            OutputFormat::Webp if quality < 1.0 => return encode_lossy_webp(image, quality),
            OutputFormat::Webp => DynamicImage::ImageRgba8(image.to_rgba8())
                .write_with_encoder(WebPEncoder::new_lossless(&mut out)),
        };
        encoded.map_err(|error| CodecError::Encode {
            format,
            message: error.to_string(),
        })?;
        Ok(out.into_inner())
    }
}

fn encode_lossy_webp(image: &DynamicImage, quality: f32) -> Result<Vec<u8>, CodecError> {
    let quality = (quality.clamp(0.0, 1.0) * 100.0).round();
    let encoded = if image.color().has_alpha() {
        let rgba = image.to_rgba8();
        webp::Encoder::from_rgba(rgba.as_raw(), rgba.width(), rgba.height())
            .encode_simple(false, quality)
            .map(|memory| memory.to_vec())
    } else {
        let rgb = image.to_rgb8();
        webp::Encoder::from_rgb(rgb.as_raw(), rgb.width(), rgb.height())
            .encode_simple(false, quality)
            .map(|memory| memory.to_vec())
    };
    encoded.map_err(|error| CodecError::Encode {
        format: OutputFormat::Webp,
        message: format!("{error:?}"),
    })
}

fn jpeg_quality(quality: f32) -> u8 {
    let scaled = if quality.is_finite() {
        (quality.clamp(0.0, 1.0) * 100.0).round()
    } else {
        100.0
    };
    (scaled as u8).clamp(1, 100)
}

pub fn to_data_url(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{mime_type};base64,{}", BASE64_STANDARD.encode(bytes))
}

/// Splits `data:<mime>;base64,<payload>`. An empty MIME reads as PNG.
pub fn parse_data_url(value: &str) -> Option<(String, Vec<u8>)> {
    let rest = value.strip_prefix("data:")?;
    let (mime_type, payload) = rest.split_once(";base64,")?;
    let bytes = BASE64_STANDARD.decode(payload.trim().as_bytes()).ok()?;
    let mime_type = if mime_type.trim().is_empty() {
        String::from("image/png")
    } else {
        mime_type.trim().to_string()
    };
    Some((mime_type, bytes))
}

pub fn mime_for_extension(ext: &str) -> String {
    match ext.trim().to_ascii_lowercase().as_str() {
        "png" => String::from("image/png"),
        "jpg" | "jpeg" => String::from("image/jpeg"),
        "webp" => String::from("image/webp"),
        "gif" => String::from("image/gif"),
        "bmp" => String::from("image/bmp"),
        _ => String::from("application/octet-stream"),
    }
}
