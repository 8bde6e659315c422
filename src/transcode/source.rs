use std::path::{Path, PathBuf};

use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE, PRAGMA};
use reqwest::Client;
use thiserror::Error;
use tracing::warn;
use url::Url;

use super::codec::{mime_for_extension, parse_data_url, to_data_url};

const DEFAULT_MIME_TYPE: &str = "image/png";

/// Where an image comes from. `Bytes` carries an already-loaded buffer and
/// its MIME type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Url(String),
    DataUrl(String),
    File(PathBuf),
    Bytes { bytes: Vec<u8>, mime_type: String },
}

impl ImageSource {
    pub fn parse(src: &str) -> Self {
        let trimmed = src.trim();
        if trimmed.starts_with("data:") {
            return Self::DataUrl(trimmed.to_string());
        }
        if trimmed.starts_with("file:") {
            if let Some(path) = Url::parse(trimmed)
                .ok()
                .and_then(|url| url.to_file_path().ok())
            {
                return Self::File(path);
            }
        }
        Self::Url(trimmed.to_string())
    }

    /// A URL a download dispatcher can consume directly.
    pub fn to_reference(&self) -> String {
        match self {
            Self::Url(url) | Self::DataUrl(url) => url.clone(),
            Self::File(path) => file_reference(path),
            Self::Bytes { bytes, mime_type } => to_data_url(mime_type, bytes),
        }
    }

    /// Where the image came from, for history records. In-memory buffers
    /// have no origin.
    pub fn origin(&self) -> String {
        match self {
            Self::Bytes { .. } => String::new(),
            other => other.to_reference(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Url(url) | Self::DataUrl(url) => url.is_empty(),
            Self::File(path) => path.as_os_str().is_empty(),
            Self::Bytes { bytes, .. } => bytes.is_empty(),
        }
    }
}

fn file_reference(path: &Path) -> String {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    Url::from_file_path(&absolute)
        .map(String::from)
        .unwrap_or_else(|()| path.display().to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http client init failed: {0}")]
    ClientInit(#[source] reqwest::Error),
    #[error("malformed data url")]
    MalformedDataUrl,
    #[error("failed to read '{path}': {message}")]
    ReadFile { path: String, message: String },
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("HTTP {status} for {url}")]
    Status { status: u16, url: String },
}

/// Loads source bytes. Requests carry no cookies and ask every cache along
/// the way to stay out of it.
#[derive(Debug, Clone)]
pub struct ImageFetcher {
    client: Client,
}

impl ImageFetcher {
    pub fn new() -> Result<Self, FetchError> {
        let client = Client::builder().build().map_err(FetchError::ClientInit)?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// `None` on any transport or format failure; the reason is logged.
    pub async fn fetch(&self, source: &ImageSource) -> Option<FetchedImage> {
        match self.try_fetch(source).await {
            Ok(fetched) => Some(fetched),
            Err(error) => {
                warn!(error = %error, "image buffer fetch failed");
                None
            }
        }
    }

    pub async fn try_fetch(&self, source: &ImageSource) -> Result<FetchedImage, FetchError> {
        match source {
            ImageSource::Bytes { bytes, mime_type } => Ok(FetchedImage {
                bytes: bytes.clone(),
                mime_type: mime_type.clone(),
            }),
            ImageSource::DataUrl(url) => {
                let (mime_type, bytes) =
                    parse_data_url(url.as_str()).ok_or(FetchError::MalformedDataUrl)?;
                Ok(FetchedImage { bytes, mime_type })
            }
            ImageSource::File(path) => {
                let bytes =
                    tokio::fs::read(path)
                        .await
                        .map_err(|error| FetchError::ReadFile {
                            path: path.display().to_string(),
                            message: error.to_string(),
                        })?;
                let ext = path
                    .extension()
                    .and_then(|v| v.to_str())
                    .unwrap_or_default();
                Ok(FetchedImage {
                    bytes,
                    mime_type: mime_for_extension(ext),
                })
            }
            ImageSource::Url(url) => {
                let resp = self
                    .client
                    .get(url.as_str())
                    .header(CACHE_CONTROL, "no-store")
                    .header(PRAGMA, "no-cache")
                    .send()
                    .await
                    .map_err(FetchError::Request)?;
                let status = resp.status();
                if !status.is_success() {
                    return Err(FetchError::Status {
                        status: status.as_u16(),
                        url: url.clone(),
                    });
                }
                let mime_type = resp
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(content_type_essence)
                    .filter(|v| !v.is_empty())
                    .unwrap_or_else(|| String::from(DEFAULT_MIME_TYPE));
                let bytes = resp.bytes().await.map_err(FetchError::Request)?;
                Ok(FetchedImage {
                    bytes: bytes.to_vec(),
                    mime_type,
                })
            }
        }
    }
}

fn content_type_essence(value: &str) -> String {
    value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_classifies_data_urls() {
        assert_eq!(
            ImageSource::parse(" data:image/png;base64,AA== "),
            ImageSource::DataUrl(String::from("data:image/png;base64,AA=="))
        );
        assert_eq!(
            ImageSource::parse("https://cdn.example.test/a.png?x=1"),
            ImageSource::Url(String::from("https://cdn.example.test/a.png?x=1"))
        );
    }

    #[test]
    fn byte_sources_reference_as_data_urls() {
        let source = ImageSource::Bytes {
            bytes: vec![1, 2, 3],
            mime_type: String::from("image/png"),
        };
        assert_eq!(source.to_reference(), "data:image/png;base64,AQID");
        assert!(!source.is_empty());
        assert!(ImageSource::parse("").is_empty());
    }

    #[test]
    fn content_type_parameters_are_stripped() {
        assert_eq!(content_type_essence("Image/PNG; charset=binary"), "image/png");
        assert_eq!(content_type_essence(""), "");
    }

    #[tokio::test]
    async fn data_urls_and_bytes_resolve_without_network() {
        let fetcher = ImageFetcher::new().expect("client should build");
        let fetched = fetcher
            .fetch(&ImageSource::parse("data:image/webp;base64,AQID"))
            .await
            .expect("data url should decode");
        assert_eq!(fetched.mime_type, "image/webp");
        assert_eq!(fetched.bytes, vec![1, 2, 3]);

        assert_eq!(
            fetcher
                .fetch(&ImageSource::DataUrl(String::from("data:image/png;base64,%%%")))
                .await,
            None
        );
    }

    #[tokio::test]
    async fn file_sources_read_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("grid.png");
        std::fs::write(&path, [1u8, 2, 3]).expect("write fixture");

        let source = ImageSource::parse(&ImageSource::File(path.clone()).to_reference());
        assert_eq!(source, ImageSource::File(path));
        let fetched = ImageFetcher::new()
            .expect("client should build")
            .fetch(&source)
            .await
            .expect("file should load");
        assert_eq!(fetched.mime_type, "image/png");
        assert_eq!(fetched.bytes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn unreachable_hosts_yield_none() {
        let fetcher = ImageFetcher::new().expect("client should build");
        let fetched = fetcher
            .fetch(&ImageSource::Url(String::from("http://127.0.0.1:9/missing.png")))
            .await;
        assert_eq!(fetched, None);
    }
}
