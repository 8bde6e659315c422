#![allow(dead_code)]

use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex};

use flate2::Crc;
use image::{ImageFormat, Rgb, RgbImage};
use naistrip::download::{DownloadDispatcher, DownloadRequest};
use naistrip::store::{SharedKvStore, SqliteKvStore};

pub fn chunk(chunk_type: &[u8; 4], data: &[u8]) -> Vec<u8> {
    let mut crc = Crc::new();
    crc.update(chunk_type);
    crc.update(data);

    let mut out = (data.len() as u32).to_be_bytes().to_vec();
    out.extend_from_slice(chunk_type);
    out.extend_from_slice(data);
    out.extend_from_slice(&crc.sum().to_be_bytes());
    out
}

pub fn text(keyword: &str, value: &str) -> Vec<u8> {
    let mut data = keyword.as_bytes().to_vec();
    data.push(0);
    data.extend_from_slice(value.as_bytes());
    chunk(b"tEXt", &data)
}

/// A real RGB PNG with `extra` chunks spliced in ahead of IEND.
pub fn png_with(width: u32, height: u32, extra: &[Vec<u8>]) -> Vec<u8> {
    let mut encoded = Cursor::new(Vec::new());
    RgbImage::from_pixel(width, height, Rgb([12, 120, 200]))
        .write_to(&mut encoded, ImageFormat::Png)
        .expect("png encode should succeed");
    let mut bytes = encoded.into_inner();
    let iend_at = bytes.len() - 12;
    bytes.splice(iend_at..iend_at, extra.concat());
    bytes
}

pub fn novelai_png() -> Vec<u8> {
    let comment = serde_json::json!({
        "prompt": "artist:kuro, 1girl, beach",
        "steps": 28,
        "width": 832,
        "height": 1216,
        "seed": 3141592653u64,
        "sampler": "k_euler_ancestral",
        "scale": 5.0,
        "uc": "lowres",
        "v4_prompt": {
            "caption": {
                "base_caption": "ignored when prompt is present",
                "char_captions": [
                    { "char_caption": "girl, red hair," },
                    { "char_caption": "" }
                ]
            }
        }
    });
    png_with(
        4,
        4,
        &[
            text("Title", "NovelAI generated image"),
            text("Source", "NovelAI Diffusion V4"),
            text("Comment", comment.to_string().as_str()),
        ],
    )
}

pub fn sqlite_store(dir: &Path) -> SharedKvStore {
    let store = SqliteKvStore::new(dir.join("store.db"));
    store.initialize().expect("store should initialize");
    Arc::new(store)
}

#[derive(Default)]
pub struct RecordingDispatcher {
    pub requests: Mutex<Vec<DownloadRequest>>,
}

impl RecordingDispatcher {
    pub fn filenames(&self) -> Vec<String> {
        let mut names = self
            .requests
            .lock()
            .expect("requests lock")
            .iter()
            .map(|r| r.filename.clone())
            .collect::<Vec<_>>();
        names.sort();
        names
    }
}

impl DownloadDispatcher for RecordingDispatcher {
    fn dispatch(&self, request: DownloadRequest) {
        self.requests.lock().expect("requests lock").push(request);
    }
}
