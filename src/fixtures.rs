//! Byte-level builders shared by unit tests.

use std::io::{Cursor, Write};
use std::sync::Mutex;

use flate2::write::ZlibEncoder;
use flate2::{Compression, Crc};
use image::{ImageFormat, Rgb, RgbImage};

use crate::download::{DownloadDispatcher, DownloadRequest};
use crate::metadata::chunk_reader::PNG_SIGNATURE;

pub(crate) fn chunk_bytes(chunk_type: [u8; 4], data: &[u8]) -> Vec<u8> {
    let mut crc = Crc::new();
    crc.update(&chunk_type);
    crc.update(data);

    let mut out = Vec::with_capacity(data.len() + 12);
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(&chunk_type);
    out.extend_from_slice(data);
    out.extend_from_slice(&crc.sum().to_be_bytes());
    out
}

/// Signature, the given chunks, then IEND. No image header, so only the
/// chunk walker can make sense of it.
pub(crate) fn png_with_chunks(chunks: &[([u8; 4], Vec<u8>)]) -> Vec<u8> {
    let mut out = PNG_SIGNATURE.to_vec();
    for (chunk_type, data) in chunks {
        out.extend_from_slice(&chunk_bytes(*chunk_type, data));
    }
    out.extend_from_slice(&chunk_bytes(*b"IEND", &[]));
    out
}

pub(crate) fn text_chunk(keyword: &str, text: &str) -> ([u8; 4], Vec<u8>) {
    let mut data = keyword.as_bytes().to_vec();
    data.push(0);
    data.extend_from_slice(text.as_bytes());
    (*b"tEXt", data)
}

pub(crate) fn zlib(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("zlib write should succeed");
    encoder.finish().expect("zlib finish should succeed")
}

/// A decodable RGB PNG with extra ancillary chunks spliced in before IEND.
pub(crate) fn decodable_png(width: u32, height: u32, chunks: &[([u8; 4], Vec<u8>)]) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([200, 40, 90]));
    let mut encoded = Cursor::new(Vec::new());
    img.write_to(&mut encoded, ImageFormat::Png)
        .expect("png encode should succeed");
    let mut bytes = encoded.into_inner();

    let iend_at = bytes.len() - 12;
    let mut spliced = Vec::new();
    for (chunk_type, data) in chunks {
        spliced.extend_from_slice(&chunk_bytes(*chunk_type, data));
    }
    bytes.splice(iend_at..iend_at, spliced);
    bytes
}

/// A PNG whose pixels vary in both directions, so lossy encoders have
/// something to discard.
pub(crate) fn gradient_png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([
            (x * 255 / width.max(1)) as u8,
            (y * 255 / height.max(1)) as u8,
            ((x * 7 + y * 13) % 256) as u8,
        ])
    });
    let mut encoded = Cursor::new(Vec::new());
    img.write_to(&mut encoded, ImageFormat::Png)
        .expect("png encode should succeed");
    encoded.into_inner()
}

/// Keeps every request instead of writing anything.
#[derive(Default)]
pub(crate) struct RecordingDispatcher {
    pub(crate) requests: Mutex<Vec<DownloadRequest>>,
}

impl RecordingDispatcher {
    pub(crate) fn filenames(&self) -> Vec<String> {
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
