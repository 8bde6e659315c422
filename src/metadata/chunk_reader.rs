use std::fmt;
use std::io::Read;

use flate2::read::ZlibDecoder;
use tracing::warn;

pub const PNG_SIGNATURE: [u8; 8] = [137, 80, 78, 71, 13, 10, 26, 10];

const LENGTH_AND_TYPE: usize = 8;
const CRC_LEN: usize = 4;

#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ChunkType(pub [u8; 4]);

impl ChunkType {
    pub const TEXT: Self = ChunkType(*b"tEXt");
    pub const ZTXT: Self = ChunkType(*b"zTXt");
    pub const ITXT: Self = ChunkType(*b"iTXt");
    pub const EXIF: Self = ChunkType(*b"eXIf");
    pub const IEND: Self = ChunkType(*b"IEND");

    /// Bit 5 of the first byte is clear for critical chunks (IHDR, IDAT, ...).
    pub const fn is_critical(self) -> bool {
        (self.0[0] & 32) == 0
    }
}

impl fmt::Debug for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{}{}{}{}", a as char, b as char, c as char, d as char)
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Copy, Clone)]
pub struct PngChunk<'b> {
    pub chunk_type: ChunkType,
    pub data: &'b [u8],
}

pub fn has_png_signature(bytes: &[u8]) -> bool {
    bytes.len() >= PNG_SIGNATURE.len() && bytes[..PNG_SIGNATURE.len()] == PNG_SIGNATURE
}

/// Walks `[length][type][data][crc]` records after the signature. The CRC is
/// skipped, never checked. Iteration ends at `IEND`, at the end of input, or
/// at the first chunk whose declared length runs past the buffer.
pub struct ChunkIter<'b> {
    bytes: &'b [u8],
    finished: bool,
}

impl<'b> ChunkIter<'b> {
    pub fn from_png_bytes(bytes: &'b [u8]) -> Option<Self> {
        if !has_png_signature(bytes) {
            return None;
        }
        Some(Self {
            bytes: &bytes[PNG_SIGNATURE.len()..],
            finished: false,
        })
    }
}

impl<'b> Iterator for ChunkIter<'b> {
    type Item = PngChunk<'b>;

    fn next(&mut self) -> Option<PngChunk<'b>> {
        if self.finished || self.bytes.len() < LENGTH_AND_TYPE {
            self.finished = true;
            return None;
        }
        let length = u32::from_be_bytes([self.bytes[0], self.bytes[1], self.bytes[2], self.bytes[3]])
            as usize;
        let chunk_type = ChunkType([self.bytes[4], self.bytes[5], self.bytes[6], self.bytes[7]]);
        let data_end = match LENGTH_AND_TYPE.checked_add(length) {
            Some(end) if end <= self.bytes.len() => end,
            _ => {
                warn!(
                    chunk = %chunk_type,
                    declared_length = length,
                    remaining = self.bytes.len() - LENGTH_AND_TYPE,
                    "png chunk overruns buffer, stopping walk"
                );
                self.finished = true;
                return None;
            }
        };
        if chunk_type == ChunkType::IEND {
            self.finished = true;
            return None;
        }

        let data = &self.bytes[LENGTH_AND_TYPE..data_end];
        let next_start = (data_end + CRC_LEN).min(self.bytes.len());
        self.bytes = &self.bytes[next_start..];
        Some(PngChunk { chunk_type, data })
    }
}

impl std::iter::FusedIterator for ChunkIter<'_> {}

/// UTF-8 first, ISO-8859-1 otherwise. Latin-1 maps every byte, so this never
/// fails.
pub fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => decode_latin1(bytes),
    }
}

pub fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Returns the decoded bytes before the first NUL at or after `start`, and the
/// index just past that NUL. Without a terminator the index is `len + 1`.
pub fn read_null_terminated(bytes: &[u8], start: usize) -> (String, usize) {
    let start = start.min(bytes.len());
    let end = bytes[start..]
        .iter()
        .position(|&b| b == 0)
        .map(|offset| start + offset)
        .unwrap_or(bytes.len());
    (decode_text(&bytes[start..end]), end + 1)
}

/// Inflates a zlib stream. Undecodable input comes back unchanged.
pub fn inflate(bytes: &[u8]) -> Vec<u8> {
    let mut decoder = ZlibDecoder::new(bytes);
    let mut out = Vec::with_capacity(bytes.len().saturating_mul(2));
    match decoder.read_to_end(&mut out) {
        Ok(_) => out,
        Err(error) => {
            warn!(error = %error, len = bytes.len(), "png text inflate failed, keeping raw bytes");
            bytes.to_vec()
        }
    }
}
