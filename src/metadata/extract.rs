use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use super::chunk_reader::{
    decode_latin1, decode_text, inflate, read_null_terminated, ChunkIter, ChunkType,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkKind {
    #[serde(rename = "tEXt")]
    Text,
    #[serde(rename = "zTXt")]
    CompressedText,
    #[serde(rename = "iTXt")]
    InternationalText,
    #[serde(rename = "eXIf")]
    Exif,
}

impl ChunkKind {
    pub fn from_chunk_type(chunk_type: ChunkType) -> Option<Self> {
        match chunk_type {
            ChunkType::TEXT => Some(Self::Text),
            ChunkType::ZTXT => Some(Self::CompressedText),
            ChunkType::ITXT => Some(Self::InternationalText),
            ChunkType::EXIF => Some(Self::Exif),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "tEXt",
            Self::CompressedText => "zTXt",
            Self::InternationalText => "iTXt",
            Self::Exif => "eXIf",
        }
    }
}

/// One recognized ancillary chunk. Only the fields the layout could supply
/// are populated; a chunk that failed midway keeps what was read before the
/// failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawChunk {
    #[serde(rename = "type")]
    pub kind: ChunkKind,
    #[serde(skip)]
    pub raw_bytes: Vec<u8>,
    pub raw_base64: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translated_keyword: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed: Option<bool>,
}

impl RawChunk {
    fn new(kind: ChunkKind, data: &[u8]) -> Self {
        Self {
            kind,
            raw_bytes: data.to_vec(),
            raw_base64: BASE64_STANDARD.encode(data),
            keyword: None,
            text: None,
            language_tag: None,
            translated_keyword: None,
            compressed: None,
        }
    }

    pub fn keyword_matches(&self, keyword: &str) -> bool {
        self.keyword
            .as_deref()
            .map(|k| k.eq_ignore_ascii_case(keyword))
            .unwrap_or(false)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkParseError {
    #[error("{chunk} chunk ends before its {field}")]
    Truncated { chunk: &'static str, field: &'static str },
}

/// Walks a PNG buffer and returns its text-bearing chunks in stream order.
/// Anything that is not a PNG yields an empty list.
pub fn extract(buffer: &[u8]) -> Vec<RawChunk> {
    let Some(chunks) = ChunkIter::from_png_bytes(buffer) else {
        warn!(len = buffer.len(), "buffer is not a png or is damaged");
        return Vec::new();
    };

    let mut out = Vec::new();
    for chunk in chunks {
        let Some(kind) = ChunkKind::from_chunk_type(chunk.chunk_type) else {
            continue;
        };
        let mut record = RawChunk::new(kind, chunk.data);
        let parsed = match kind {
            ChunkKind::Text => parse_text(chunk.data, &mut record),
            ChunkKind::CompressedText => parse_compressed_text(chunk.data, &mut record),
            ChunkKind::InternationalText => parse_international_text(chunk.data, &mut record),
            ChunkKind::Exif => Ok(()),
        };
        if let Err(error) = parsed {
            warn!(chunk = kind.as_str(), error = %error, "png text chunk parse failed");
        }
        out.push(record);
    }
    out
}

fn parse_text(data: &[u8], record: &mut RawChunk) -> Result<(), ChunkParseError> {
    match data.iter().position(|&b| b == 0) {
        Some(nul) => {
            record.keyword = Some(decode_latin1(&data[..nul]));
            record.text = Some(decode_text(&data[nul + 1..]));
        }
        None => {
            record.keyword = Some(String::new());
            record.text = Some(decode_text(data));
        }
    }
    Ok(())
}

fn parse_compressed_text(data: &[u8], record: &mut RawChunk) -> Result<(), ChunkParseError> {
    let (keyword, cursor) = read_null_terminated(data, 0);
    record.keyword = Some(keyword);
    let Some(&method) = data.get(cursor) else {
        // keyword-only chunk
        return Ok(());
    };
    let payload = &data[cursor + 1..];
    let text = if method == 0 {
        decode_text(&inflate(payload))
    } else {
        decode_text(payload)
    };
    record.text = Some(text);
    record.compressed = Some(method == 0);
    Ok(())
}

fn parse_international_text(data: &[u8], record: &mut RawChunk) -> Result<(), ChunkParseError> {
    let (keyword, cursor) = read_null_terminated(data, 0);
    record.keyword = Some(keyword);

    let (Some(&flag), Some(&method)) = (data.get(cursor), data.get(cursor + 1)) else {
        return Err(ChunkParseError::Truncated {
            chunk: "iTXt",
            field: "compression flags",
        });
    };
    let (language_tag, cursor) = read_null_terminated(data, cursor + 2);
    let (translated_keyword, cursor) = read_null_terminated(data, cursor);
    let payload = data.get(cursor..).unwrap_or_default();

    let text = if flag == 1 && method == 0 {
        decode_text(&inflate(payload))
    } else {
        decode_text(payload)
    };
    record.language_tag = Some(language_tag);
    record.translated_keyword = Some(translated_keyword);
    record.text = Some(text);
    record.compressed = Some(flag == 1);
    Ok(())
}
