use std::sync::OnceLock;

use chrono::{DateTime, SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use tracing::warn;
use uuid::Uuid;

use super::extract::RawChunk;

/// Generation parameters recovered from one image, as persisted in history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRecord {
    pub id: String,
    pub created_at: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub source_url: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub characters: Vec<String>,
    #[serde(default)]
    pub steps: Option<Number>,
    #[serde(default)]
    pub width: Option<Number>,
    #[serde(default)]
    pub height: Option<Number>,
    #[serde(default)]
    pub seed: Option<Number>,
    #[serde(default)]
    pub sampler: Option<String>,
    #[serde(default)]
    pub scale: Option<Number>,
    #[serde(default)]
    pub strength: Option<Number>,
    #[serde(default)]
    pub noise: Option<Number>,
    #[serde(default)]
    pub uc: Option<String>,
    #[serde(default)]
    pub artist_tags: Vec<String>,
    #[serde(default)]
    pub model: String,
}

impl GenerationRecord {
    /// Attaches where the image came from and where it was saved.
    pub fn with_origin(
        mut self,
        filename: impl Into<String>,
        source_url: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Self {
        self.filename = filename.into();
        self.source_url = source_url.into();
        self.mime_type = mime_type.into();
        self
    }
}

/// Parses embedded JSON, retrying once with non-breaking spaces and NULs
/// cleaned out. Only objects count as generation parameters.
pub fn parse_json_safely(text: &str) -> Option<Map<String, Value>> {
    let cleaned = text.trim();
    if cleaned.is_empty() {
        return None;
    }
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(cleaned) {
        return Some(obj);
    }
    let normalized = cleaned.replace('\u{a0}', " ").replace('\0', "");
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(normalized.as_str()) {
        return Some(obj);
    }
    let preview = cleaned.chars().take(120).collect::<String>();
    warn!(preview = %preview, "embedded comment is not a JSON object");
    None
}

pub fn normalize(chunks: &[RawChunk]) -> Option<GenerationRecord> {
    normalize_at(chunks, Utc::now())
}

pub fn normalize_at(chunks: &[RawChunk], now: DateTime<Utc>) -> Option<GenerationRecord> {
    if chunks.is_empty() {
        return None;
    }
    let description = pick_chunk_text(chunks, "Description");
    let comment = pick_chunk_text(chunks, "Comment");
    let source = pick_chunk_text(chunks, "Source");

    let params = comment.and_then(parse_json_safely);
    let prompt = match params.as_ref() {
        Some(obj) => format_prompt_text(
            non_empty_str(obj.get("prompt"))
                .or_else(|| non_empty_str(lookup(obj, &["v4_prompt", "caption", "base_caption"]))),
        ),
        None => format_prompt_text(description),
    };

    let characters = params
        .as_ref()
        .and_then(|obj| lookup(obj, &["v4_prompt", "caption", "char_captions"]))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("char_caption").and_then(Value::as_str))
                .map(|caption| format_prompt_text(Some(caption)))
                .filter(|caption| !caption.is_empty())
                .map(|caption| trim_trailing_comma(caption.as_str()).to_string())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let number = |key: &str| params.as_ref().and_then(|obj| number_field(obj.get(key)));
    let uc = params.as_ref().and_then(|obj| {
        non_empty_str(obj.get("uc"))
            .or_else(|| {
                non_empty_str(lookup(obj, &["v4_negative_prompt", "caption", "base_caption"]))
            })
            .map(str::to_string)
    });

    let artist_tags = extract_artist_tags(prompt.as_str());
    Some(GenerationRecord {
        id: record_id(now),
        created_at: now.to_rfc3339_opts(SecondsFormat::Millis, true),
        filename: String::new(),
        source_url: String::new(),
        mime_type: String::new(),
        characters,
        steps: number("steps"),
        width: number("width"),
        height: number("height"),
        seed: number("seed"),
        sampler: params
            .as_ref()
            .and_then(|obj| obj.get("sampler"))
            .and_then(Value::as_str)
            .map(str::to_string),
        scale: number("scale"),
        strength: number("strength"),
        noise: number("noise"),
        uc,
        artist_tags,
        model: format_prompt_text(source),
        prompt,
    })
}

/// Every `artist:<name>` run up to the next comma or colon, trimmed.
pub fn extract_artist_tags(prompt: &str) -> Vec<String> {
    static ARTIST_TAG: OnceLock<Regex> = OnceLock::new();
    let re = ARTIST_TAG.get_or_init(|| Regex::new(r"artist:([^,:]+)").expect("artist tag regex"));
    re.captures_iter(prompt)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .collect()
}

fn pick_chunk_text<'a>(chunks: &'a [RawChunk], keyword: &str) -> Option<&'a str> {
    chunks
        .iter()
        .find(|chunk| chunk.keyword_matches(keyword))
        .and_then(|chunk| chunk.text.as_deref())
}

fn lookup<'a>(obj: &'a Map<String, Value>, path: &[&str]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    rest.iter()
        .try_fold(obj.get(*first)?, |value, key| value.get(*key))
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn number_field(value: Option<&Value>) -> Option<Number> {
    match value {
        Some(Value::Number(n)) => Some(n.clone()),
        _ => None,
    }
}

fn format_prompt_text(value: Option<&str>) -> String {
    value
        .map(|v| v.replace('\u{a0}', " ").trim().to_string())
        .unwrap_or_default()
}

fn trim_trailing_comma(value: &str) -> &str {
    let trimmed = value.trim_end();
    match trimmed.strip_suffix(',') {
        Some(rest) => rest,
        None => value,
    }
}

fn record_id(now: DateTime<Utc>) -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("{}-{}", now.timestamp_millis(), &random[..6])
}
