//! File-name and sub-directory templating for downloads.

use std::sync::OnceLock;

use chrono::{DateTime, FixedOffset};
use regex::{Captures, Regex};
use serde_json::Number;

use crate::config::DEFAULT_FILENAME_PATTERN;
use crate::metadata::GenerationRecord;

const UNKNOWN: &str = "unknown";
const PROMPT_PLACEHOLDER_CHARS: usize = 40;
const RESERVED: [char; 8] = ['\\', ':', '*', '?', '"', '<', '>', '|'];

#[derive(Debug, Clone, Copy)]
pub struct NamingContext<'a> {
    pub index: usize,
    pub now: DateTime<FixedOffset>,
    pub record: Option<&'a GenerationRecord>,
}

impl<'a> NamingContext<'a> {
    pub fn new(index: usize, now: DateTime<FixedOffset>) -> Self {
        Self {
            index,
            now,
            record: None,
        }
    }

    pub fn with_record(mut self, record: Option<&'a GenerationRecord>) -> Self {
        self.record = record;
        self
    }

    fn value_for(&self, key: &str) -> Option<String> {
        match key {
            "index" => Some(format!("{:02}", self.index)),
            "timestamp" => Some(self.now.timestamp_millis().to_string()),
            "date" => Some(self.now.format("%Y-%m-%d").to_string()),
            "time" => Some(self.now.format("%H%M%S").to_string()),
            _ => self.record.and_then(|record| record_value(record, key)),
        }
    }
}

fn record_value(record: &GenerationRecord, key: &str) -> Option<String> {
    let number = |value: &Option<Number>| value.as_ref().map(ToString::to_string);
    let text = |value: &str| Some(value.to_string()).filter(|v| !v.is_empty());
    match key {
        "model" => text(record.model.as_str()),
        "prompt" => text(record.prompt.as_str())
            .map(|prompt| prompt.chars().take(PROMPT_PLACEHOLDER_CHARS).collect()),
        "sampler" => record.sampler.as_deref().and_then(text),
        "steps" => number(&record.steps),
        "seed" => number(&record.seed),
        "strength" => number(&record.strength),
        "noise" => number(&record.noise),
        "scale" => number(&record.scale),
        _ => None,
    }
}

/// Replaces every `{key}` placeholder. Unknown keys and missing values read as
/// `unknown`; an empty pattern falls back to `{timestamp}_{index}`.
pub fn expand_pattern(pattern: &str, ctx: &NamingContext<'_>) -> String {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let placeholder = PLACEHOLDER.get_or_init(|| Regex::new(r"\{(\w+)\}").expect("placeholder regex"));
    let pattern = if pattern.is_empty() {
        DEFAULT_FILENAME_PATTERN
    } else {
        pattern
    };
    placeholder
        .replace_all(pattern, |caps: &Captures<'_>| {
            ctx.value_for(&caps[1])
                .unwrap_or_else(|| String::from(UNKNOWN))
        })
        .into_owned()
}

pub fn sanitize_file_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' => '-',
            c if RESERVED.contains(&c) => '_',
            c => c,
        })
        .collect()
}

pub fn build_file_name(pattern: &str, ctx: &NamingContext<'_>, extension: &str) -> String {
    sanitize_file_name(format!("{}.{extension}", expand_pattern(pattern, ctx)).as_str())
}

/// Slash-separated relative directory with no empty or dot segments.
pub fn normalize_sub_dir(sub_dir: &str) -> String {
    sub_dir
        .replace('\\', "/")
        .split('/')
        .map(str::trim)
        .filter(|segment| !matches!(*segment, "" | "." | ".."))
        .map(|segment| {
            segment
                .chars()
                .map(|c| if RESERVED.contains(&c) { '_' } else { c })
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("/")
}

pub fn build_path(
    pattern: &str,
    sub_dir: &str,
    ctx: &NamingContext<'_>,
    extension: &str,
) -> String {
    let file_name = build_file_name(pattern, ctx, extension);
    if sub_dir.trim().is_empty() {
        return file_name;
    }
    let dir = normalize_sub_dir(expand_pattern(sub_dir, ctx).as_str());
    if dir.is_empty() {
        file_name
    } else {
        format!("{dir}/{file_name}")
    }
}
