use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use super::normalize::GenerationRecord;

pub const MIN_RECORDS_FOR_ANALYTICS: usize = 3;
pub const TOP_ENTRIES: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankedValue {
    pub value: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryAnalytics {
    pub records: usize,
    pub artist_tags: Vec<RankedValue>,
    pub prompt_words: Vec<RankedValue>,
    pub samplers: Vec<RankedValue>,
    pub models: Vec<RankedValue>,
}

/// Case-insensitive match against prompt, artist tags, model, sampler and seed.
pub fn matches_search(record: &GenerationRecord, term: &str) -> bool {
    let needle = term.trim().to_lowercase();
    if needle.is_empty() {
        return true;
    }
    let seed = record.seed.as_ref().map(ToString::to_string);
    let haystack = [
        Some(record.prompt.clone()),
        Some(record.artist_tags.join(" ")),
        Some(record.model.clone()),
        record.sampler.clone(),
        seed,
    ]
    .into_iter()
    .flatten()
    .filter(|part| !part.is_empty())
    .collect::<Vec<_>>()
    .join(" ")
    .to_lowercase();
    haystack.contains(needle.as_str())
}

pub fn summarize(records: &[GenerationRecord]) -> Option<HistoryAnalytics> {
    if records.len() < MIN_RECORDS_FOR_ANALYTICS {
        return None;
    }
    Some(HistoryAnalytics {
        records: records.len(),
        artist_tags: rank(records.iter().flat_map(|r| r.artist_tags.iter().cloned())),
        prompt_words: rank(records.iter().flat_map(|r| prompt_words(r.prompt.as_str()))),
        samplers: rank(
            records
                .iter()
                .filter_map(|r| r.sampler.clone())
                .filter(|s| !s.is_empty()),
        ),
        models: rank(
            records
                .iter()
                .map(|r| r.model.clone())
                .filter(|m| !m.is_empty()),
        ),
    })
}

/// Comma-separated prompt terms with artist tags and emphasis weights removed.
pub fn prompt_words(prompt: &str) -> Vec<String> {
    struct Cleaners {
        tags: Regex,
        weighted_group: Regex,
        weight: Regex,
    }
    static CLEANERS: OnceLock<Cleaners> = OnceLock::new();
    let cleaners = CLEANERS.get_or_init(|| Cleaners {
        tags: Regex::new(r"(?i)(?:artist|art):[^,:]+").expect("tag regex"),
        weighted_group: Regex::new(r"\(([^)]*):\d+\.?\d*\)").expect("weighted group regex"),
        weight: Regex::new(r":\d+\.?\d*").expect("weight regex"),
    });

    let cleaned = cleaners.tags.replace_all(prompt, "");
    let cleaned = cleaners.weighted_group.replace_all(&cleaned, "$1");
    let cleaned = cleaners.weight.replace_all(&cleaned, "");
    let cleaned = cleaned.replace("::", " ");
    cleaned
        .split(',')
        .map(str::trim)
        .filter(|word| !word.is_empty())
        .map(str::to_string)
        .collect()
}

/// Lowercased counts, highest first, ties kept in first-seen order.
fn rank(values: impl Iterator<Item = String>) -> Vec<RankedValue> {
    let mut order = Vec::<String>::new();
    let mut counts = HashMap::<String, usize>::new();
    for value in values {
        let key = value.to_lowercase();
        let count = counts.entry(key.clone()).or_insert(0);
        if *count == 0 {
            order.push(key);
        }
        *count += 1;
    }
    let mut ranked = order
        .into_iter()
        .map(|value| {
            let count = counts.get(value.as_str()).copied().unwrap_or_default();
            RankedValue { value, count }
        })
        .collect::<Vec<_>>();
    ranked.sort_by(|a, b| b.count.cmp(&a.count));
    ranked.truncate(TOP_ENTRIES);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::Number;

    fn record(prompt: &str, sampler: Option<&str>, model: &str) -> GenerationRecord {
        GenerationRecord {
            id: String::from("1-abcdef"),
            created_at: String::from("2024-01-15T00:00:00.000Z"),
            filename: String::new(),
            source_url: String::new(),
            mime_type: String::new(),
            prompt: prompt.to_string(),
            characters: Vec::new(),
            steps: None,
            width: None,
            height: None,
            seed: Some(Number::from(42)),
            sampler: sampler.map(str::to_string),
            scale: None,
            strength: None,
            noise: None,
            uc: None,
            artist_tags: crate::metadata::normalize::extract_artist_tags(prompt),
            model: model.to_string(),
        }
    }

    #[test]
    fn prompt_words_drop_tags_and_weights() {
        assert_eq!(
            prompt_words("artist:foo, (red hair:1.2), Art:bar, blue eyes:0.8, a::b, , smile"),
            vec!["red hair", "blue eyes", "a b", "smile"]
        );
    }

    #[test]
    fn summary_requires_three_records() {
        let two = vec![record("a", None, "m"), record("b", None, "m")];
        assert_eq!(summarize(&two), None);
    }

    #[test]
    fn summary_ranks_case_insensitively() {
        let records = vec![
            record("1girl, artist:Kuro, smile", Some("k_euler"), "V4"),
            record("1girl, artist:kuro", Some("k_euler"), "v4"),
            record("Smile, artist:shiro", Some("ddim"), ""),
        ];
        let summary = summarize(&records).expect("summary expected");

        assert_eq!(summary.records, 3);
        assert_eq!(
            summary.artist_tags,
            vec![
                RankedValue { value: String::from("kuro"), count: 2 },
                RankedValue { value: String::from("shiro"), count: 1 },
            ]
        );
        assert_eq!(summary.prompt_words[0], RankedValue { value: String::from("1girl"), count: 2 });
        assert_eq!(summary.prompt_words[1], RankedValue { value: String::from("smile"), count: 2 });
        assert_eq!(summary.samplers[0].value, "k_euler");
        assert_eq!(summary.models, vec![RankedValue { value: String::from("v4"), count: 2 }]);
    }

    #[test]
    fn rank_keeps_top_fifteen() {
        let ranked = rank((0..20).map(|i| format!("w{i}")));
        assert_eq!(ranked.len(), TOP_ENTRIES);
        assert_eq!(ranked[0].value, "w0");
    }

    #[test]
    fn search_covers_seed_and_sampler() {
        let r = record("beach", Some("k_dpmpp_2m"), "V4");
        assert!(matches_search(&r, "42"));
        assert!(matches_search(&r, "DPMPP"));
        assert!(matches_search(&r, "v4"));
        assert!(!matches_search(&r, "forest"));
    }
}
