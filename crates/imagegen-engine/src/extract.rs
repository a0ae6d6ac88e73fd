use std::collections::HashSet;

use serde_json::Value;

/// Classifier for "this JSON string is a generated image" during the
/// recursive response walk. Provider response shapes drift, so the rules
/// live in one swappable value instead of inlined conditionals.
#[derive(Debug, Clone)]
pub struct ImageHeuristics {
    /// Key substrings that qualify an http(s) URL value.
    pub url_key_markers: &'static [&'static str],
    /// Key substrings that qualify a long base64 blob value.
    pub base64_key_markers: &'static [&'static str],
    /// Short base64-looking fields (checksums, tokens) are not images.
    pub base64_min_len: usize,
}

impl Default for ImageHeuristics {
    fn default() -> Self {
        Self {
            url_key_markers: &["image", "img", "url", "output", "result", "generated"],
            base64_key_markers: &["b64", "base64"],
            base64_min_len: 100,
        }
    }
}

impl ImageHeuristics {
    pub fn looks_like_image(&self, key: &str, value: &str) -> bool {
        let low_key = key.to_ascii_lowercase();
        if starts_with_ignore_ascii_case(value, "http://")
            || starts_with_ignore_ascii_case(value, "https://")
        {
            return self
                .url_key_markers
                .iter()
                .any(|marker| low_key.contains(marker));
        }
        if starts_with_ignore_ascii_case(value, "data:image/") {
            return true;
        }
        if self
            .base64_key_markers
            .iter()
            .any(|marker| low_key.contains(marker))
        {
            return value.len() > self.base64_min_len;
        }
        false
    }

    /// Exhaustive walk over nested objects and arrays, collecting classified
    /// string values in first-seen order with duplicates removed. A matched
    /// string is taken as-is and not descended into.
    pub fn collect(&self, raw: &Value) -> Vec<String> {
        let mut found = Vec::new();
        self.walk(raw, &mut found);
        dedup_preserving_order(found)
    }

    fn walk(&self, node: &Value, out: &mut Vec<String>) {
        match node {
            Value::Object(map) => {
                for (key, value) in map {
                    if let Some(text) = value.as_str() {
                        if self.looks_like_image(key, text) {
                            out.push(text.to_string());
                            continue;
                        }
                    }
                    self.walk(value, out);
                }
            }
            Value::Array(items) => {
                for item in items {
                    self.walk(item, out);
                }
            }
            _ => {}
        }
    }
}

pub fn dedup_preserving_order(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

fn starts_with_ignore_ascii_case(value: &str, prefix: &str) -> bool {
    value.len() >= prefix.len()
        && value.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}
