//! Tag extraction and the per-document tag cache.
//!
//! Tags come from two places: the `tags`/`tag` frontmatter keys (scalar or
//! list form) and inline `#tag` annotations in the body. Both are normalized
//! into one set. The [`TagIndex`] remembers the set observed the last time a
//! document was fully processed so the engine can compute what was added or
//! removed since.

use crate::frontmatter::{self, Properties};
use crate::store::NoteMetadata;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value as JsonValue;
use std::collections::{BTreeSet, HashMap};

/// Frontmatter keys that carry tags. Never copied between documents.
pub const TAG_KEYS: [&str; 2] = ["tags", "tag"];

pub type TagSet = BTreeSet<String>;

static INLINE_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|[\s(\[,;])#([\p{L}\p{N}_/\-]+)").expect("inline tag regex is valid")
});

static INLINE_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"`[^`\n]*`").expect("inline code regex is valid"));

/// Strip the leading `#` and surrounding whitespace. Empty tags are dropped.
pub fn normalize_tag(tag: &str) -> Option<String> {
    let tag = tag.trim();
    let tag = tag.strip_prefix('#').unwrap_or(tag).trim();
    if tag.is_empty() {
        None
    } else {
        Some(tag.to_string())
    }
}

/// Tags declared in the frontmatter, in declaration order.
///
/// A scalar value is split on commas and whitespace.
pub fn block_tags(properties: &Properties) -> Vec<String> {
    let mut tags = Vec::new();
    for key in TAG_KEYS {
        match properties.get(key) {
            Some(JsonValue::String(s)) => {
                tags.extend(
                    s.split(|c: char| c == ',' || c.is_whitespace())
                        .filter_map(normalize_tag),
                );
            }
            Some(JsonValue::Array(items)) => {
                for item in items {
                    let raw = match item {
                        JsonValue::String(s) => s.clone(),
                        JsonValue::Number(n) => n.to_string(),
                        _ => continue,
                    };
                    tags.extend(normalize_tag(&raw));
                }
            }
            _ => {}
        }
    }
    tags
}

/// Inline `#tags` in the body. Fenced code blocks and code spans are skipped,
/// as are purely numeric tags (`#123` is an issue reference, not a tag).
pub fn inline_tags(body: &str) -> Vec<String> {
    let mut tags = Vec::new();
    let mut in_fence = false;

    for line in body.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }

        let line = INLINE_CODE.replace_all(line, "");
        for cap in INLINE_TAG.captures_iter(&line) {
            let tag = cap[1].trim_end_matches('/');
            if tag.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            tags.extend(normalize_tag(tag));
        }
    }
    tags
}

/// Reference indexer: what the host's metadata cache would report for `text`.
pub fn index_note(text: &str) -> NoteMetadata {
    let parsed = frontmatter::parse(text);
    let mut tags = block_tags(&parsed.properties);
    tags.extend(inline_tags(&parsed.body));
    dedup_in_order(&mut tags);
    NoteMetadata {
        tags,
        properties: parsed.properties,
    }
}

/// All tags of a document, normalized, deduplicated, in first-seen order.
///
/// Combines the host-supplied tag list with the frontmatter-declared tags so a
/// host that only reports inline tags still yields the full set.
pub fn current_tags(metadata: &NoteMetadata) -> Vec<String> {
    let mut tags: Vec<String> = metadata
        .tags
        .iter()
        .filter_map(|t| normalize_tag(t))
        .collect();
    tags.extend(block_tags(&metadata.properties));
    dedup_in_order(&mut tags);
    tags
}

fn dedup_in_order(tags: &mut Vec<String>) {
    let mut seen = BTreeSet::new();
    tags.retain(|t| seen.insert(t.clone()));
}

/// Template names referenced by `base/<name>` tags, in tag order.
pub fn references<'a, I>(tags: I, base: &str) -> Vec<String>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut names = Vec::new();
    for tag in tags {
        if let Some(name) = reference_name(tag, base) {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
    }
    names
}

/// The template name of a `base/<name>` tag.
pub fn reference_name<'a>(tag: &'a str, base: &str) -> Option<&'a str> {
    let name = tag.strip_prefix(base)?.strip_prefix('/')?;
    if name.is_empty() { None } else { Some(name) }
}

/// Tags added and removed between two observations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagDelta {
    pub added: TagSet,
    pub removed: TagSet,
}

impl TagDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub fn diff(previous: &TagSet, current: &TagSet) -> TagDelta {
    TagDelta {
        added: current.difference(previous).cloned().collect(),
        removed: previous.difference(current).cloned().collect(),
    }
}

/// Last fully processed tag set per document path.
#[derive(Debug, Default, Clone)]
pub struct TagIndex {
    entries: HashMap<String, TagSet>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tags as of the last processed change. Unknown documents have none.
    pub fn previous(&self, path: &str) -> TagSet {
        self.entries.get(path).cloned().unwrap_or_default()
    }

    pub fn get(&self, path: &str) -> Option<&TagSet> {
        self.entries.get(path)
    }

    /// Replace the entry. Call only once the change has been fully processed.
    pub fn update(&mut self, path: &str, tags: TagSet) {
        self.entries.insert(path.to_string(), tags);
    }

    pub fn remove(&mut self, path: &str) -> Option<TagSet> {
        self.entries.remove(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn set(tags: &[&str]) -> TagSet {
        tags.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn block_tags_from_list_and_scalar() {
        let mut props = Properties::new();
        props.insert("tags".into(), json!(["#mt/Book", "reading", 2024]));
        props.insert("tag".into(), json!("a, b c"));
        assert_eq!(block_tags(&props), vec!["mt/Book", "reading", "2024", "a", "b", "c"]);
    }

    #[test]
    fn inline_tags_skip_code() {
        let body = "Some #idea here\n`#not-a-tag` and #mt/Book.\n```\n#fenced\n```\nIssue #42 (#nested/tag)";
        assert_eq!(inline_tags(body), vec!["idea", "mt/Book", "nested/tag"]);
    }

    #[test]
    fn inline_tag_requires_boundary() {
        assert!(inline_tags("see page#anchor").is_empty());
    }

    #[test]
    fn index_note_combines_and_deduplicates() {
        let meta = index_note("---\ntags: [mt/Book, idea]\n---\nText #idea #extra");
        assert_eq!(meta.tags, vec!["mt/Book", "idea", "extra"]);
    }

    #[test]
    fn current_tags_merges_host_tags_with_block_tags() {
        let mut properties = Properties::new();
        properties.insert("tags".into(), json!("mt/Book"));
        let meta = NoteMetadata {
            tags: vec!["#inline".into(), "#mt/Book".into()],
            properties,
        };
        assert_eq!(current_tags(&meta), vec!["inline", "mt/Book"]);
    }

    #[test]
    fn references_parse_base_prefix() {
        let tags = vec![
            "mt".to_string(),
            "mt/Book".to_string(),
            "mtx/Other".to_string(),
            "mt/".to_string(),
            "mt/Movie".to_string(),
            "mt/Book".to_string(),
        ];
        assert_eq!(references(&tags, "mt"), vec!["Book", "Movie"]);
    }

    #[test]
    fn diff_reports_added_and_removed() {
        let delta = diff(&set(&["a", "mt/Book"]), &set(&["a", "mt/Movie"]));
        assert_eq!(delta.added, set(&["mt/Movie"]));
        assert_eq!(delta.removed, set(&["mt/Book"]));
        assert!(diff(&set(&["a"]), &set(&["a"])).is_empty());
    }

    #[test]
    fn tag_index_tracks_entries() {
        let mut index = TagIndex::new();
        assert!(index.previous("note.md").is_empty());
        index.update("note.md", set(&["mt/Book"]));
        assert_eq!(index.previous("note.md"), set(&["mt/Book"]));
        assert_eq!(index.len(), 1);
        index.remove("note.md");
        assert!(index.is_empty());
    }
}
