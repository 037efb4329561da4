//! Property merge rules.
//!
//! Precedence: document value > first referenced template > later templates.
//! A non-empty document value is never removed.

use crate::frontmatter::Properties;
use crate::registry::PropertyDiff;
use serde_json::Value as JsonValue;

/// `null`, blank strings, empty lists and empty mappings.
pub fn is_empty_value(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.trim().is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::Object(map) => map.is_empty(),
        JsonValue::Bool(_) | JsonValue::Number(_) => false,
    }
}

/// Merge template defaults into a document.
///
/// The document's own properties keep their order and values; template keys
/// the document lacks are appended, first template first.
pub fn merge_templates(document: &Properties, templates: &[Properties]) -> Properties {
    let mut merged = document.clone();
    for template in templates {
        for (key, value) in template {
            if !merged.contains_key(key) {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

/// Apply a template's key delta to a document. Returns whether it changed.
///
/// Added keys are copied from `template` only when the document lacks them,
/// even an empty document value counts as a deliberate choice. Removed keys
/// are dropped only when the document's value is empty.
pub fn apply_delta(document: &mut Properties, template: &Properties, diff: &PropertyDiff) -> bool {
    let mut changed = false;

    for key in &diff.added {
        if document.contains_key(key) {
            continue;
        }
        if let Some(value) = template.get(key) {
            document.insert(key.clone(), value.clone());
            changed = true;
        }
    }

    changed |= remove_empty(document, diff.removed.iter());
    changed
}

/// Keys of `removed` the document would lose under [`apply_delta`].
pub fn lost_keys<'a>(document: &Properties, removed: &'a [String]) -> Vec<&'a str> {
    removed
        .iter()
        .filter(|k| document.get(k.as_str()).is_some_and(is_empty_value))
        .map(String::as_str)
        .collect()
}

/// Remove every template property the document left empty.
pub fn prune_empty(document: &mut Properties, template: &Properties) -> bool {
    remove_empty(document, template.keys())
}

fn remove_empty<'a>(document: &mut Properties, keys: impl Iterator<Item = &'a String>) -> bool {
    let mut changed = false;
    for key in keys {
        if document.get(key).is_some_and(is_empty_value) {
            // shift_remove keeps the order of the remaining keys
            document.shift_remove(key);
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: JsonValue) -> Properties {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    fn diff(added: &[&str], removed: &[&str]) -> PropertyDiff {
        PropertyDiff {
            added: added.iter().map(|s| s.to_string()).collect(),
            removed: removed.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn emptiness() {
        assert!(is_empty_value(&json!(null)));
        assert!(is_empty_value(&json!("  ")));
        assert!(is_empty_value(&json!([])));
        assert!(is_empty_value(&json!({})));
        assert!(!is_empty_value(&json!(0)));
        assert!(!is_empty_value(&json!(false)));
        assert!(!is_empty_value(&json!("5")));
    }

    #[test]
    fn merge_into_empty_document() {
        let template = props(json!({"rating": "", "author": "unknown"}));
        let merged = merge_templates(&Properties::new(), &[template.clone()]);
        assert_eq!(merged, template);
    }

    #[test]
    fn document_value_wins() {
        let doc = props(json!({"author": "Jane"}));
        let template = props(json!({"rating": "", "author": "unknown"}));
        let merged = merge_templates(&doc, &[template]);
        assert_eq!(merged["author"], json!("Jane"));
        assert_eq!(merged["rating"], json!(""));
        let keys: Vec<_> = merged.keys().cloned().collect();
        assert_eq!(keys, vec!["author", "rating"]);
    }

    #[test]
    fn first_template_wins() {
        let first = props(json!({"kind": "book"}));
        let second = props(json!({"kind": "movie", "year": 2000}));
        let merged = merge_templates(&Properties::new(), &[first, second]);
        assert_eq!(merged, props(json!({"kind": "book", "year": 2000})));
    }

    #[test]
    fn merge_is_idempotent() {
        let template = props(json!({"rating": "", "author": "unknown"}));
        let once = merge_templates(&props(json!({"title": "x"})), &[template.clone()]);
        let twice = merge_templates(&once, &[template]);
        assert_eq!(once, twice);
    }

    #[test]
    fn added_key_only_fills_missing() {
        let template = props(json!({"pages": 100}));
        let mut lacking = Properties::new();
        assert!(apply_delta(&mut lacking, &template, &diff(&["pages"], &[])));
        assert_eq!(lacking["pages"], json!(100));

        let mut blank = props(json!({"pages": ""}));
        assert!(!apply_delta(&mut blank, &template, &diff(&["pages"], &[])));
        assert_eq!(blank["pages"], json!(""));
    }

    #[test]
    fn removed_key_only_drops_empty_values() {
        let template = Properties::new();
        let mut empty = props(json!({"rating": "", "title": "x"}));
        assert!(apply_delta(&mut empty, &template, &diff(&[], &["rating"])));
        assert!(!empty.contains_key("rating"));

        let mut filled = props(json!({"rating": "5"}));
        assert!(!apply_delta(&mut filled, &template, &diff(&[], &["rating"])));
        assert_eq!(filled["rating"], json!("5"));
    }

    #[test]
    fn lost_keys_lists_only_deletions() {
        let doc = props(json!({"a": "", "b": "kept"}));
        let removed = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_eq!(lost_keys(&doc, &removed), vec!["a"]);
    }

    #[test]
    fn prune_keeps_real_values_and_foreign_keys() {
        let template = props(json!({"author": "unknown", "rating": ""}));
        let mut doc = props(json!({"author": "", "rating": "5", "own": ""}));
        assert!(prune_empty(&mut doc, &template));
        assert_eq!(doc, props(json!({"rating": "5", "own": ""})));

        let mut filled = props(json!({"author": "Jane"}));
        assert!(!prune_empty(&mut filled, &template));
    }
}
