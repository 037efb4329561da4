//! YAML frontmatter codec.
//!
//! Splits the leading frontmatter block off a note and re-emits it:
//! ```markdown
//! ---
//! author: unknown
//! tags: [mt/Book]
//! ---
//!
//! Note content here...
//! ```
//!
//! Property order is preserved in both directions. Parsing never fails: a
//! block that is not a YAML mapping is reported as [`BlockState::Malformed`]
//! and the whole text is treated as body.

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

/// Ordered frontmatter properties.
pub type Properties = serde_json::Map<String, JsonValue>;

const DELIMITER: &str = "---";

/// What the codec found at the top of the note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// No frontmatter block.
    Absent,
    /// A well-formed block (possibly with no properties).
    Present,
    /// Delimiters found but the YAML inside is not a mapping.
    Malformed,
}

/// A note split into frontmatter properties and body.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedNote {
    pub properties: Properties,
    /// Everything after the block, without leading blank lines.
    pub body: String,
    pub block: BlockState,
}

#[derive(Debug, Error)]
pub enum FrontmatterError {
    #[error("Failed to serialize frontmatter: {0}")]
    Serialization(#[from] serde_yaml::Error),
}

/// Split raw note text into the YAML source of the block and the remainder.
///
/// Returns `(None, raw)` when the text does not open with a delimiter line or
/// the block is never closed.
pub fn split_block(raw: &str) -> (Option<&str>, &str) {
    let Some(after_opening) = raw.strip_prefix(DELIMITER) else {
        return (None, raw);
    };

    let yaml_start = if let Some(rest) = after_opening.strip_prefix('\n') {
        rest
    } else if let Some(rest) = after_opening.strip_prefix("\r\n") {
        rest
    } else {
        return (None, raw);
    };

    let mut pos = 0;
    for line in yaml_start.split_inclusive('\n') {
        if line.trim_end_matches(['\r', '\n']) == DELIMITER {
            let yaml = &yaml_start[..pos];
            let rest = &yaml_start[pos + line.len()..];
            return (Some(yaml), rest);
        }
        pos += line.len();
    }

    (None, raw)
}

/// Parse a note into properties and body.
pub fn parse(raw: &str) -> ParsedNote {
    let (yaml, rest) = split_block(raw);

    let Some(yaml) = yaml else {
        return ParsedNote {
            properties: Properties::new(),
            body: raw.to_string(),
            block: BlockState::Absent,
        };
    };

    let body = strip_leading_blank_lines(rest).to_string();

    if yaml.trim().is_empty() {
        return ParsedNote {
            properties: Properties::new(),
            body,
            block: BlockState::Present,
        };
    }

    match serde_yaml::from_str::<serde_yaml::Value>(yaml) {
        Ok(serde_yaml::Value::Mapping(map)) => match yaml_mapping_to_properties(map) {
            Some(properties) => ParsedNote {
                properties,
                body,
                block: BlockState::Present,
            },
            None => {
                warn!("Frontmatter has keys that cannot be kept, treating note as body");
                malformed(raw)
            }
        },
        Ok(serde_yaml::Value::Null) => ParsedNote {
            properties: Properties::new(),
            body,
            block: BlockState::Present,
        },
        Ok(_) => {
            warn!("Frontmatter is not a mapping, treating note as body");
            malformed(raw)
        }
        Err(e) => {
            warn!("Invalid frontmatter YAML, treating note as body: {}", e);
            malformed(raw)
        }
    }
}

/// Re-emit a note: block, one blank line, then the body.
///
/// Empty properties produce the body alone, unless the body itself opens with
/// something that would parse as a block; then an empty block is emitted.
pub fn serialize(properties: &Properties, body: &str) -> Result<String, FrontmatterError> {
    let body = strip_leading_blank_lines(body);
    if properties.is_empty() {
        if split_block(body).0.is_some() {
            return Ok(format!("{DELIMITER}\n{DELIMITER}\n\n{body}"));
        }
        return Ok(body.to_string());
    }

    let mapping: serde_yaml::Mapping = properties
        .iter()
        .map(|(k, v)| (serde_yaml::Value::String(k.clone()), json_to_yaml(v)))
        .collect();
    let yaml = serde_yaml::to_string(&mapping)?;

    Ok(format!("{DELIMITER}\n{yaml}{DELIMITER}\n\n{body}"))
}

fn malformed(raw: &str) -> ParsedNote {
    ParsedNote {
        properties: Properties::new(),
        body: raw.to_string(),
        block: BlockState::Malformed,
    }
}

fn strip_leading_blank_lines(text: &str) -> &str {
    let mut rest = text;
    loop {
        if let Some(next) = rest.strip_prefix('\n') {
            rest = next;
        } else if let Some(next) = rest.strip_prefix("\r\n") {
            rest = next;
        } else {
            return rest;
        }
    }
}

fn json_to_yaml(json: &JsonValue) -> serde_yaml::Value {
    match json {
        JsonValue::Null => serde_yaml::Value::Null,
        JsonValue::Bool(b) => serde_yaml::Value::Bool(*b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                serde_yaml::Value::Number(i.into())
            } else if let Some(u) = n.as_u64() {
                serde_yaml::Value::Number(u.into())
            } else if let Some(f) = n.as_f64() {
                serde_yaml::Value::Number(f.into())
            } else {
                serde_yaml::Value::Null
            }
        }
        JsonValue::String(s) => serde_yaml::Value::String(s.clone()),
        JsonValue::Array(arr) => serde_yaml::Value::Sequence(arr.iter().map(json_to_yaml).collect()),
        JsonValue::Object(obj) => serde_yaml::Value::Mapping(
            obj.iter()
                .map(|(k, v)| (serde_yaml::Value::String(k.clone()), json_to_yaml(v)))
                .collect(),
        ),
    }
}

/// Scalar keys become strings. `None` for complex keys, or when two keys
/// collapse to the same string.
fn yaml_mapping_to_properties(map: serde_yaml::Mapping) -> Option<Properties> {
    let mut properties = Properties::new();
    for (key, value) in map {
        let key = yaml_key(key)?;
        if properties.insert(key, yaml_to_json(value)?).is_some() {
            return None;
        }
    }
    Some(properties)
}

fn yaml_key(key: serde_yaml::Value) -> Option<String> {
    match key {
        serde_yaml::Value::String(s) => Some(s),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Null => Some("null".to_string()),
        serde_yaml::Value::Tagged(tagged) => yaml_key(tagged.value),
        serde_yaml::Value::Sequence(_) | serde_yaml::Value::Mapping(_) => None,
    }
}

fn yaml_to_json(yaml: serde_yaml::Value) -> Option<JsonValue> {
    let json = match yaml {
        serde_yaml::Value::Null => JsonValue::Null,
        serde_yaml::Value::Bool(b) => JsonValue::Bool(b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                JsonValue::Number(i.into())
            } else if let Some(u) = n.as_u64() {
                JsonValue::Number(u.into())
            } else if let Some(f) = n.as_f64() {
                serde_json::Number::from_f64(f)
                    .map(JsonValue::Number)
                    .unwrap_or(JsonValue::Null)
            } else {
                JsonValue::Null
            }
        }
        serde_yaml::Value::String(s) => JsonValue::String(s),
        serde_yaml::Value::Sequence(seq) => JsonValue::Array(
            seq.into_iter()
                .map(yaml_to_json)
                .collect::<Option<Vec<_>>>()?,
        ),
        serde_yaml::Value::Mapping(map) => JsonValue::Object(yaml_mapping_to_properties(map)?),
        serde_yaml::Value::Tagged(tagged) => return yaml_to_json(tagged.value),
    };
    Some(json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn split_note_with_block() {
        let raw = "---\ntitle: Test\n---\n\nContent here";
        let (yaml, rest) = split_block(raw);
        assert_eq!(yaml, Some("title: Test\n"));
        assert_eq!(rest, "\nContent here");
    }

    #[test]
    fn split_note_with_crlf_line_endings() {
        let raw = "---\r\ntitle: Test\r\n---\r\nContent";
        let (yaml, rest) = split_block(raw);
        assert_eq!(yaml, Some("title: Test\r\n"));
        assert_eq!(rest, "Content");
    }

    #[test]
    fn split_note_without_closing_delimiter() {
        let raw = "---\ntitle: Test\nNo closing delimiter";
        let (yaml, rest) = split_block(raw);
        assert!(yaml.is_none());
        assert_eq!(rest, raw);
    }

    #[test]
    fn parse_preserves_property_order() {
        let raw = "---\nzeta: 1\nalpha: 2\nmid: 3\n---\nBody";
        let parsed = parse(raw);
        let keys: Vec<_> = parsed.properties.keys().cloned().collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
        assert_eq!(parsed.block, BlockState::Present);
    }

    #[test]
    fn parse_strips_leading_blank_lines_from_body() {
        let parsed = parse("---\na: 1\n---\n\n\n# Heading\n\ntext");
        assert_eq!(parsed.body, "# Heading\n\ntext");
    }

    #[test]
    fn parse_nested_values() {
        let raw = "---\nauthor:\n  name: Alice\nlist:\n  - a\n  - b\nrating:\n---\n";
        let parsed = parse(raw);
        assert_eq!(parsed.properties["author"], json!({"name": "Alice"}));
        assert_eq!(parsed.properties["list"], json!(["a", "b"]));
        assert_eq!(parsed.properties["rating"], JsonValue::Null);
    }

    #[test]
    fn malformed_block_is_treated_as_body() {
        let raw = "---\nkey: [unclosed\n---\nBody";
        let parsed = parse(raw);
        assert_eq!(parsed.block, BlockState::Malformed);
        assert!(parsed.properties.is_empty());
        assert_eq!(parsed.body, raw);
    }

    #[test]
    fn scalar_block_is_malformed() {
        let parsed = parse("---\njust a string\n---\nBody");
        assert_eq!(parsed.block, BlockState::Malformed);
    }

    #[test]
    fn empty_block_is_present_with_no_properties() {
        let parsed = parse("---\n---\nContent");
        assert_eq!(parsed.block, BlockState::Present);
        assert!(parsed.properties.is_empty());
        assert_eq!(parsed.body, "Content");
    }

    #[test]
    fn serialize_emits_one_blank_line_before_body() {
        let mut props = Properties::new();
        props.insert("rating".into(), json!(""));
        props.insert("author".into(), json!("unknown"));
        let text = serialize(&props, "\n\nBody").unwrap();
        assert_eq!(text, "---\nrating: ''\nauthor: unknown\n---\n\nBody");
    }

    #[test]
    fn serialize_without_properties_returns_body() {
        assert_eq!(serialize(&Properties::new(), "Body").unwrap(), "Body");
    }

    #[test]
    fn scalar_keys_are_kept_as_strings() {
        let parsed = parse("---\n2024: read twice\ntrue: kept\n~: nothing\n---\nBody");
        assert_eq!(parsed.block, BlockState::Present);
        assert_eq!(parsed.properties["2024"], json!("read twice"));
        assert_eq!(parsed.properties["true"], json!("kept"));
        assert_eq!(parsed.properties["null"], json!("nothing"));

        let text = serialize(&parsed.properties, &parsed.body).unwrap();
        assert_eq!(parse(&text).properties, parsed.properties);
    }

    #[test]
    fn complex_or_colliding_keys_are_malformed() {
        let complex = parse("---\n? [a, b]\n: x\n---\nBody");
        assert_eq!(complex.block, BlockState::Malformed);

        let nested = parse("---\nouter:\n  ? {a: 1}\n  : x\n---\nBody");
        assert_eq!(nested.block, BlockState::Malformed);

        let colliding = parse("---\n1: number\n'1': string\n---\nBody");
        assert_eq!(colliding.block, BlockState::Malformed);
    }

    #[test]
    fn empty_properties_keep_body_rules_out_of_the_block() {
        let body = "---\nnot: frontmatter\n---\ntext";
        let text = serialize(&Properties::new(), body).unwrap();
        assert_eq!(text, "---\n---\n\n---\nnot: frontmatter\n---\ntext");

        let reparsed = parse(&text);
        assert_eq!(reparsed.block, BlockState::Present);
        assert!(reparsed.properties.is_empty());
        assert_eq!(reparsed.body, body);
    }

    #[test]
    fn reparse_of_serialized_note_is_stable() {
        let raw = "---\ntitle: \"5\"\ncount: 3\nratio: 0.5\ndraft: false\nempty: ''\nnothing: null\n\
                   tags:\n  - mt/Book\nnested:\n  b: 1\n  a: 2\n---\n# Note\n\n---\nafter rule";
        let first = parse(raw);
        let text = serialize(&first.properties, &first.body).unwrap();
        let second = parse(&text);
        assert_eq!(first.properties, second.properties);
        assert_eq!(first.body, second.body);
        let nested_keys: Vec<_> = second.properties["nested"]
            .as_object()
            .unwrap()
            .keys()
            .cloned()
            .collect();
        assert_eq!(nested_keys, vec!["b", "a"]);
    }
}
