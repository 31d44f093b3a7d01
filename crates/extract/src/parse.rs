//! Lenient recovery of structured data from raw model text.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

use crate::normalizer::is_null_marker;
use crate::schema::SchemaSpec;

static FENCED_JSON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").expect("valid fence regex")
});

static TAGGED_JSON: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<json>(.*?)</json>").expect("valid tag regex"));

/// Candidate JSON texts, most specific first.
fn candidates(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    if let Some(c) = FENCED_JSON.captures(text) {
        out.push(c[1].trim().to_string());
    }
    if let Some(c) = TAGGED_JSON.captures(text) {
        out.push(c[1].trim().to_string());
    }
    out.push(text.trim().to_string());

    // Trim trailing chatter after the last closing brace
    if let (Some(start), Some(end)) = (text.find(['{', '[']), text.rfind(['}', ']'])) {
        if start < end {
            out.push(text[start..=end].to_string());
        }
    }
    out
}

/// Accept `{"data": [...]}`, `{"data": {...}}`, a bare object, or a bare array.
fn items_from(value: Value) -> Option<Vec<Value>> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(mut obj) => match obj.remove("data") {
            Some(Value::Array(items)) if obj.is_empty() => Some(items),
            Some(item @ Value::Object(_)) if obj.is_empty() => Some(vec![item]),
            Some(Value::Null) if obj.is_empty() => Some(Vec::new()),
            Some(other) => {
                obj.insert("data".to_string(), other);
                Some(vec![Value::Object(obj)])
            }
            None => Some(vec![Value::Object(obj)]),
        },
        _ => None,
    }
}

/// Parse the model's answer into raw items. On failure the error explains what
/// was wrong so it can be fed back to the model.
pub fn parse_items(text: &str, schema: &SchemaSpec) -> Result<Vec<Value>, String> {
    if text.trim().is_empty() {
        return Err("the response was empty".to_string());
    }

    let mut last_error = None;
    for candidate in candidates(text) {
        match serde_json::from_str::<Value>(&candidate) {
            Ok(value) => match items_from(value) {
                Some(items) => return Ok(items),
                None => last_error = Some("the JSON was neither an object nor an array".to_string()),
            },
            Err(e) => {
                if last_error.is_none() {
                    last_error = Some(format!("it was not valid JSON ({})", e));
                }
            }
        }
    }

    if let Some(item) = parse_markdown_table(text, schema) {
        return Ok(vec![Value::Object(item)]);
    }

    Err(last_error.unwrap_or_else(|| "no JSON object was found".to_string()))
}

fn normalize_label(label: &str) -> String {
    label
        .trim()
        .trim_matches('*')
        .trim()
        .to_lowercase()
        .replace(['_', '-'], " ")
}

/// Map a two-column "Quantity | Extracted Value" table onto schema fields by
/// display name. Returns `None` when no row matches a field.
pub fn parse_markdown_table(text: &str, schema: &SchemaSpec) -> Option<Map<String, Value>> {
    let mut item = Map::new();

    for line in text.lines() {
        let line = line.trim();
        if !line.starts_with('|') {
            continue;
        }
        let cells: Vec<&str> = line.trim_matches('|').split('|').map(str::trim).collect();
        if cells.len() < 2 {
            continue;
        }
        if cells.iter().all(|c| c.chars().all(|ch| matches!(ch, '-' | ':' | ' '))) {
            continue;
        }

        let label = normalize_label(cells[0]);
        let Some(field) = schema
            .fields
            .iter()
            .find(|f| normalize_label(&f.name) == label || f.display_name().to_lowercase() == label)
        else {
            continue;
        };

        let raw = cells[1];
        let value = if is_null_marker(raw) {
            Value::Null
        } else {
            Value::String(raw.to_string())
        };
        item.insert(field.name.clone(), value);
    }

    if item.is_empty() { None } else { Some(item) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::build_static_schema;
    use serde_json::json;

    #[test]
    fn test_fenced_block_preferred() {
        let schema = build_static_schema();
        let text = "Here you go:\n```json\n{\"data\": [{\"doi\": \"10.1/x\"}]}\n```\nThanks";
        assert_eq!(parse_items(text, &schema).unwrap(), vec![json!({"doi": "10.1/x"})]);
    }

    #[test]
    fn test_tagged_and_trailing_text() {
        let schema = build_static_schema();
        let tagged = "<json>[{\"year\": 2020}]</json>";
        assert_eq!(parse_items(tagged, &schema).unwrap(), vec![json!({"year": 2020})]);

        let chatty = "Result: {\"year\": 2020} hope this helps";
        assert_eq!(parse_items(chatty, &schema).unwrap(), vec![json!({"year": 2020})]);
    }

    #[test]
    fn test_bare_object_and_null_data() {
        let schema = build_static_schema();
        assert_eq!(parse_items("{\"doi\": null}", &schema).unwrap().len(), 1);
        assert!(parse_items("{\"data\": null}", &schema).unwrap().is_empty());
    }

    #[test]
    fn test_markdown_table_fallback() {
        let schema = build_static_schema();
        let text = "| Quantity | Extracted Value |\n|---|---|\n| Switching Layer Material | CuO |\n| Endurance Cycles | 50 cycles |\n| Top Electrode | N/A |";
        let items = parse_items(text, &schema).unwrap();
        assert_eq!(
            items[0],
            json!({"switching_layer_material": "CuO", "endurance_cycles": "50 cycles", "top_electrode": null})
        );
    }

    #[test]
    fn test_garbage_reports_reason() {
        let schema = build_static_schema();
        let err = parse_items("{not json at all", &schema).unwrap_err();
        assert!(err.contains("not valid JSON"));
        assert!(parse_items("   ", &schema).unwrap_err().contains("empty"));
    }
}
